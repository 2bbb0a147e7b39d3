use super::{
    MediaAdapter, MediaError, MediaEvent, MediaEventReceiver, MediaHandle, MediaJoin,
    RemoteParticipant,
};
use crate::admission::AdmissionToken;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// The media participation owned by one engine instance: join, publish the
/// local microphone, and keep every remote participant subscribed.
pub struct ActiveMedia {
    handle: Box<dyn MediaHandle>,
    events: MediaEventReceiver,
    subscribed: HashSet<RemoteParticipant>,
}

impl ActiveMedia {
    /// Join and publish. On a publish failure the half-joined room is left
    /// before the error is returned.
    pub async fn connect(
        adapter: &dyn MediaAdapter,
        credentials: &AdmissionToken,
    ) -> Result<Self, MediaError> {
        let MediaJoin { mut handle, events } = adapter.join(credentials).await?;
        if let Err(e) = handle.publish_local_audio().await {
            if let Err(leave_err) = handle.leave().await {
                warn!(channel = credentials.channel, "leave after failed publish: {}", leave_err);
            }
            return Err(e);
        }
        let mut active = Self {
            handle,
            events,
            subscribed: HashSet::new(),
        };
        for remote in active.handle.remote_participants() {
            active.subscribe(remote).await;
        }
        info!(channel = credentials.channel, "media joined");
        Ok(active)
    }

    pub fn channel(&self) -> &str {
        self.handle.channel()
    }

    pub fn is_subscribed(&self, uid: u32) -> bool {
        self.subscribed.contains(&RemoteParticipant { uid })
    }

    pub async fn next_event(&mut self) -> Option<MediaEvent> {
        self.events.recv().await
    }

    /// Apply a remote participant change. Token expiry is left to the caller,
    /// which owns admission.
    pub async fn on_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::TokenWillExpire => {}
            MediaEvent::RemotePublished(remote) => self.subscribe(remote).await,
            MediaEvent::RemoteLeft(remote) => {
                debug!(channel = self.channel(), uid = remote.uid, "remote left");
                self.subscribed.remove(&remote);
            }
        }
    }

    pub async fn renew_token(&mut self, credentials: &AdmissionToken) -> Result<(), MediaError> {
        self.handle.renew_token(credentials).await
    }

    async fn subscribe(&mut self, remote: RemoteParticipant) {
        if self.subscribed.contains(&remote) {
            return;
        }
        // a failed subscribe leaves the call up; the remote may republish
        match self.handle.subscribe(remote).await {
            Ok(()) => {
                self.subscribed.insert(remote);
            }
            Err(e) => warn!(channel = self.channel(), uid = remote.uid, "subscribe failed: {}", e),
        }
    }

    pub async fn leave(mut self) -> Result<(), MediaError> {
        let result = self.handle.leave().await;
        info!(channel = self.channel(), ok = result.is_ok(), "media left");
        result
    }
}
