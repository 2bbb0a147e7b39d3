use super::{
    MediaAdapter, MediaError, MediaEvent, MediaEventSender, MediaHandle, MediaJoin,
    RemoteParticipant,
};
use crate::admission::AdmissionToken;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub fn credentials(channel: &str) -> AdmissionToken {
    AdmissionToken {
        app_id: "app".to_string(),
        channel: channel.to_string(),
        uid: 0,
        token: "006app".to_string(),
        expire_at: 0,
    }
}

#[derive(Default)]
pub struct MediaStats {
    joined: AtomicUsize,
    published: AtomicUsize,
    subscribed: AtomicUsize,
    left: AtomicUsize,
    renewed: AtomicUsize,
}

impl MediaStats {
    pub fn joined(&self) -> usize {
        self.joined.load(Ordering::SeqCst)
    }
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
    pub fn subscribed(&self) -> usize {
        self.subscribed.load(Ordering::SeqCst)
    }
    pub fn left(&self) -> usize {
        self.left.load(Ordering::SeqCst)
    }
    pub fn renewed(&self) -> usize {
        self.renewed.load(Ordering::SeqCst)
    }
}

pub struct FakeMediaAdapter {
    pub stats: Arc<MediaStats>,
    remotes: Vec<u32>,
    join_error: Option<MediaError>,
    publish_error: Option<MediaError>,
    leave_error: Option<MediaError>,
    events: Mutex<Option<MediaEventSender>>,
}

impl FakeMediaAdapter {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MediaStats::default()),
            remotes: Vec::new(),
            join_error: None,
            publish_error: None,
            leave_error: None,
            events: Mutex::new(None),
        }
    }

    pub fn with_remotes(mut self, remotes: Vec<u32>) -> Self {
        self.remotes = remotes;
        self
    }

    pub fn failing_join(mut self, err: MediaError) -> Self {
        self.join_error = Some(err);
        self
    }

    pub fn failing_publish(mut self, err: MediaError) -> Self {
        self.publish_error = Some(err);
        self
    }

    pub fn failing_leave(mut self, err: MediaError) -> Self {
        self.leave_error = Some(err);
        self
    }

    pub fn emit(&self, event: MediaEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            tx.send(event).ok();
        }
    }
}

struct FakeHandle {
    channel: String,
    remotes: Vec<u32>,
    stats: Arc<MediaStats>,
    publish_error: Option<MediaError>,
    leave_error: Option<MediaError>,
}

#[async_trait]
impl MediaAdapter for FakeMediaAdapter {
    async fn join(&self, credentials: &AdmissionToken) -> Result<MediaJoin, MediaError> {
        if let Some(err) = &self.join_error {
            return Err(err.clone());
        }
        self.stats.joined.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok(MediaJoin {
            handle: Box::new(FakeHandle {
                channel: credentials.channel.clone(),
                remotes: self.remotes.clone(),
                stats: self.stats.clone(),
                publish_error: self.publish_error.clone(),
                leave_error: self.leave_error.clone(),
            }),
            events: rx,
        })
    }
}

#[async_trait]
impl MediaHandle for FakeHandle {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn remote_participants(&self) -> Vec<RemoteParticipant> {
        self.remotes
            .iter()
            .map(|uid| RemoteParticipant { uid: *uid })
            .collect()
    }

    async fn publish_local_audio(&mut self) -> Result<(), MediaError> {
        if let Some(err) = &self.publish_error {
            return Err(err.clone());
        }
        self.stats.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&mut self, _remote: RemoteParticipant) -> Result<(), MediaError> {
        self.stats.subscribed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn renew_token(&mut self, _credentials: &AdmissionToken) -> Result<(), MediaError> {
        self.stats.renewed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), MediaError> {
        self.stats.left.fetch_add(1, Ordering::SeqCst);
        match &self.leave_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
