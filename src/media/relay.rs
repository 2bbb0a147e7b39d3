use super::{
    MediaAdapter, MediaError, MediaEvent, MediaEventSender, MediaHandle, MediaJoin,
    RemoteParticipant,
};
use crate::admission::AdmissionToken;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// What the browser-side media client is asked to do.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RelayInstruction {
    Join { credentials: AdmissionToken },
    Publish { channel: String },
    Subscribe { channel: String, uid: u32 },
    RenewToken { credentials: AdmissionToken },
    Leave { channel: String },
}

/// What the browser-side media client reports back.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayReport {
    Joined { remote_uids: Vec<u32> },
    JoinFailed { reason: String, permission_denied: bool },
    RemotePublished { uid: u32 },
    RemoteLeft { uid: u32 },
    TokenWillExpire,
}

#[derive(Default)]
struct RelayState {
    pending_join: Option<oneshot::Sender<Result<Vec<u32>, MediaError>>>,
    /// Channel of a join given up on before the client confirmed it. A late
    /// confirmation for it is answered with a leave.
    abandoned: Option<String>,
    events: Option<MediaEventSender>,
}

/// Media adapter for clients that run the media SDK themselves. Instructions
/// go out over the console socket; join results and remote participant
/// changes come back through [`RelayMediaAdapter::report`].
#[derive(Clone)]
pub struct RelayMediaAdapter {
    outbound: mpsc::UnboundedSender<RelayInstruction>,
    state: Arc<Mutex<RelayState>>,
    join_timeout: Duration,
}

fn disconnected() -> MediaError {
    MediaError::Network("media client disconnected".to_string())
}

impl RelayMediaAdapter {
    pub fn new(outbound: mpsc::UnboundedSender<RelayInstruction>) -> Self {
        Self {
            outbound,
            state: Arc::new(Mutex::new(RelayState::default())),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn report(&self, report: RelayReport) {
        let Ok(mut state) = self.state.lock() else {
            warn!("relay state poisoned, dropping report");
            return;
        };
        match report {
            RelayReport::Joined { remote_uids } => match state.pending_join.take() {
                Some(tx) => {
                    tx.send(Ok(remote_uids)).ok();
                }
                None => match state.abandoned.take() {
                    Some(channel) => {
                        debug!(channel, "late join confirmation, leaving");
                        self.send(RelayInstruction::Leave { channel }).ok();
                    }
                    None => debug!("unexpected joined report"),
                },
            },
            RelayReport::JoinFailed {
                reason,
                permission_denied,
            } => {
                let err = if permission_denied {
                    MediaError::PermissionDenied(reason)
                } else {
                    MediaError::Join(reason)
                };
                match state.pending_join.take() {
                    Some(tx) => {
                        tx.send(Err(err)).ok();
                    }
                    None => debug!("unexpected join failure report: {}", err),
                }
            }
            RelayReport::RemotePublished { uid } => {
                if let Some(events) = &state.events {
                    events
                        .send(MediaEvent::RemotePublished(RemoteParticipant { uid }))
                        .ok();
                }
            }
            RelayReport::RemoteLeft { uid } => {
                if let Some(events) = &state.events {
                    events
                        .send(MediaEvent::RemoteLeft(RemoteParticipant { uid }))
                        .ok();
                }
            }
            RelayReport::TokenWillExpire => {
                if let Some(events) = &state.events {
                    events.send(MediaEvent::TokenWillExpire).ok();
                }
            }
        }
    }

    fn send(&self, instruction: RelayInstruction) -> Result<(), MediaError> {
        self.outbound.send(instruction).map_err(|_| disconnected())
    }

    fn clear_pending(&self, abandoned: Option<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_join = None;
            state.abandoned = abandoned;
        }
    }
}

#[async_trait]
impl MediaAdapter for RelayMediaAdapter {
    async fn join(&self, credentials: &AdmissionToken) -> Result<MediaJoin, MediaError> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .map_err(|_| MediaError::Other("relay state poisoned".to_string()))?
            .pending_join = Some(tx);
        self.send(RelayInstruction::Join {
            credentials: credentials.clone(),
        })?;

        // the console going away ends the wait early; nobody is left to confirm
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.join_timeout, rx) => outcome,
            _ = self.outbound.closed() => {
                self.clear_pending(None);
                return Err(disconnected());
            }
        };
        let remote_uids = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(disconnected()),
            Err(_) => {
                let channel = credentials.channel.clone();
                warn!(channel, "no join confirmation within {:?}, leaving", self.join_timeout);
                self.clear_pending(Some(channel.clone()));
                self.send(RelayInstruction::Leave { channel }).ok();
                return Err(MediaError::Join(format!(
                    "no join confirmation within {:?}",
                    self.join_timeout
                )));
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.events = Some(events_tx);
        }
        Ok(MediaJoin {
            handle: Box::new(RelayHandle {
                channel: credentials.channel.clone(),
                remotes: remote_uids
                    .into_iter()
                    .map(|uid| RemoteParticipant { uid })
                    .collect(),
                relay: self.clone(),
            }),
            events: events_rx,
        })
    }
}

struct RelayHandle {
    channel: String,
    remotes: Vec<RemoteParticipant>,
    relay: RelayMediaAdapter,
}

#[async_trait]
impl MediaHandle for RelayHandle {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn remote_participants(&self) -> Vec<RemoteParticipant> {
        self.remotes.clone()
    }

    async fn publish_local_audio(&mut self) -> Result<(), MediaError> {
        self.relay.send(RelayInstruction::Publish {
            channel: self.channel.clone(),
        })
    }

    async fn subscribe(&mut self, remote: RemoteParticipant) -> Result<(), MediaError> {
        self.relay.send(RelayInstruction::Subscribe {
            channel: self.channel.clone(),
            uid: remote.uid,
        })
    }

    async fn renew_token(&mut self, credentials: &AdmissionToken) -> Result<(), MediaError> {
        self.relay.send(RelayInstruction::RenewToken {
            credentials: credentials.clone(),
        })
    }

    async fn leave(&mut self) -> Result<(), MediaError> {
        if let Ok(mut state) = self.relay.state.lock() {
            state.events = None;
        }
        self.relay.send(RelayInstruction::Leave {
            channel: self.channel.clone(),
        })
    }
}
