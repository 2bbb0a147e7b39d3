use crate::admission::AdmissionToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod relay;
pub mod session;
#[cfg(test)]
pub mod test_util;

pub use relay::{RelayInstruction, RelayMediaAdapter, RelayReport};
pub use session::ActiveMedia;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MediaError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("join failed: {0}")]
    Join(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub uid: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MediaEvent {
    RemotePublished(RemoteParticipant),
    RemoteLeft(RemoteParticipant),
    /// The room credentials are about to lapse; the engine re-issues them.
    TokenWillExpire,
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;
pub type MediaEventReceiver = mpsc::UnboundedReceiver<MediaEvent>;

/// A joined room plus the stream of remote participant changes for it.
pub struct MediaJoin {
    pub handle: Box<dyn MediaHandle>,
    pub events: MediaEventReceiver,
}

/// Entry point into the real-time media layer.
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    async fn join(&self, credentials: &AdmissionToken) -> Result<MediaJoin, MediaError>;
}

/// One participation in one room. Dropped after `leave`.
#[async_trait]
pub trait MediaHandle: Send + Sync {
    fn channel(&self) -> &str;
    /// Participants already present when the join completed.
    fn remote_participants(&self) -> Vec<RemoteParticipant>;
    async fn publish_local_audio(&mut self) -> Result<(), MediaError>;
    async fn subscribe(&mut self, remote: RemoteParticipant) -> Result<(), MediaError>;
    async fn renew_token(&mut self, credentials: &AdmissionToken) -> Result<(), MediaError>;
    async fn leave(&mut self) -> Result<(), MediaError>;
}
