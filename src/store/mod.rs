use crate::config::StoreConfig;
use crate::models::{CallSession, CallStatus, NewCallSession, Vehicle};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

pub mod memory;
pub mod rest;

pub use memory::MemoryStore;
pub use rest::RestStore;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{0}")]
    Backend(String),
    #[error("call session {0} not found")]
    SessionNotFound(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Read side of the vehicle registry. Every lookup can be restricted to
/// active rows; the resolver asks without the filter only to tell "disabled"
/// apart from "not found".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VehicleDirectory: Send + Sync {
    async fn find_exact(&self, plate: &str, active_only: bool)
        -> Result<Option<Vehicle>, StoreError>;
    async fn find_case_insensitive(
        &self,
        plate: &str,
        active_only: bool,
    ) -> Result<Option<Vehicle>, StoreError>;
    async fn find_containing(
        &self,
        fragment: &str,
        active_only: bool,
        limit: usize,
    ) -> Result<Vec<Vehicle>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The write won; carries the updated row.
    Applied(CallSession),
    /// The row was already past the requested state; carries the row as stored.
    Unchanged(CallSession),
}

impl TransitionOutcome {
    pub fn row(&self) -> &CallSession {
        match self {
            TransitionOutcome::Applied(row) | TransitionOutcome::Unchanged(row) => row,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Durable log of call attempts. `transition` is a conditional update: it only
/// applies when the stored status permits the move, so concurrent writers are
/// resolved first-write-wins.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert(&self, new: NewCallSession) -> Result<CallSession, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<CallSession>, StoreError>;
    async fn transition(
        &self,
        id: &str,
        next: CallStatus,
    ) -> Result<TransitionOutcome, StoreError>;
    /// Newest ringing row for `owner_id` created after `since`.
    async fn latest_ringing(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallSession>, StoreError>;
    /// Ringing rows created before `cutoff`, oldest first.
    async fn ringing_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallSession>, StoreError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionChange {
    pub kind: ChangeKind,
    pub row: CallSession,
}

pub type ChangeSender = broadcast::Sender<SessionChange>;

#[derive(Debug)]
pub enum FeedItem {
    Change(SessionChange),
    /// Events were dropped; the caller should fall back to polling.
    Lagged(u64),
    Closed,
}

/// A live subscription to insert/update events, filtered to one owner.
pub struct FeedSubscription {
    owner_id: String,
    rx: broadcast::Receiver<SessionChange>,
}

impl FeedSubscription {
    pub fn new(owner_id: &str, rx: broadcast::Receiver<SessionChange>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            rx,
        }
    }

    pub async fn next(&mut self) -> FeedItem {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.row.owner_id == self.owner_id => {
                    return FeedItem::Change(change)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return FeedItem::Lagged(n),
                Err(broadcast::error::RecvError::Closed) => return FeedItem::Closed,
            }
        }
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, owner_id: &str) -> Result<FeedSubscription, StoreError>;
}

/// The three external collaborators the signaling core talks to.
#[derive(Clone)]
pub struct Backends {
    pub directory: Arc<dyn VehicleDirectory>,
    pub calls: Arc<dyn CallStore>,
    /// `None` when the backend has no push channel; clients then rely on polling.
    pub feed: Option<Arc<dyn ChangeFeed>>,
}

impl Backends {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            directory: store.clone(),
            calls: store.clone(),
            feed: Some(store),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match config {
            StoreConfig::Memory { vehicles } => {
                info!("using memory store, vehicles: {}", vehicles.len());
                Ok(Self::memory(Arc::new(MemoryStore::with_vehicles(
                    vehicles.clone(),
                ))))
            }
            StoreConfig::Rest { url, key } => {
                let url = url
                    .clone()
                    .or_else(|| std::env::var("PLATECALL_REST_URL").ok())
                    .ok_or_else(|| anyhow::anyhow!("store.url is required for rest store"))?;
                let key = key
                    .clone()
                    .or_else(|| std::env::var("PLATECALL_REST_KEY").ok())
                    .ok_or_else(|| anyhow::anyhow!("store.key is required for rest store"))?;
                info!("using rest store at {}", url);
                let store = Arc::new(RestStore::new(&url, &key));
                Ok(Self {
                    directory: store.clone(),
                    calls: store,
                    feed: None,
                })
            }
        }
    }
}
