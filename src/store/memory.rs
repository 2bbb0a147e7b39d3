use super::{
    CallStore, ChangeFeed, ChangeKind, ChangeSender, FeedSubscription, SessionChange, StoreError,
    TransitionOutcome, VehicleDirectory,
};
use crate::models::{CallSession, CallStatus, NewCallSession, Vehicle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

const FEED_CAPACITY: usize = 256;

/// In-process tables with a broadcast change feed. Vehicles keep insertion
/// order so "first candidate" is deterministic.
pub struct MemoryStore {
    vehicles: RwLock<Vec<Vehicle>>,
    sessions: Mutex<HashMap<String, CallSession>>,
    changes: ChangeSender,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_vehicles(Vec::new())
    }

    pub fn with_vehicles(vehicles: Vec<Vehicle>) -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            vehicles: RwLock::new(vehicles),
            sessions: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub async fn upsert_vehicle(&self, vehicle: Vehicle) {
        let mut vehicles = self.vehicles.write().await;
        match vehicles.iter_mut().find(|v| v.plate == vehicle.plate) {
            Some(existing) => *existing = vehicle,
            None => vehicles.push(vehicle),
        }
    }

    pub async fn set_vehicle_active(&self, plate: &str, active: bool) -> bool {
        let mut vehicles = self.vehicles.write().await;
        match vehicles.iter_mut().find(|v| v.plate == plate) {
            Some(vehicle) => {
                vehicle.active = active;
                true
            }
            None => false,
        }
    }

    /// Store a row as-is without emitting a change event, e.g. a row written
    /// while no subscriber was connected.
    pub async fn seed_session(&self, row: CallSession) {
        self.sessions.lock().await.insert(row.id.clone(), row);
    }

    pub async fn sessions(&self) -> Vec<CallSession> {
        let mut rows: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }

    fn publish(&self, kind: ChangeKind, row: &CallSession) {
        // no receivers is fine: nobody is listening
        if self
            .changes
            .send(SessionChange {
                kind,
                row: row.clone(),
            })
            .is_err()
        {
            debug!(session_id = row.id, "change dropped, no subscribers");
        }
    }

    async fn filtered<F>(&self, active_only: bool, pred: F) -> Vec<Vehicle>
    where
        F: Fn(&Vehicle) -> bool,
    {
        self.vehicles
            .read()
            .await
            .iter()
            .filter(|v| !active_only || v.active)
            .filter(|v| pred(*v))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VehicleDirectory for MemoryStore {
    async fn find_exact(
        &self,
        plate: &str,
        active_only: bool,
    ) -> Result<Option<Vehicle>, StoreError> {
        Ok(self
            .filtered(active_only, |v| v.plate == plate)
            .await
            .into_iter()
            .next())
    }

    async fn find_case_insensitive(
        &self,
        plate: &str,
        active_only: bool,
    ) -> Result<Option<Vehicle>, StoreError> {
        let needle = plate.to_uppercase();
        Ok(self
            .filtered(active_only, |v| v.plate.to_uppercase() == needle)
            .await
            .into_iter()
            .next())
    }

    async fn find_containing(
        &self,
        fragment: &str,
        active_only: bool,
        limit: usize,
    ) -> Result<Vec<Vehicle>, StoreError> {
        let needle = fragment.to_uppercase();
        let mut found = self
            .filtered(active_only, |v| v.plate.to_uppercase().contains(&needle))
            .await;
        found.truncate(limit);
        Ok(found)
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn insert(&self, new: NewCallSession) -> Result<CallSession, StoreError> {
        let row = new.into_session(Utc::now());
        self.sessions
            .lock()
            .await
            .insert(row.id.clone(), row.clone());
        self.publish(ChangeKind::Insert, &row);
        Ok(row)
    }

    async fn get(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &str,
        next: CallStatus,
    ) -> Result<TransitionOutcome, StoreError> {
        let outcome = {
            let mut sessions = self.sessions.lock().await;
            let current = sessions
                .get_mut(id)
                .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
            match current.transitioned(next, Utc::now()) {
                Some(updated) => {
                    *current = updated.clone();
                    TransitionOutcome::Applied(updated)
                }
                None => TransitionOutcome::Unchanged(current.clone()),
            }
        };
        if let TransitionOutcome::Applied(row) = &outcome {
            self.publish(ChangeKind::Update, row);
        }
        Ok(outcome)
    }

    async fn latest_ringing(
        &self,
        owner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CallSession>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .await
            .values()
            .filter(|row| {
                row.owner_id == owner_id
                    && row.status == CallStatus::Ringing
                    && row.created_at > since
            })
            .max_by_key(|row| row.created_at)
            .cloned())
    }

    async fn ringing_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallSession>, StoreError> {
        let mut rows: Vec<_> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|row| row.status == CallStatus::Ringing && row.created_at < cutoff)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, owner_id: &str) -> Result<FeedSubscription, StoreError> {
        Ok(FeedSubscription::new(owner_id, self.changes.subscribe()))
    }
}
