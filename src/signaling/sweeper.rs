use crate::models::CallStatus;
use crate::store::{CallStore, StoreError};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SWEEP_BATCH: usize = 100;

/// Writes `timeout` for rows left ringing past the staleness window, so the
/// audit trail matches what clients already assume.
pub struct ExpirySweeper {
    calls: Arc<dyn CallStore>,
    staleness: Duration,
    interval: std::time::Duration,
}

impl ExpirySweeper {
    pub fn new(
        calls: Arc<dyn CallStore>,
        staleness: Duration,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            calls,
            staleness,
            interval,
        }
    }

    /// One pass; returns how many rows were timed out by this call.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.staleness;
        let mut expired = 0;
        for row in self.calls.ringing_before(cutoff, SWEEP_BATCH).await? {
            // losing the race to accept/decline is fine, the row is closed either way
            if self
                .calls
                .transition(&row.id, CallStatus::Timeout)
                .await?
                .is_applied()
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    pub async fn run(self, token: CancellationToken) {
        info!("expiry sweeper started, interval: {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(0) => {}
                    Ok(n) => info!(expired = n, "timed out stale ringing calls"),
                    Err(e) => warn!("expiry sweep failed: {}", e),
                },
            }
        }
        info!("expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCallSession;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_sweep_times_out_only_stale_ringing_rows() {
        let store = Arc::new(MemoryStore::new());
        let fresh = store
            .insert(NewCallSession {
                plate: "UP14AB1234".to_string(),
                owner_id: "U1".to_string(),
                caller_info: serde_json::Value::Null,
            })
            .await
            .unwrap();
        let mut stale = NewCallSession {
            plate: "UP14AB1234".to_string(),
            owner_id: "U1".to_string(),
            caller_info: serde_json::Value::Null,
        }
        .into_session(Utc::now());
        stale.created_at = Utc::now() - Duration::minutes(10);
        store.seed_session(stale.clone()).await;

        let sweeper = ExpirySweeper::new(
            store.clone(),
            Duration::minutes(2),
            std::time::Duration::from_secs(30),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        let stale = store.get(&stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, CallStatus::Timeout);
        assert!(stale.ended_at.is_none());
        let fresh = store.get(&fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = ExpirySweeper::new(
            store,
            Duration::minutes(2),
            std::time::Duration::from_millis(10),
        );
        let token = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(token.clone()));
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
