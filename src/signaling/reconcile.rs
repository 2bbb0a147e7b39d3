use crate::models::CallSession;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

const DISMISSED_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    Push,
    Poll,
}

/// Merges rows arriving by push and by poll into a single "incoming call"
/// decision. A row is surfaced at most once no matter how many times, or by
/// which path, it arrives.
#[derive(Debug)]
pub struct Reconciler {
    staleness: Duration,
    tracked: Option<String>,
    dismissed: VecDeque<String>,
}

impl Reconciler {
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            tracked: None,
            dismissed: VecDeque::with_capacity(DISMISSED_CAPACITY),
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub fn tracked(&self) -> Option<&str> {
        self.tracked.as_deref()
    }

    /// True when `row` should be shown as a new incoming call. Stale or
    /// non-ringing rows, the row already tracked, and rows this client has
    /// already closed are all rejected.
    pub fn offer(&mut self, row: &CallSession, now: DateTime<Utc>) -> bool {
        if !row.is_ringing_and_fresh(now, self.staleness) {
            return false;
        }
        if self.tracked.as_deref() == Some(row.id.as_str()) {
            return false;
        }
        if self.dismissed.iter().any(|id| id == &row.id) {
            return false;
        }
        self.tracked = Some(row.id.clone());
        true
    }

    /// Stop tracking the current row and never surface it again, even if a
    /// status write for it failed and the store still reports it ringing.
    pub fn dismiss(&mut self) {
        if let Some(id) = self.tracked.take() {
            if self.dismissed.len() == DISMISSED_CAPACITY {
                self.dismissed.pop_front();
            }
            self.dismissed.push_back(id);
        }
    }
}
