use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Declined,
    Timeout,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Declined => "declined",
            CallStatus::Timeout => "timeout",
            CallStatus::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Timeout | CallStatus::Ended
        )
    }

    /// Whether a write of `next` over a row currently in `self` changes it.
    /// Nothing ever returns to `ringing`, and terminal rows are frozen.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match (self, next) {
            (CallStatus::Ringing, CallStatus::Ringing) => false,
            (CallStatus::Ringing, _) => true,
            (CallStatus::Accepted, CallStatus::Ended) => true,
            _ => false,
        }
    }

    /// Statuses a row may currently hold for a write of `next` to apply.
    /// Backends use this as the guard of their conditional update.
    pub fn sources_for(next: CallStatus) -> &'static [CallStatus] {
        match next {
            CallStatus::Ringing => &[],
            CallStatus::Accepted | CallStatus::Declined | CallStatus::Timeout => {
                &[CallStatus::Ringing]
            }
            CallStatus::Ended => &[CallStatus::Ringing, CallStatus::Accepted],
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ringing" => Ok(CallStatus::Ringing),
            "accepted" => Ok(CallStatus::Accepted),
            "declined" => Ok(CallStatus::Declined),
            "timeout" => Ok(CallStatus::Timeout),
            "ended" => Ok(CallStatus::Ended),
            other => Err(anyhow::anyhow!("unknown call status: {}", other)),
        }
    }
}

/// One call attempt. The status/timestamp fields are the audit trail; rows are
/// never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: String,
    pub plate: String,
    pub owner_id: String,
    pub channel: String,
    pub status: CallStatus,
    #[serde(default)]
    pub caller_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Insert payload; the store assigns nothing, the id is generated here so
/// every backend produces the same row shape.
#[derive(Clone, Debug, Serialize)]
pub struct NewCallSession {
    pub plate: String,
    pub owner_id: String,
    pub caller_info: serde_json::Value,
}

impl NewCallSession {
    pub fn into_session(self, now: DateTime<Utc>) -> CallSession {
        CallSession {
            id: Uuid::new_v4().to_string(),
            channel: self.plate.clone(),
            plate: self.plate,
            owner_id: self.owner_id,
            status: CallStatus::Ringing,
            caller_info: self.caller_info,
            created_at: now,
            accepted_at: None,
            ended_at: None,
        }
    }
}

impl CallSession {
    /// A ringing row older than the staleness window is treated as timed out
    /// by every client even if no `timeout` write has happened yet.
    pub fn is_fresh(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        self.created_at > now - staleness
    }

    pub fn is_ringing_and_fresh(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        self.status == CallStatus::Ringing && self.is_fresh(now, staleness)
    }

    /// Returns the row after moving to `next`, or `None` when the write would
    /// be a no-op (illegal or already applied).
    pub fn transitioned(&self, next: CallStatus, now: DateTime<Utc>) -> Option<CallSession> {
        if !self.status.can_transition_to(next) {
            return None;
        }
        let mut row = self.clone();
        row.status = next;
        match next {
            CallStatus::Accepted => {
                if row.accepted_at.is_none() {
                    row.accepted_at = Some(now);
                }
            }
            CallStatus::Ended => {
                if row.ended_at.is_none() {
                    row.ended_at = Some(now);
                }
            }
            CallStatus::Declined | CallStatus::Timeout | CallStatus::Ringing => {}
        }
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ringing() -> CallSession {
        NewCallSession {
            plate: "UP14AB1234".to_string(),
            owner_id: "U1".to_string(),
            caller_info: serde_json::json!({"via": "api"}),
        }
        .into_session(Utc::now())
    }

    #[test]
    fn test_new_session_channel_is_plate() {
        let row = ringing();
        assert_eq!(row.channel, "UP14AB1234");
        assert_eq!(row.status, CallStatus::Ringing);
        assert!(row.accepted_at.is_none());
        assert!(row.ended_at.is_none());
    }

    #[test]
    fn test_transition_timestamps() {
        let now = Utc::now();
        let accepted = ringing().transitioned(CallStatus::Accepted, now).unwrap();
        assert_eq!(accepted.accepted_at, Some(now));
        assert!(accepted.ended_at.is_none());

        let later = now + Duration::seconds(30);
        let ended = accepted.transitioned(CallStatus::Ended, later).unwrap();
        assert_eq!(ended.accepted_at, Some(now));
        assert_eq!(ended.ended_at, Some(later));

        let declined = ringing().transitioned(CallStatus::Declined, now).unwrap();
        assert!(declined.accepted_at.is_none());
        assert!(declined.ended_at.is_none());
    }

    #[test]
    fn test_terminal_rows_are_frozen() {
        let now = Utc::now();
        let declined = ringing().transitioned(CallStatus::Declined, now).unwrap();
        for next in [
            CallStatus::Ringing,
            CallStatus::Accepted,
            CallStatus::Declined,
            CallStatus::Timeout,
            CallStatus::Ended,
        ] {
            assert!(declined.transitioned(next, now).is_none(), "{next}");
        }
        let accepted = ringing().transitioned(CallStatus::Accepted, now).unwrap();
        assert!(accepted.transitioned(CallStatus::Declined, now).is_none());
        assert!(accepted.transitioned(CallStatus::Ringing, now).is_none());
    }

    #[test]
    fn test_freshness() {
        let mut row = ringing();
        let window = Duration::minutes(2);
        assert!(row.is_ringing_and_fresh(Utc::now(), window));
        row.created_at = Utc::now() - Duration::minutes(5);
        assert!(!row.is_ringing_and_fresh(Utc::now(), window));
    }

    #[test]
    fn test_status_wire_format() {
        let row = ringing();
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["status"], "ringing");
        assert_eq!(json["channel"], "UP14AB1234");
        assert!(json["accepted_at"].is_null());
        assert_eq!("Ended".parse::<CallStatus>().unwrap(), CallStatus::Ended);
        assert!("bogus".parse::<CallStatus>().is_err());
    }
}
