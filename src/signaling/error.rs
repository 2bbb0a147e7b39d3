use crate::admission::AdmissionError;
use crate::media::MediaError;
use crate::models::CallStatus;
use crate::store::StoreError;
use thiserror::Error;

/// Why a scanned plate could not be turned into a call target.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Missing plate")]
    EmptyPlate,
    #[error("No owner found for plate \"{raw}\" (normalized \"{plate}\")")]
    NotFound { raw: String, plate: String },
    #[error("Vehicle {plate} has no owner assigned")]
    NoOwner { plate: String },
    #[error("Vehicle {plate} is disabled")]
    Disabled { plate: String },
    #[error("DB error: {0}")]
    Lookup(StoreError),
}

impl ResolveError {
    /// The normalized plate the lookup was attempted with, if any.
    pub fn plate(&self) -> Option<&str> {
        match self {
            ResolveError::NotFound { plate, .. }
            | ResolveError::NoOwner { plate }
            | ResolveError::Disabled { plate } => Some(plate),
            ResolveError::EmptyPlate | ResolveError::Lookup(_) => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StartCallError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("Insert error: {0}")]
    InsertFailed(StoreError),
    /// Reported by an external call-start service.
    #[error("{message}")]
    Remote { status: u16, message: String },
}

/// Failures surfaced by the caller and owner engines. Each ends in the same
/// cleanup as an explicit hangup before it reaches the UI.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Start(#[from] StartCallError),
    #[error("admission failed: {0}")]
    Admission(#[from] AdmissionError),
    #[error("media failed: {0}")]
    Media(#[from] MediaError),
    #[error("call {id} was already {status}")]
    Superseded { id: String, status: CallStatus },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Single human-readable line for the UI's error slot. Admission and media
    /// failures read differently so an ineligible channel is never reported as
    /// a microphone problem.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Start(e) => e.to_string(),
            EngineError::Admission(AdmissionError::ChannelDisabled(_)) => {
                "This vehicle is not accepting calls right now".to_string()
            }
            EngineError::Admission(AdmissionError::UnknownChannel(_)) => {
                "This vehicle is no longer registered".to_string()
            }
            EngineError::Admission(e) => format!("Could not authorize the call: {}", e),
            EngineError::Media(MediaError::PermissionDenied(_)) => {
                "Microphone permission was denied".to_string()
            }
            EngineError::Media(e) => format!("Audio connection failed: {}", e),
            EngineError::Superseded { status, .. } => match status {
                CallStatus::Accepted => "Call was answered on another device".to_string(),
                _ => "Call is no longer available".to_string(),
            },
            EngineError::Store(e) => format!("Service temporarily unavailable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_include_normalized_plate() {
        let err = ResolveError::NotFound {
            raw: "xx00 zz0000".to_string(),
            plate: "XX00ZZ0000".to_string(),
        };
        assert!(err.to_string().contains("XX00ZZ0000"));
        assert_eq!(err.plate(), Some("XX00ZZ0000"));
        let start: StartCallError = err.into();
        assert!(start.to_string().contains("XX00ZZ0000"));
    }

    #[test]
    fn test_admission_and_media_messages_differ() {
        let admission =
            EngineError::Admission(AdmissionError::ChannelDisabled("UP14AB1234".to_string()));
        let media = EngineError::Media(MediaError::PermissionDenied("NotAllowedError".to_string()));
        assert!(!admission.user_message().to_lowercase().contains("microphone"));
        assert!(media.user_message().to_lowercase().contains("microphone"));
    }
}
