use crate::config::MediaConfig;
use crate::models::normalize_plate;
use crate::store::VehicleDirectory;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod token;

pub const MIN_TTL_SECS: u32 = 60;
pub const MAX_TTL_SECS: u32 = 86_400;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdmissionError {
    #[error("Missing 'channel'")]
    MissingChannel,
    #[error("Unknown channel {0}")]
    UnknownChannel(String),
    #[error("Channel {0} is disabled")]
    ChannelDisabled(String),
    #[error("Token service misconfigured: {0}")]
    Misconfigured(String),
    #[error("Token backend error: {0}")]
    Backend(String),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Publisher,
    Subscriber,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub ttl_seconds: Option<u32>,
    #[serde(default)]
    pub uid: u32,
}

impl TokenRequest {
    pub fn publisher(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            role: Role::Publisher,
            ttl_seconds: None,
            uid: 0,
        }
    }
}

/// Credentials for exactly one room, handed to the media client as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionToken {
    pub app_id: String,
    pub channel: String,
    pub uid: u32,
    pub token: String,
    pub expire_at: u32,
}

/// Seam between the engines and token issuance.
#[async_trait]
pub trait Admission: Send + Sync {
    async fn issue(&self, req: &TokenRequest) -> Result<AdmissionToken, AdmissionError>;
}

struct AppCredentials {
    app_id: String,
    app_certificate: String,
}

/// Issues room tokens only for channels that still map to an active vehicle.
pub struct AdmissionService {
    directory: Arc<dyn VehicleDirectory>,
    credentials: Option<AppCredentials>,
    default_ttl: u32,
}

pub fn clamp_ttl(ttl: u32) -> u32 {
    ttl.clamp(MIN_TTL_SECS, MAX_TTL_SECS)
}

impl AdmissionService {
    pub fn new(directory: Arc<dyn VehicleDirectory>, media: &MediaConfig) -> Self {
        let credentials = match (&media.app_id, &media.app_certificate) {
            (Some(app_id), Some(app_certificate))
                if !app_id.is_empty() && !app_certificate.is_empty() =>
            {
                Some(AppCredentials {
                    app_id: app_id.clone(),
                    app_certificate: app_certificate.clone(),
                })
            }
            _ => {
                warn!("media app id/certificate not configured, token requests will fail");
                None
            }
        };
        Self {
            directory,
            credentials,
            default_ttl: clamp_ttl(media.default_ttl_secs),
        }
    }

    /// Normalize the channel and confirm it names an active vehicle. Looks
    /// past the active filter so a disabled vehicle is told apart from an
    /// unknown one.
    pub async fn verify_channel(&self, channel: &str) -> Result<String, AdmissionError> {
        let channel = normalize_plate(channel);
        if channel.is_empty() {
            return Err(AdmissionError::MissingChannel);
        }
        let vehicle = match self
            .directory
            .find_exact(&channel, false)
            .await
            .map_err(|e| AdmissionError::Backend(e.to_string()))?
        {
            Some(v) => Some(v),
            None => self
                .directory
                .find_case_insensitive(&channel, false)
                .await
                .map_err(|e| AdmissionError::Backend(e.to_string()))?,
        };
        match vehicle {
            None => Err(AdmissionError::UnknownChannel(channel)),
            Some(v) if !v.active => Err(AdmissionError::ChannelDisabled(channel)),
            Some(_) => Ok(channel),
        }
    }
}

#[async_trait]
impl Admission for AdmissionService {
    async fn issue(&self, req: &TokenRequest) -> Result<AdmissionToken, AdmissionError> {
        let channel = self.verify_channel(&req.channel).await?;
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| AdmissionError::Misconfigured("missing app credentials".to_string()))?;

        let ttl = clamp_ttl(req.ttl_seconds.unwrap_or(self.default_ttl));
        let now = Utc::now().timestamp().max(0) as u32;
        let expire_at = now.saturating_add(ttl);
        let token = token::build_token_with_uid(
            &credentials.app_id,
            &credentials.app_certificate,
            &channel,
            req.uid,
            req.role == Role::Publisher,
            now,
            expire_at,
        )
        .map_err(|e| AdmissionError::Misconfigured(e.to_string()))?;

        info!(channel, uid = req.uid, role = ?req.role, ttl, "media token issued");
        Ok(AdmissionToken {
            app_id: credentials.app_id.clone(),
            channel,
            uid: req.uid,
            token,
            expire_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Vehicle;
    use crate::store::MemoryStore;

    fn media(app_id: Option<&str>) -> MediaConfig {
        MediaConfig {
            app_id: app_id.map(str::to_string),
            app_certificate: Some("cert".to_string()),
            ..Default::default()
        }
    }

    fn service(vehicles: Vec<Vehicle>, app_id: Option<&str>) -> AdmissionService {
        AdmissionService::new(
            Arc::new(MemoryStore::with_vehicles(vehicles)),
            &media(app_id),
        )
    }

    #[tokio::test]
    async fn test_issue_for_active_vehicle() {
        let svc = service(vec![Vehicle::new("UP14AB1234", "U1")], Some("app"));
        let issued = svc.issue(&TokenRequest::publisher(" up14ab1234")).await.unwrap();
        assert_eq!(issued.channel, "UP14AB1234");
        assert_eq!(issued.app_id, "app");
        assert!(issued.token.starts_with("006app"));
        let now = Utc::now().timestamp() as u32;
        assert!(issued.expire_at >= now + 3590 && issued.expire_at <= now + 3610);
    }

    #[tokio::test]
    async fn test_gate_rejections() {
        let svc = service(
            vec![Vehicle::new("UP14AB1234", "U1").disabled()],
            Some("app"),
        );
        assert_eq!(
            svc.issue(&TokenRequest::publisher("UP14AB1234")).await,
            Err(AdmissionError::ChannelDisabled("UP14AB1234".to_string()))
        );
        assert_eq!(
            svc.issue(&TokenRequest::publisher("NOPE")).await,
            Err(AdmissionError::UnknownChannel("NOPE".to_string()))
        );
        assert_eq!(
            svc.issue(&TokenRequest::publisher("  ")).await,
            Err(AdmissionError::MissingChannel)
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_after_gate() {
        let svc = service(vec![Vehicle::new("UP14AB1234", "U1")], None);
        assert!(matches!(
            svc.issue(&TokenRequest::publisher("UP14AB1234")).await,
            Err(AdmissionError::Misconfigured(_))
        ));
        // unknown channels are still reported as such
        assert!(matches!(
            svc.issue(&TokenRequest::publisher("NOPE")).await,
            Err(AdmissionError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_ttl_clamp_and_request_shape() {
        assert_eq!(clamp_ttl(1), MIN_TTL_SECS);
        assert_eq!(clamp_ttl(10_000_000), MAX_TTL_SECS);
        assert_eq!(clamp_ttl(600), 600);

        let req: TokenRequest =
            serde_json::from_str(r#"{"channel":"X","role":"subscriber","ttlSeconds":120}"#)
                .unwrap();
        assert_eq!(req.role, Role::Subscriber);
        assert_eq!(req.ttl_seconds, Some(120));
        assert_eq!(req.uid, 0);
    }
}
