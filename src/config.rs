use crate::models::Vehicle;
use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_STALENESS_SECS: u64 = 120;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
pub const MIN_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TOKEN_TTL_SECS: u32 = 3600;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Base URL of a separately deployed call-start service. When it answers
    /// the health probe, callers create sessions through it instead of inline.
    pub external_start_url: Option<String>,
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub staleness_secs: u64,
    pub poll_interval_ms: u64,
    /// 0 disables the server-side timeout sweep.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    pub app_id: Option<String>,
    pub app_certificate: Option<String>,
    pub default_ttl_secs: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    Memory {
        #[serde(default)]
        vehicles: Vec<Vehicle>,
    },
    Rest {
        url: Option<String>,
        key: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            staleness_secs: DEFAULT_STALENESS_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl SignalingConfig {
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs as i64)
    }

    /// Never below [`MIN_POLL_INTERVAL_MS`], so a zero in the file cannot
    /// turn the safety-net poll into a busy loop or a zero-period timer.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sweep_interval_secs))
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_certificate: None,
            default_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }
}

impl MediaConfig {
    /// Fill credentials missing from the file from `AGORA_APP_ID` /
    /// `AGORA_APP_CERTIFICATE`.
    pub fn with_env_fallback(mut self) -> Self {
        if self.app_id.is_none() {
            self.app_id = std::env::var("AGORA_APP_ID").ok();
        }
        if self.app_certificate.is_none() {
            self.app_certificate = std::env::var("AGORA_APP_CERTIFICATE").ok();
        }
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory {
            vehicles: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            external_start_url: None,
            signaling: SignalingConfig::default(),
            media: MediaConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let mut issue = |field: &str, message: String| {
            issues.push(ConfigIssue {
                field: field.to_string(),
                message,
            })
        };

        if let Err(e) = self.http_addr.parse::<SocketAddr>() {
            issue("http_addr", format!("invalid socket address: {}", e));
        }
        if self.signaling.staleness_secs == 0 {
            issue("signaling.staleness_secs", "must be positive".to_string());
        }
        if self.signaling.poll_interval_ms == 0 {
            issue("signaling.poll_interval_ms", "must be positive".to_string());
        }
        let media = self.media.clone().with_env_fallback();
        if media.app_id.as_deref().unwrap_or_default().is_empty() {
            issue(
                "media.app_id",
                "missing; token issuance will fail with 500".to_string(),
            );
        }
        if media.app_certificate.as_deref().unwrap_or_default().is_empty() {
            issue(
                "media.app_certificate",
                "missing; token issuance will fail with 500".to_string(),
            );
        }
        match &self.store {
            StoreConfig::Memory { vehicles } => {
                for vehicle in vehicles {
                    if vehicle.plate != crate::models::normalize_plate(&vehicle.plate) {
                        issue(
                            "store.vehicles",
                            format!("plate {:?} is not in canonical form", vehicle.plate),
                        );
                    }
                }
            }
            StoreConfig::Rest { url, key } => {
                if url.is_none() && std::env::var_os("PLATECALL_REST_URL").is_none() {
                    issue("store.url", "required for rest store".to_string());
                }
                if key.is_none() && std::env::var_os("PLATECALL_REST_KEY").is_none() {
                    issue("store.key", "required for rest store".to_string());
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
http_addr = "127.0.0.1:9090"
log_level = "debug"

[signaling]
staleness_secs = 60

[media]
app_id = "app"
app_certificate = "cert"

[store]
type = "memory"

[[store.vehicles]]
plate = "UP14AB1234"
owner_id = "U1"
active = true

[[store.vehicles]]
plate = "KA05ZZ9999"
active = false
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:9090");
        assert_eq!(config.signaling.staleness_secs, 60);
        assert_eq!(config.signaling.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.media.default_ttl_secs, DEFAULT_TOKEN_TTL_SECS);
        match &config.store {
            StoreConfig::Memory { vehicles } => {
                assert_eq!(vehicles.len(), 2);
                assert!(vehicles[0].active);
                assert!(vehicles[1].owner_id.is_none());
            }
            other => panic!("unexpected store {:?}", other),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_issues() {
        let config = Config {
            http_addr: "not-an-addr".to_string(),
            signaling: SignalingConfig {
                poll_interval_ms: 0,
                ..Default::default()
            },
            media: MediaConfig {
                app_id: Some("app".to_string()),
                app_certificate: Some("cert".to_string()),
                ..Default::default()
            },
            store: StoreConfig::Memory {
                vehicles: vec![Vehicle::new("up 14", "U1")],
            },
            ..Default::default()
        };
        let issues = config.validate().unwrap_err();
        let fields: Vec<_> = issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"http_addr"));
        assert!(fields.contains(&"signaling.poll_interval_ms"));
        assert!(fields.contains(&"store.vehicles"));
    }

    #[test]
    fn test_sweep_interval_zero_disables() {
        let signaling = SignalingConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert!(signaling.sweep_interval().is_none());
        assert_eq!(signaling.staleness(), chrono::Duration::minutes(2));
    }

    #[test]
    fn test_poll_interval_has_floor() {
        let signaling = SignalingConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            signaling.poll_interval(),
            Duration::from_millis(MIN_POLL_INTERVAL_MS)
        );
        assert_eq!(
            SignalingConfig::default().poll_interval(),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        );
    }
}
