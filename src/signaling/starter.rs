use super::error::{EngineError, StartCallError};
use super::session::{CallService, StartCallRequest};
use crate::models::CallSession;
use crate::store::StoreError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where caller engines create and close sessions. Picked once at startup by
/// probing the external service; never re-probed per call.
pub enum CallStarter {
    External(ExternalStarter),
    Inline(Arc<CallService>),
}

pub struct ExternalStarter {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RemoteReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    call: Option<CallSession>,
    #[serde(default)]
    error: Option<String>,
}

impl ExternalStarter {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(crate::version::get_useragent())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn healthy(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(url, "call-start service probe failed: {}", e);
                false
            }
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<CallSession, StartCallError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StartCallError::Remote {
                status: 502,
                message: format!("call-start service unreachable: {}", e),
            })?;
        let status = resp.status().as_u16();
        let reply = resp
            .json::<RemoteReply>()
            .await
            .map_err(|e| StartCallError::Remote {
                status,
                message: format!("invalid reply from call-start service: {}", e),
            })?;
        match reply {
            RemoteReply {
                ok: true,
                call: Some(call),
                ..
            } => Ok(call),
            RemoteReply { error, .. } => Err(StartCallError::Remote {
                status,
                message: error.unwrap_or_else(|| format!("call-start service returned {}", status)),
            }),
        }
    }
}

impl CallStarter {
    /// External when `external_url` is set and answers its health check,
    /// otherwise inline against the local store.
    pub async fn probe(external_url: Option<&str>, inline: Arc<CallService>) -> Self {
        if let Some(url) = external_url.filter(|u| !u.trim().is_empty()) {
            let external = ExternalStarter::new(url);
            if external.healthy().await {
                info!(url = external.base_url(), "using external call-start service");
                return CallStarter::External(external);
            }
            warn!(url, "call-start service unavailable, falling back to inline");
        }
        CallStarter::Inline(inline)
    }

    pub fn is_external(&self) -> bool {
        matches!(self, CallStarter::External(_))
    }

    pub async fn start(&self, req: &StartCallRequest) -> Result<CallSession, EngineError> {
        match self {
            CallStarter::Inline(calls) => Ok(calls.start_call(req).await?),
            CallStarter::External(external) => Ok(external
                .post(
                    "/api/call/start",
                    json!({
                        "plate": req.plate,
                        "via": req.via,
                        "caller_info": req.caller_info(),
                    }),
                )
                .await?),
        }
    }

    pub async fn end(&self, id: &str) -> Result<CallSession, EngineError> {
        match self {
            CallStarter::Inline(calls) => Ok(calls.end_call(id).await?),
            CallStarter::External(external) => external
                .post("/api/call/end", json!({ "id": id }))
                .await
                .map_err(|e| match e {
                    StartCallError::Remote { status: 404, message } => {
                        EngineError::Store(StoreError::SessionNotFound(message))
                    }
                    other => EngineError::Start(other),
                }),
        }
    }
}
