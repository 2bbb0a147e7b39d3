use super::error::{ok_json, ApiError};
use super::extract::LenientJson;
use super::middleware::clientaddr::ClientAddr;
use crate::app::AppState;
use crate::signaling::StartCallRequest;
use axum::{extract::State, response::Response};
use serde::Deserialize;
use tracing::{info, warn};

/// `POST /api/call/start`
pub async fn start_call(
    client: ClientAddr,
    State(state): State<AppState>,
    LenientJson(req): LenientJson<StartCallRequest>,
) -> Result<Response, ApiError> {
    match state.calls.start_call(&req).await {
        Ok(call) => {
            info!(
                session_id = call.id,
                channel = call.channel,
                client = %client,
                "call start accepted"
            );
            Ok(ok_json("call", call))
        }
        Err(e) => {
            warn!(plate = req.plate, client = %client, "call start rejected: {}", e);
            Err(e.into())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EndCallRequest {
    #[serde(default)]
    pub id: String,
}

/// `POST /api/call/end`, used by callers whose session was created through
/// this service. Ending an already-closed session is not an error.
pub async fn end_call(
    State(state): State<AppState>,
    LenientJson(req): LenientJson<EndCallRequest>,
) -> Result<Response, ApiError> {
    let id = req.id.trim();
    if id.is_empty() {
        return Err(ApiError::bad_request("Missing 'id'"));
    }
    let call = state.calls.end_call(id).await?;
    Ok(ok_json("call", call))
}
