use super::error::StartCallError;
use super::resolver::PlateResolver;
use crate::models::{CallSession, CallStatus, NewCallSession};
use crate::store::{Backends, CallStore, StoreError, TransitionOutcome};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Input to a call start, shared by the HTTP route and the caller console.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub via: Option<String>,
    #[serde(default, alias = "caller_info")]
    pub caller_info: Option<Value>,
}

impl StartCallRequest {
    pub fn new(plate: impl Into<String>) -> Self {
        Self {
            plate: plate.into(),
            ..Default::default()
        }
    }

    pub fn via(mut self, via: impl Into<String>) -> Self {
        self.via = Some(via.into());
        self
    }

    /// Provided caller info when it is a JSON object, otherwise `{"via": ...}`.
    pub fn caller_info(&self) -> Value {
        match &self.caller_info {
            Some(info @ Value::Object(_)) => info.clone(),
            _ => json!({ "via": self.via.as_deref().unwrap_or("api") }),
        }
    }
}

/// Creates call sessions and applies status writes on behalf of both sides.
pub struct CallService {
    resolver: PlateResolver,
    calls: Arc<dyn CallStore>,
}

impl CallService {
    pub fn new(backends: &Backends) -> Self {
        Self {
            resolver: PlateResolver::new(backends.directory.clone()),
            calls: backends.calls.clone(),
        }
    }

    pub fn resolver(&self) -> &PlateResolver {
        &self.resolver
    }

    pub fn calls(&self) -> Arc<dyn CallStore> {
        self.calls.clone()
    }

    /// Resolve the plate and insert one `ringing` row. The new row is what the
    /// owner's subscription sees; this call does not wait for anyone to answer.
    pub async fn start_call(&self, req: &StartCallRequest) -> Result<CallSession, StartCallError> {
        let resolution = self.resolver.resolve(&req.plate).await?;
        let row = self
            .calls
            .insert(NewCallSession {
                plate: resolution.plate,
                owner_id: resolution.owner_id,
                caller_info: req.caller_info(),
            })
            .await
            .map_err(StartCallError::InsertFailed)?;
        info!(
            session_id = row.id,
            plate = row.plate,
            owner_id = row.owner_id,
            "call session started"
        );
        Ok(row)
    }

    /// Mark a call ended from either side. Ending an already-closed row is a
    /// no-op that returns the row as stored.
    pub async fn end_call(&self, id: &str) -> Result<CallSession, StoreError> {
        let outcome = self.calls.transition(id, CallStatus::Ended).await?;
        match &outcome {
            TransitionOutcome::Applied(row) => info!(session_id = row.id, "call session ended"),
            TransitionOutcome::Unchanged(row) => {
                warn!(session_id = row.id, status = %row.status, "end ignored, call already closed")
            }
        }
        Ok(outcome.row().clone())
    }
}
