use crate::admission::AdmissionError;
use crate::signaling::{ResolveError, StartCallError};
use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use tracing::warn;

/// JSON error body `{ ok: false, error, ...extra }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub extra: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("ok".to_string(), Value::Bool(false));
        body.insert("error".to_string(), Value::String(self.message));
        body.extend(self.extra);
        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        let status = match &e {
            ResolveError::EmptyPlate => StatusCode::BAD_REQUEST,
            ResolveError::NotFound { .. } => StatusCode::NOT_FOUND,
            ResolveError::NoOwner { .. } | ResolveError::Disabled { .. } => StatusCode::CONFLICT,
            ResolveError::Lookup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let plate = e.plate().map(str::to_string);
        let err = ApiError::new(status, e.to_string());
        match plate {
            Some(plate) => err.with("plate", plate),
            None => err,
        }
    }
}

impl From<StartCallError> for ApiError {
    fn from(e: StartCallError) -> Self {
        match e {
            StartCallError::Resolve(e) => e.into(),
            StartCallError::InsertFailed(inner) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Insert error: {}", inner),
            ),
            StartCallError::Remote { status, message } => ApiError::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            ),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::SessionNotFound(id) => {
                ApiError::new(StatusCode::NOT_FOUND, e.to_string()).with("id", id.clone())
            }
            StoreError::Backend(_) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        let status = match &e {
            AdmissionError::MissingChannel => StatusCode::BAD_REQUEST,
            AdmissionError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            AdmissionError::ChannelDisabled(_) => StatusCode::FORBIDDEN,
            AdmissionError::Misconfigured(_) | AdmissionError::Backend(_) => {
                warn!("token issuance failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, e.to_string())
    }
}

/// `{ ok: true, <key>: value }`
pub fn ok_json(key: &str, value: impl serde::Serialize) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Json(json!({ "ok": true, key: value })).into_response(),
        Err(e) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
