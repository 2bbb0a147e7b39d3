use super::error::ApiError;
use super::extract::LenientJson;
use crate::admission::{Admission, AdmissionToken, TokenRequest};
use crate::app::AppState;
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};

pub async fn issue_token(
    State(state): State<AppState>,
    LenientJson(req): LenientJson<TokenRequest>,
) -> Result<Json<AdmissionToken>, ApiError> {
    Ok(Json(state.admission.issue(&req).await?))
}

/// Query-string variant for manual testing from a browser address bar.
pub async fn issue_token_query(
    State(state): State<AppState>,
    query: Result<Query<TokenRequest>, QueryRejection>,
) -> Result<Json<AdmissionToken>, ApiError> {
    let Query(req) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(state.admission.issue(&req).await?))
}
