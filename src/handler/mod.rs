use crate::app::AppState;
use crate::version;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

pub mod call;
pub mod console;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod token;

pub use error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/call/start", post(call::start_call))
        .route("/api/call/end", post(call::end_call))
        .route(
            "/api/agora-token",
            post(token::issue_token).get(token::issue_token_query),
        )
        .route("/api/owner/ws", get(console::owner_console))
        .route("/api/caller/ws", get(console::caller_console))
        .route("/api/consoles", get(console::list_consoles))
        .route("/api/consoles/kill/{id}", post(console::kill_console))
}

/// Liveness, and the capability probe external call starters are checked with.
async fn health() -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": version::get_short_version(),
    }))
}
