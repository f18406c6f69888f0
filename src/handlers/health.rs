//! Root welcome text and the health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::errors::ApiError;
use crate::AppState;

pub const WELCOME_TEXT: &str = "Welcome to the CodePush REST API!";

/// `GET /`
pub async fn welcome() -> &'static str {
    WELCOME_TEXT
}

/// `GET /health` -- 200 `Healthy` when storage answers with its current
/// credentials and the cache, if any, answers too.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .storage
        .check_health()
        .await
        .map_err(|e| ApiError::Internal(e.context("storage health check failed")))?;
    if let Some(cache) = &state.cache {
        cache
            .check_health()
            .await
            .map_err(|e| ApiError::Internal(e.context("cache health check failed")))?;
    }
    Ok((StatusCode::OK, "Healthy"))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}
