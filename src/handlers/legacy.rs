//! Routes mounted when the management API is disabled.  Older clients
//! still call the auth endpoints; they get a clear 410 instead of a 404.

use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;

use crate::errors::ApiError;
use crate::AppState;

pub const MANAGEMENT_DISABLED_MESSAGE: &str = "The management API is disabled on this server.";

pub async fn gone() -> ApiError {
    ApiError::Gone {
        message: MANAGEMENT_DISABLED_MESSAGE.to_string(),
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/login", get(gone))
        .route("/auth/register", get(gone))
        .route("/auth/link", get(gone))
        .route("/authenticated", any(gone))
}
