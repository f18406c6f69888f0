//! Error types for startup and request handling.
//!
//! [`StartupError`] aborts the service before it listens.  [`ApiError`]
//! implements [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(ApiError::NotFound { .. })`.  Client errors render immediately;
//! everything else is marked as an [`UnhandledError`] and left for the
//! terminal telemetry stage to report and render.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Fatal errors raised while assembling the service.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The configuration cannot produce a working service.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The storage secret could not be fetched from the secret store.
    #[error("failed to fetch secret '{name}' from the secret store")]
    SecretFetch {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The storage backend could not be constructed.
    #[error("failed to initialize storage: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Request-level errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{message}")]
    NotFound { message: String },

    #[error("{message}")]
    Conflict { message: String },

    #[error("{message}")]
    Gone { message: String },

    /// The request body exceeded the limit of the parser that read it.
    #[error("request entity too large (limit {limit} bytes)")]
    PayloadTooLarge { limit: usize },

    /// The request body could not be decoded as text.
    #[error("unsupported request body encoding")]
    UnsupportedMediaType,

    /// Catch-all for unexpected internal errors.
    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest { .. } => "BadRequest",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::NotFound { .. } => "NotFound",
            ApiError::Conflict { .. } => "Conflict",
            ApiError::Gone { .. } => "Gone",
            ApiError::PayloadTooLarge { .. } => "PayloadTooLarge",
            ApiError::UnsupportedMediaType => "UnsupportedMediaType",
            ApiError::Internal(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Gone { .. } => StatusCode::GONE,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error is left for the terminal error stage.
    pub fn is_unhandled(&self) -> bool {
        matches!(
            self,
            ApiError::PayloadTooLarge { .. }
                | ApiError::UnsupportedMediaType
                | ApiError::Internal(_)
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound {
            message: message.into(),
        }
    }
}

/// Marker attached to a response whose error was not handled where it
/// occurred.  The terminal telemetry stage reports it and renders the body.
#[derive(Debug, Clone)]
pub struct UnhandledError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub detail: Arc<String>,
}

impl UnhandledError {
    /// Build a bare response carrying this marker.
    pub fn into_marked_response(self) -> Response {
        let mut response = self.status.into_response();
        response.extensions_mut().insert(self);
        response
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.is_unhandled() {
            let detail = match &self {
                ApiError::Internal(err) => format!("{err:#}"),
                other => other.to_string(),
            };
            return UnhandledError {
                status,
                code: self.code(),
                message: self.to_string(),
                detail: Arc::new(detail),
            }
            .into_marked_response();
        }

        (
            status,
            [("content-type", "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}
