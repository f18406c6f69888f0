//! Authentication for the management routes.
//!
//! Callers present an access key as `Authorization: Bearer <key>`.  The
//! [`authenticate`] stage resolves it to an account and stores an
//! [`AuthenticatedUser`] in the request extensions.  When real auth is
//! disabled for debugging, [`inject_debug_user`] runs first and the
//! identity it injects is accepted as is.

use std::path::Path;
use std::sync::Arc;

use axum::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, warn};

use crate::config::FeatureFlags;
use crate::errors::ApiError;
use crate::AppState;

pub const DEFAULT_DEBUG_USER_ID: &str = "default";

/// Identity of the caller, set by [`authenticate`] or [`inject_debug_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Resolve the bearer access key in `headers` to a user.
pub async fn resolve_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    match state.documents.account_for_access_key(token).await? {
        Some(id) => Ok(AuthenticatedUser { id }),
        None => {
            debug!("Rejected unknown or expired access key");
            Err(ApiError::Unauthorized)
        }
    }
}

// -- Stages ------------------------------------------------------------------

/// Require an authenticated caller.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if req.extensions().get::<AuthenticatedUser>().is_none() {
        let resolved = resolve_user(&state, req.headers()).await;
        match resolved {
            Ok(user) => {
                req.extensions_mut().insert(user);
            }
            Err(err) => return err.into_response(),
        }
    }
    next.run(req).await
}

/// Synthetic identity used when real authentication is disabled.
#[derive(Debug, Clone)]
pub struct DebugIdentity {
    pub user_id: String,
}

impl DebugIdentity {
    pub fn from_flags(flags: &FeatureFlags) -> Self {
        let user_id = match &flags.debug_user_id {
            Some(id) => id.clone(),
            None => {
                warn!(
                    "No DEBUG_USER_ID configured. Using '{}' as user id",
                    DEFAULT_DEBUG_USER_ID
                );
                DEFAULT_DEBUG_USER_ID.to_string()
            }
        };
        Self { user_id }
    }
}

pub async fn inject_debug_user(
    State(identity): State<Arc<DebugIdentity>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    req.extensions_mut().insert(AuthenticatedUser {
        id: identity.user_id.clone(),
    });
    next.run(req).await
}

// -- Routes ------------------------------------------------------------------

/// Render `<views_dir>/<name>.html`.
async fn render_view(views_dir: &str, name: &str) -> Result<Html<String>, ApiError> {
    let path = Path::new(views_dir).join(format!("{name}.html"));
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => Ok(Html(html)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found(format!("View '{name}' not found.")))
        }
        Err(err) => Err(ApiError::Internal(
            anyhow::Error::new(err).context(format!("failed to read view {}", path.display())),
        )),
    }
}

/// `GET /auth/login`
pub async fn login(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    render_view(&state.config.server.views_dir, "login").await
}

/// `GET /auth/logout` -- access keys are stateless, nothing to clear.
pub async fn logout() -> &'static str {
    "Logged out"
}

/// `GET /authenticated`
pub async fn authenticated(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    resolve_user(&state, &headers).await?;
    Ok(Json(serde_json::json!({ "authenticated": true })))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/login", get(login))
        .route("/auth/logout", get(logout))
        .route("/authenticated", get(authenticated))
}
