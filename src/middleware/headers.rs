//! Cross-origin and common response headers.
//!
//! Headers are queued on the request's [`ResponseGuard`] before the route
//! runs, so every response below this stage carries them, including ones
//! committed by the timeout stage.  `OPTIONS` preflights are answered here.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::guard::ResponseGuard;

const ALLOW_METHODS: &str = "GET, POST, PATCH, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Accept, Authorization, Content-Type, X-CodePush-Plugin-Name, \
     X-CodePush-Plugin-Version, X-CodePush-SDK-Version, X-Requested-With";
const EXPOSE_HEADERS: &str = "Location";

/// Resolved header set, built once per pipeline.
#[derive(Debug, Clone)]
pub struct CommonHeaders {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl CommonHeaders {
    pub fn new(origin: &str) -> Self {
        let origin = HeaderValue::from_str(origin).unwrap_or_else(|_| {
            warn!("CORS origin {:?} is not a valid header value; using '*'", origin);
            HeaderValue::from_static("*")
        });
        Self {
            headers: vec![
                (
                    HeaderName::from_static("access-control-allow-origin"),
                    origin,
                ),
                (
                    HeaderName::from_static("access-control-allow-methods"),
                    HeaderValue::from_static(ALLOW_METHODS),
                ),
                (
                    HeaderName::from_static("access-control-allow-headers"),
                    HeaderValue::from_static(ALLOW_HEADERS),
                ),
                (
                    HeaderName::from_static("access-control-expose-headers"),
                    HeaderValue::from_static(EXPOSE_HEADERS),
                ),
                (
                    HeaderName::from_static("cache-control"),
                    HeaderValue::from_static("no-cache"),
                ),
            ],
        }
    }
}

pub async fn common_headers(
    State(common): State<Arc<CommonHeaders>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let guard = req.extensions().get::<ResponseGuard>().cloned();

    if let Some(guard) = &guard {
        for (name, value) in &common.headers {
            guard.set_header(name.clone(), value.clone());
        }
    }

    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };

    // Without a guard stage above, write the headers directly.
    if guard.is_none() {
        let target = response.headers_mut();
        for (name, value) in &common.headers {
            target.entry(name.clone()).or_insert_with(|| value.clone());
        }
    }
    response
}
