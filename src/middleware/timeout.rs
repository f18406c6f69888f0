//! Request timeout stage.
//!
//! Bounds the total time spent in every stage below it.  On expiry the
//! inner future is dropped and a 408 is committed through the
//! [`ResponseGuard`], so anything that tries to answer later is ignored.

use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::guard::ResponseGuard;

pub const TIMEOUT_MESSAGE: &str = "Request timed out";

pub async fn request_timeout(
    State(limit): State<Duration>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let guard = req.extensions().get::<ResponseGuard>().cloned();
    let method = req.method().clone();
    let uri = req.uri().clone();

    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!("{} {} timed out after {:?}", method, uri, limit);
            let timed_out = (StatusCode::REQUEST_TIMEOUT, TIMEOUT_MESSAGE);
            match guard {
                Some(guard) => {
                    guard.send(timed_out);
                    // Placeholder; the guard stage returns the committed response.
                    StatusCode::REQUEST_TIMEOUT.into_response()
                }
                None => timed_out.into_response(),
            }
        }
    }
}
