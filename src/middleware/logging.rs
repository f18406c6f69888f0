//! Request logger stage, mounted only when request logging is enabled.

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

pub async fn log_request(req: Request<Body>, next: Next) -> Response {
    info!("[REST] Received {} request at {}", req.method(), req.uri());
    next.run(req).await
}
