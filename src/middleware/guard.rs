//! Idempotent response output.
//!
//! Several stages may try to finish the same request: the timeout stage,
//! the terminal error stage, the route handler, or a task the handler
//! spawned.  [`ResponseGuard`] is a per-request handle stored in the request
//! extensions.  The first [`ResponseGuard::send`] wins; once a response is
//! committed every later `send` or `set_header` is silently dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

#[derive(Default)]
struct GuardState {
    /// Set once a response has been committed or has left the pipeline.
    sent: bool,
    committed: Option<Response>,
    headers: HeaderMap,
}

/// Per-request output guard.  Cloning shares the same state.
#[derive(Clone, Default)]
pub struct ResponseGuard {
    state: Arc<Mutex<GuardState>>,
}

impl ResponseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn headers_sent(&self) -> bool {
        self.lock().sent
    }

    /// Queue a header for the eventual response.  A later call with the same
    /// name replaces the earlier value.  Dropped once headers are sent.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        let mut state = self.lock();
        if state.sent {
            return false;
        }
        state.headers.insert(name, value);
        true
    }

    /// Commit `response` as the answer to this request.
    ///
    /// Returns `false`, dropping `response`, when a response was already
    /// committed or sent.
    pub fn send(&self, response: impl IntoResponse) -> bool {
        let mut state = self.lock();
        if state.sent {
            return false;
        }
        state.sent = true;
        state.committed = Some(response.into_response());
        true
    }

    /// Produce the final response: the committed one if any, else `response`.
    /// Queued headers are added where the response does not set them itself.
    pub fn finish(&self, response: Response) -> Response {
        let mut state = self.lock();
        state.sent = true;
        let mut out = match state.committed.take() {
            Some(committed) => committed,
            None => response,
        };
        let headers = std::mem::take(&mut state.headers);
        let target = out.headers_mut();
        for (name, value) in headers.iter() {
            if !target.contains_key(name) {
                target.insert(name.clone(), value.clone());
            }
        }
        out
    }
}

/// Outermost output stage: installs a fresh guard for each request.
pub async fn response_guard(mut req: Request<Body>, next: Next) -> Response {
    let guard = ResponseGuard::new();
    req.extensions_mut().insert(guard.clone());
    let response = next.run(req).await;
    guard.finish(response)
}
