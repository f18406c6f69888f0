//! Request telemetry and the error channel.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! provides the ingress middleware recording HTTP RED metrics, the terminal
//! error middleware that renders unhandled errors, and [`report_error`], the
//! one place every unhandled failure (request, panic, rotation) goes through.

use std::any::Any;
use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::error;

use crate::errors::UnhandledError;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "codepush_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "codepush_http_request_duration_seconds";

/// Errors sent through [`report_error`] (counter). Labels: source.
pub const ERRORS_TOTAL: &str = "codepush_errors_total";

/// Credential rotation ticks (counter). Labels: outcome.
pub const CREDENTIAL_ROTATIONS_TOTAL: &str = "codepush_credential_rotations_total";

/// Client status reports (counter). Labels: kind, status.
pub const STATUS_REPORTS_TOTAL: &str = "codepush_status_reports_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
///
/// When another recorder is already installed (several test binaries in
/// one process), a detached recorder is kept so `/metrics` still renders.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        match builder.install_recorder() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!("Prometheus recorder not installed globally: {}", err);
                PrometheusBuilder::new().build_recorder().handle()
            }
        }
    })
}

pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(ERRORS_TOTAL, "Unhandled errors by source");
    describe_counter!(
        CREDENTIAL_ROTATIONS_TOTAL,
        "Storage credential rotation attempts by outcome"
    );
    describe_counter!(STATUS_REPORTS_TOTAL, "Client deploy/download status reports");
}

// -- Error channel ------------------------------------------------------------

/// Where an unhandled error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Request,
    Panic,
    Rotation,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Request => "request",
            ErrorSource::Panic => "panic",
            ErrorSource::Rotation => "rotation",
        }
    }
}

/// Log and count an unhandled error.
///
/// `{:#}` prints the full cause chain of an `anyhow::Error`.
pub fn report_error(source: ErrorSource, err: &dyn std::fmt::Display) {
    error!(source = source.as_str(), "Unhandled error: {:#}", err);
    counter!(ERRORS_TOTAL, "source" => source.as_str()).increment(1);
}

// -- Ingress middleware -------------------------------------------------------

/// Record HTTP RED metrics for every request.
///
/// `/metrics` itself is not instrumented.
pub async fn ingress(req: Request<Body>, next: Next) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a route template for metric labels.
///
/// - `/apps/MyApp/deployments` -> `/apps/{app}/deployments`
/// - `/packages/abc123` -> `/packages/{hash}`
/// - `/auth/images/logo.png` -> `/auth/images/{file}`
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        [""] => "/".to_string(),
        ["apps", _] => "/apps/{app}".to_string(),
        ["apps", _, "deployments"] => "/apps/{app}/deployments".to_string(),
        ["apps", _, "deployments", _, rest @ ..] => {
            let mut out = "/apps/{app}/deployments/{deployment}".to_string();
            for s in rest {
                out.push('/');
                out.push_str(s);
            }
            out
        }
        ["packages", _] => "/packages/{hash}".to_string(),
        ["auth", "images", ..] => "/auth/images/{file}".to_string(),
        _ => format!("/{}", segments.join("/")),
    }
}

// -- Terminal error middleware ------------------------------------------------

/// Turn responses marked [`UnhandledError`] into the client-visible error.
///
/// Server errors get a generic body; the detail only goes to the log.
pub async fn error_handler(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    match response.extensions_mut().remove::<UnhandledError>() {
        Some(unhandled) => render_unhandled(unhandled),
        None => response,
    }
}

fn render_unhandled(unhandled: UnhandledError) -> Response {
    report_error(ErrorSource::Request, &unhandled.detail);
    let body = if unhandled.status.is_server_error() {
        "Internal Server Error".to_string()
    } else {
        unhandled.message
    };
    (
        unhandled.status,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Panic handler for `tower_http::catch_panic::CatchPanicLayer`.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    report_error(ErrorSource::Panic, &message);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [("content-type", "text/plain; charset=utf-8")],
        "Internal Server Error",
    )
        .into_response()
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = init_metrics().render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
