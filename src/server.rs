//! Request pipeline construction.
//!
//! [`Pipeline::plan`] turns the configuration into the ordered list of
//! [`Stage`]s; [`Pipeline::build`] assembles that list into an axum
//! [`Router`].  The first stage in the plan is the outermost layer.
//!
//! Ordering constraints between stages:
//! - the exception domain encloses everything, the response guard encloses
//!   every stage that can answer a request
//! - the timeout bounds sanitizing, body parsing and every handler
//! - body parsers run before parse-error recovery, which runs before
//!   telemetry ingress and every route
//! - static assets sit outside the common headers stage; health and
//!   business routes sit inside it
//! - the terminal error stage renders whatever the stages below left
//!   unhandled, before the guard commits the response

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::ServeDir;
use tracing::info;

use crate::config::Config;
use crate::handlers::{acquisition, auth, health, legacy, management};
use crate::middleware::body::{json_body, recover_body_errors, urlencoded_body, ParserConfig};
use crate::middleware::guard::response_guard;
use crate::middleware::headers::{common_headers, CommonHeaders};
use crate::middleware::logging::log_request;
use crate::middleware::sanitizer::sanitize_input;
use crate::middleware::timeout::request_timeout;
use crate::middleware::upload::file_upload;
use crate::telemetry::{error_handler, ingress, metrics_handler, panic_response};
use crate::AppState;

/// URL prefix for the images served out of `<views_dir>/images`.
pub const IMAGES_PATH: &str = "/auth/images";

/// How management routes identify the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Bearer access keys checked by the `authenticate` stage.
    Real,
    /// Every request runs as the configured debug user.
    Debug,
}

/// One unit of per-request processing, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ExceptionDomain,
    ResponseGuard,
    RequestLogger,
    Timeout,
    InputSanitizer,
    UrlEncodedBody,
    JsonBody,
    BodyParseRecovery,
    TelemetryIngress,
    StaticAssets,
    CommonHeaders,
    Health,
    Acquisition,
    Management(AuthMode),
    Legacy,
    TelemetryErrors,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::ExceptionDomain => "exception-domain",
            Stage::ResponseGuard => "response-guard",
            Stage::RequestLogger => "request-logger",
            Stage::Timeout => "timeout",
            Stage::InputSanitizer => "input-sanitizer",
            Stage::UrlEncodedBody => "urlencoded-body",
            Stage::JsonBody => "json-body",
            Stage::BodyParseRecovery => "body-parse-recovery",
            Stage::TelemetryIngress => "telemetry-ingress",
            Stage::StaticAssets => "static-assets",
            Stage::CommonHeaders => "common-headers",
            Stage::Health => "health",
            Stage::Acquisition => "acquisition",
            Stage::Management(AuthMode::Real) => "management",
            Stage::Management(AuthMode::Debug) => "management-debug-auth",
            Stage::Legacy => "legacy",
            Stage::TelemetryErrors => "telemetry-errors",
        }
    }

    fn is_routes(&self) -> bool {
        matches!(
            self,
            Stage::Health | Stage::Acquisition | Stage::Management(_) | Stage::Legacy
        )
    }
}

pub struct Pipeline;

impl Pipeline {
    /// The ordered stage list for `config`.
    ///
    /// Disabling management takes precedence over the debug-auth flag: the
    /// legacy router is mounted whatever `debug_disable_auth` says.
    pub fn plan(config: &Config) -> Vec<Stage> {
        let features = &config.features;
        let mut stages = vec![Stage::ExceptionDomain, Stage::ResponseGuard];
        if config.logging.requests {
            stages.push(Stage::RequestLogger);
        }
        stages.extend([
            Stage::Timeout,
            Stage::InputSanitizer,
            Stage::UrlEncodedBody,
            Stage::JsonBody,
            Stage::BodyParseRecovery,
            Stage::TelemetryIngress,
            Stage::StaticAssets,
            Stage::CommonHeaders,
            Stage::Health,
        ]);
        if !features.disable_acquisition {
            stages.push(Stage::Acquisition);
        }
        if features.disable_management {
            stages.push(Stage::Legacy);
        } else if features.debug_disable_auth {
            stages.push(Stage::Management(AuthMode::Debug));
        } else {
            stages.push(Stage::Management(AuthMode::Real));
        }
        stages.push(Stage::TelemetryErrors);
        stages
    }

    /// Build the serving router for `state.config`.
    pub fn build(state: Arc<AppState>) -> Router {
        let plan = Self::plan(&state.config);
        let names: Vec<&str> = plan.iter().map(Stage::name).collect();
        info!("Request pipeline: {}", names.join(" -> "));
        assemble(&plan, state, Router::new())
    }
}

/// Assemble `plan` around `inner`.
///
/// Stages are applied from the innermost outwards, so each middleware stage
/// wraps everything planned after it.
pub(crate) fn assemble(
    plan: &[Stage],
    state: Arc<AppState>,
    inner: Router<Arc<AppState>>,
) -> Router {
    let config = &state.config;
    let render_errors = plan.contains(&Stage::TelemetryErrors);
    let mut router = inner;

    for stage in plan.iter().rev() {
        router = match stage {
            stage if stage.is_routes() => router.merge(stage_routes(*stage, &state)),
            Stage::TelemetryErrors => router,
            Stage::CommonHeaders => {
                let headers = Arc::new(CommonHeaders::new(&config.cors.origin));
                router.layer(from_fn_with_state(headers, common_headers))
            }
            Stage::StaticAssets => {
                let images = Path::new(&config.server.views_dir).join("images");
                router
                    .route("/", get(health::welcome))
                    .nest_service(IMAGES_PATH, ServeDir::new(images))
            }
            Stage::TelemetryIngress => {
                let router = router.layer(from_fn(ingress));
                if config.observability.metrics {
                    router.route("/metrics", get(metrics_handler))
                } else {
                    router
                }
            }
            Stage::BodyParseRecovery => router.layer(from_fn(recover_body_errors)),
            Stage::JsonBody => {
                let parser = ParserConfig {
                    limit: config.server.json_limit_bytes,
                    capture_raw: config.logging.invalid_json,
                };
                router.layer(from_fn_with_state(parser, json_body))
            }
            Stage::UrlEncodedBody => {
                let parser = ParserConfig {
                    limit: config.server.urlencoded_limit_bytes,
                    capture_raw: false,
                };
                router.layer(from_fn_with_state(parser, urlencoded_body))
            }
            Stage::InputSanitizer => router.layer(from_fn(sanitize_input)),
            Stage::Timeout => {
                let limit = Duration::from_millis(config.server.request_timeout_ms);
                router.layer(from_fn_with_state(limit, request_timeout))
            }
            Stage::RequestLogger => router.layer(from_fn(log_request)),
            Stage::ResponseGuard => {
                // Errors travel outwards as responses; render them just
                // before the guard commits.
                let router = if render_errors {
                    router.layer(from_fn(error_handler))
                } else {
                    router
                };
                router.layer(from_fn(response_guard))
            }
            Stage::ExceptionDomain => router.layer(CatchPanicLayer::custom(panic_response)),
            _ => router,
        };
    }

    router.with_state(state)
}

fn stage_routes(stage: Stage, state: &Arc<AppState>) -> Router<Arc<AppState>> {
    match stage {
        Stage::Health => health::router(),
        Stage::Acquisition => acquisition::router(),
        Stage::Legacy => legacy::router(),
        Stage::Management(AuthMode::Real) => auth::router().merge(protected_routes(state)),
        Stage::Management(AuthMode::Debug) => {
            let identity = Arc::new(auth::DebugIdentity::from_flags(&state.config.features));
            protected_routes(state).route_layer(from_fn_with_state(identity, auth::inject_debug_user))
        }
        _ => Router::new(),
    }
}

/// Management routes behind authentication and upload handling.
fn protected_routes(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let limit = state.config.server.upload_limit_bytes;
    management::router()
        .route_layer(from_fn_with_state(limit, file_upload))
        .route_layer(DefaultBodyLimit::max(limit))
        .route_layer(from_fn_with_state(state.clone(), auth::authenticate))
}
