//! Acquisition routes used by client SDKs: update checks, status reports
//! and package downloads.  Clients identify themselves by deployment key
//! only; these routes are not authenticated.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache;
use crate::documents::Package;
use crate::errors::ApiError;
use crate::middleware::RequestBody;
use crate::telemetry::STATUS_REPORTS_TOTAL;
use crate::AppState;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub is_available: bool,
    pub update_app_version: bool,
    pub should_run_binary_version: bool,
    #[serde(rename = "downloadURL", skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub app_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_mandatory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_size: Option<u64>,
}

impl UpdateInfo {
    fn unavailable(app_version: &str) -> Self {
        Self {
            is_available: false,
            update_app_version: false,
            should_run_binary_version: false,
            download_url: None,
            package_hash: None,
            label: None,
            app_version: app_version.to_string(),
            description: None,
            is_mandatory: false,
            package_size: None,
        }
    }
}

/// Decide what a client on `app_version` running `current_hash` should do.
pub fn update_info(
    package: Option<&Package>,
    app_version: &str,
    current_hash: Option<&str>,
    base_url: &str,
) -> UpdateInfo {
    let Some(package) = package else {
        return UpdateInfo::unavailable(app_version);
    };

    if package.app_version != app_version {
        return UpdateInfo {
            update_app_version: true,
            app_version: package.app_version.clone(),
            ..UpdateInfo::unavailable(app_version)
        };
    }

    if current_hash == Some(package.package_hash.as_str()) {
        return UpdateInfo::unavailable(app_version);
    }

    UpdateInfo {
        is_available: true,
        update_app_version: false,
        should_run_binary_version: false,
        download_url: Some(format!("{}/packages/{}", base_url, package.package_hash)),
        package_hash: Some(package.package_hash.clone()),
        label: Some(package.label.clone()),
        app_version: package.app_version.clone(),
        description: Some(package.description.clone()),
        is_mandatory: package.is_mandatory,
        package_size: Some(package.size),
    }
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{scheme}://{host}")
}

// -- Handlers ----------------------------------------------------------------

/// `GET /updateCheck?deploymentKey=..&appVersion=..[&packageHash=..]`
pub async fn update_check(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let key = query
        .get("deploymentKey")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::bad_request("A deploymentKey query parameter is required."))?;
    let app_version = query
        .get("appVersion")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("An appVersion query parameter is required."))?;

    let package_hash = query.get("packageHash").map(String::as_str);
    let base = base_url(&headers);
    let field = cache::request_field(app_version, package_hash, &base);

    if let Some(cache) = &state.cache {
        match cache.get_update(key, &field).await {
            Ok(Some(body)) => return Ok(json_body(body)),
            Ok(None) => {}
            Err(e) => warn!("Update-check cache read failed: {e:#}"),
        }
    }

    let deployment = state
        .documents
        .deployment_by_key(key)
        .await?
        .ok_or_else(|| ApiError::not_found("Deployment key not found."))?;

    let info = update_info(deployment.package.as_ref(), app_version, package_hash, &base);
    debug!(
        "Update check for deployment {}: available={}",
        deployment.name, info.is_available
    );
    let body = serde_json::json!({ "updateInfo": info }).to_string();
    if let Some(cache) = &state.cache {
        if let Err(e) = cache.put_update(key, &field, body.clone()).await {
            warn!("Update-check cache write failed: {e:#}");
        }
    }
    Ok(json_body(body))
}

fn json_body(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// Metric label for a reported deploy status.  Clients send free text, so
/// anything outside the known statuses is counted as `other`.
fn status_label(status: Option<&str>) -> &'static str {
    match status {
        None | Some("") => "none",
        Some("DeploymentSucceeded") => "DeploymentSucceeded",
        Some("DeploymentFailed") => "DeploymentFailed",
        Some(_) => "other",
    }
}

/// `POST /reportStatus/deploy`
pub async fn report_deploy(
    State(state): State<Arc<AppState>>,
    body: RequestBody,
) -> Result<StatusCode, ApiError> {
    let key = required_report_field(&body, "deploymentKey")?;
    ensure_deployment(&state, &key).await?;

    let status = body.field("status");
    let label = status_label(status.as_deref());
    counter!(STATUS_REPORTS_TOTAL, "kind" => "deploy", "status" => label).increment(1);
    debug!(
        "Deploy report: label={:?} status={:?}",
        body.field("label"),
        status
    );
    Ok(StatusCode::OK)
}

/// `POST /reportStatus/download`
pub async fn report_download(
    State(state): State<Arc<AppState>>,
    body: RequestBody,
) -> Result<StatusCode, ApiError> {
    let key = required_report_field(&body, "deploymentKey")?;
    let label = required_report_field(&body, "label")?;
    ensure_deployment(&state, &key).await?;

    counter!(STATUS_REPORTS_TOTAL, "kind" => "download", "status" => "downloaded").increment(1);
    debug!("Download report: label={}", label);
    Ok(StatusCode::OK)
}

/// `GET /packages/:hash`
pub async fn download_package(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let contents = state
        .documents
        .package_blob(&hash)
        .await?
        .ok_or_else(|| ApiError::not_found("Package not found."))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        contents,
    )
        .into_response())
}

fn required_report_field(body: &RequestBody, name: &str) -> Result<String, ApiError> {
    let has_fields = body.as_object().is_some() || matches!(body, RequestBody::Form(_));
    if !has_fields {
        return Err(ApiError::bad_request("A JSON body is required."));
    }
    body.field(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("A {name} field is required.")))
}

async fn ensure_deployment(state: &AppState, key: &str) -> Result<(), ApiError> {
    state
        .documents
        .deployment_by_key(key)
        .await?
        .map(|_| ())
        .ok_or_else(|| ApiError::not_found("Deployment key not found."))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/updateCheck", get(update_check))
        .route("/reportStatus/deploy", post(report_deploy))
        .route("/reportStatus/download", post(report_download))
        .route("/packages/:hash", get(download_package))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::NewRelease;
    use crate::cache::UpdateCache;
    use crate::testing::{state_with_cache, test_state, FakeCache};
    use axum::body::{Body, Bytes};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn package(hash: &str, version: &str) -> Package {
        Package {
            label: "v3".into(),
            app_version: version.into(),
            description: "fixes".into(),
            is_mandatory: true,
            package_hash: hash.into(),
            size: 42,
            blob_key: format!("packages/{hash}"),
            upload_time: 0,
        }
    }

    #[test]
    fn test_update_info_without_release() {
        let info = update_info(None, "1.0.0", None, "http://h");
        assert!(!info.is_available);
        assert_eq!(info.app_version, "1.0.0");
    }

    #[test]
    fn test_update_info_new_package() {
        let pkg = package("abc", "1.0.0");
        let info = update_info(Some(&pkg), "1.0.0", Some("old"), "http://h");
        assert!(info.is_available);
        assert_eq!(info.download_url.as_deref(), Some("http://h/packages/abc"));
        assert_eq!(info.label.as_deref(), Some("v3"));
        assert_eq!(info.package_size, Some(42));
    }

    #[test]
    fn test_update_info_already_current() {
        let pkg = package("abc", "1.0.0");
        let info = update_info(Some(&pkg), "1.0.0", Some("abc"), "http://h");
        assert!(!info.is_available);
    }

    #[test]
    fn test_update_info_binary_mismatch() {
        let pkg = package("abc", "2.0.0");
        let info = update_info(Some(&pkg), "1.0.0", None, "http://h");
        assert!(!info.is_available);
        assert!(info.update_app_version);
        assert_eq!(info.app_version, "2.0.0");
    }

    #[tokio::test]
    async fn test_update_check_end_to_end() {
        let state = test_state();
        state.documents.create_app("alice", "Demo").await.unwrap();
        let prod = state
            .documents
            .get_deployment("alice", "Demo", "Production")
            .await
            .unwrap()
            .unwrap();
        let key = prod.key.clone();
        let released = state
            .documents
            .release(
                "alice",
                "Demo",
                prod,
                NewRelease {
                    contents: Bytes::from_static(b"zip"),
                    app_version: "1.0.0".into(),
                    description: String::new(),
                    is_mandatory: false,
                },
            )
            .await
            .unwrap();

        let app = router().with_state(state);
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/updateCheck?deploymentKey={key}&appVersion=1.0.0"))
                    .header("host", "codepush.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["updateInfo"]["isAvailable"], true);
        assert_eq!(
            json["updateInfo"]["downloadURL"],
            format!("http://codepush.test/packages/{}", released.package_hash)
        );

        let response = app
            .oneshot(
                Request::get(format!("/packages/{}", released.package_hash))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"zip");
    }

    #[tokio::test]
    async fn test_update_check_unknown_key() {
        let app = router().with_state(test_state());
        let response = app
            .oneshot(
                Request::get("/updateCheck?deploymentKey=nope&appVersion=1.0.0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_check_is_cached_per_deployment() {
        let cache = FakeCache::new();
        let state = state_with_cache(cache.clone());
        state.documents.create_app("alice", "Demo").await.unwrap();
        let key = state
            .documents
            .get_deployment("alice", "Demo", "Staging")
            .await
            .unwrap()
            .unwrap()
            .key;

        let app = router().with_state(state);
        let uri = format!("/updateCheck?deploymentKey={key}&appVersion=1.0.0");
        let response = app
            .clone()
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(cache.cached(&key), 1);

        let response = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let second = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(first, second);
        assert_eq!(cache.hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_answer_served_without_storage() {
        let cache = FakeCache::new();
        let field = cache::request_field("1.0.0", None, "http://localhost");
        cache
            .put_update("gonekey", &field, r#"{"updateInfo":{"isAvailable":false}}"#.into())
            .await
            .unwrap();

        let app = router().with_state(state_with_cache(cache));
        let response = app
            .oneshot(
                Request::get("/updateCheck?deploymentKey=gonekey&appVersion=1.0.0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"updateInfo":{"isAvailable":false}}"#);
    }

    #[tokio::test]
    async fn test_update_check_survives_cache_outage() {
        let cache = FakeCache::new();
        cache.set_failing(true);
        let state = state_with_cache(cache.clone());
        state.documents.create_app("alice", "Demo").await.unwrap();
        let key = state
            .documents
            .get_deployment("alice", "Demo", "Staging")
            .await
            .unwrap()
            .unwrap()
            .key;

        let app = router().with_state(state);
        let response = app
            .oneshot(
                Request::get(format!("/updateCheck?deploymentKey={key}&appVersion=1.0.0"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["updateInfo"]["isAvailable"], false);
        assert_eq!(cache.cached(&key), 0);
    }

    #[test]
    fn test_status_label_is_closed() {
        assert_eq!(status_label(None), "none");
        assert_eq!(status_label(Some("DeploymentSucceeded")), "DeploymentSucceeded");
        assert_eq!(status_label(Some("DeploymentFailed")), "DeploymentFailed");
        assert_eq!(status_label(Some("junk-1")), "other");
    }

    #[tokio::test]
    async fn test_unknown_deploy_status_counted_as_other() {
        let handle = crate::telemetry::init_metrics();
        let state = test_state();
        state.documents.create_app("alice", "Demo").await.unwrap();
        let key = state
            .documents
            .get_deployment("alice", "Demo", "Staging")
            .await
            .unwrap()
            .unwrap()
            .key;

        let app = router().with_state(state);
        for i in 0..5 {
            let mut req = Request::post("/reportStatus/deploy")
                .body(Body::empty())
                .unwrap();
            req.extensions_mut().insert(RequestBody::Json(serde_json::json!({
                "deploymentKey": key,
                "status": format!("junk-{i}"),
            })));
            let response = app.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let rendered = handle.render();
        let series: Vec<&str> = rendered
            .lines()
            .filter(|l| l.starts_with("codepush_status_reports_total{"))
            .collect();
        assert!(series
            .iter()
            .any(|l| l.contains("kind=\"deploy\"") && l.contains("status=\"other\"")));
        assert!(!series.iter().any(|l| l.contains("junk")));
    }

    #[test]
    fn test_null_body_is_rejected_by_reports() {
        let err = required_report_field(&RequestBody::Null, "deploymentKey").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let err = required_report_field(&RequestBody::Absent, "deploymentKey").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
