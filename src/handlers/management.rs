//! Management routes: accounts, access keys, apps, deployments and
//! releases.  Every handler requires an [`AuthenticatedUser`]; the pipeline
//! mounts these routes behind the authentication and upload stages.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde_json::json;
use tracing::{info, warn};

use super::auth::AuthenticatedUser;
use crate::documents::{validate_name, NewRelease};
use crate::errors::ApiError;
use crate::middleware::{RequestBody, UploadedPackage};
use crate::AppState;

/// Access key lifetime when the request does not name one: 60 days.
pub const DEFAULT_ACCESS_KEY_TTL_MS: i64 = 60 * 24 * 60 * 60 * 1000;

fn require_body(body: &RequestBody) -> Result<(), ApiError> {
    match body {
        RequestBody::Json(_) | RequestBody::Form(_) => Ok(()),
        _ => Err(ApiError::bad_request("A request body is required.")),
    }
}

/// `GET /account`
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = state.documents.get_or_create_account(&user.id).await?;
    Ok(Json(json!({ "account": account })))
}

/// `POST /accessKeys` -- body `{ "friendlyName": .., "ttl": <ms> }`.
pub async fn create_access_key(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    body: RequestBody,
) -> Result<Response, ApiError> {
    require_body(&body)?;
    let friendly_name = body
        .field("friendlyName")
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("A friendlyName is required."))?;
    let ttl = match body.field("ttl") {
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|ttl| *ttl > 0)
            .ok_or_else(|| ApiError::bad_request("ttl must be a positive number of milliseconds."))?,
        None => DEFAULT_ACCESS_KEY_TTL_MS,
    };

    state.documents.get_or_create_account(&user.id).await?;
    let access_key = state
        .documents
        .create_access_key(&user.id, friendly_name.trim(), ttl)
        .await?;
    info!("Created access key '{}' for {}", access_key.friendly_name, user.id);
    Ok((StatusCode::CREATED, Json(json!({ "accessKey": access_key }))).into_response())
}

/// `GET /apps`
pub async fn list_apps(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let apps = state.documents.list_apps(&user.id).await?;
    Ok(Json(json!({ "apps": apps })))
}

/// `POST /apps` -- body `{ "name": .. }`.  Creates the app with its default
/// deployments.
pub async fn create_app(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    body: RequestBody,
) -> Result<Response, ApiError> {
    require_body(&body)?;
    let name = body
        .field("name")
        .ok_or_else(|| ApiError::bad_request("An app name is required."))?;
    validate_name(&name).map_err(|report| {
        ApiError::bad_request(format!("Invalid app name '{name}': {report}"))
    })?;

    if state.documents.get_app(&user.id, &name).await?.is_some() {
        return Err(ApiError::Conflict {
            message: format!("An app named '{name}' already exists."),
        });
    }

    let app = state.documents.create_app(&user.id, &name).await?;
    info!("Created app '{}' for {}", app.name, user.id);
    let location = format!("/apps/{}", app.name);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(json!({ "app": app })),
    )
        .into_response())
}

/// `GET /apps/:app/deployments`
pub async fn list_deployments(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(app): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.documents.get_app(&user.id, &app).await?.is_none() {
        return Err(ApiError::not_found(format!("App '{app}' not found.")));
    }
    let deployments = state.documents.list_deployments(&user.id, &app).await?;
    Ok(Json(json!({ "deployments": deployments })))
}

/// `POST /apps/:app/deployments/:deployment/release` -- multipart with a
/// `package` file and `appVersion`, `description`, `isMandatory` fields.
pub async fn release(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path((app, deployment_name)): Path<(String, String)>,
    package: Option<Extension<UploadedPackage>>,
    body: RequestBody,
) -> Result<Response, ApiError> {
    let Some(Extension(package)) = package else {
        return Err(ApiError::bad_request("A package file is required."));
    };
    let app_version = body
        .field("appVersion")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("An appVersion is required."))?;

    let deployment = state
        .documents
        .get_deployment(&user.id, &app, &deployment_name)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "Deployment '{deployment_name}' of app '{app}' not found."
            ))
        })?;

    let deployment_key = deployment.key.clone();
    let released = state
        .documents
        .release(
            &user.id,
            &app,
            deployment,
            NewRelease {
                contents: package.contents,
                app_version,
                description: body.field("description").unwrap_or_default(),
                is_mandatory: body.field("isMandatory").as_deref() == Some("true"),
            },
        )
        .await?;
    info!(
        "Released {} to {}/{} ({} bytes)",
        released.label, app, deployment_name, released.size
    );
    if let Some(cache) = &state.cache {
        if let Err(e) = cache.invalidate(&deployment_key).await {
            warn!("Failed to drop cached update checks for {app}/{deployment_name}: {e:#}");
        }
    }
    Ok((StatusCode::CREATED, Json(json!({ "package": released }))).into_response())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/account", get(get_account))
        .route("/accessKeys", post(create_access_key))
        .route("/apps", get(list_apps).post(create_app))
        .route("/apps/:app/deployments", get(list_deployments))
        .route(
            "/apps/:app/deployments/:deployment/release",
            post(release),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UpdateCache;
    use crate::testing::{state_with_cache, test_state, FakeCache};
    use axum::body::{Body, Bytes};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Management router with a fixed identity and pre-parsed JSON bodies.
    fn app_for(user: &str, state: Arc<AppState>) -> Router {
        let user = AuthenticatedUser { id: user.into() };
        router()
            .layer(Extension(user))
            .with_state(state)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(RequestBody::Json(body));
        req
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list_apps() {
        let state = test_state();
        let app = app_for("alice", state);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/apps", json!({ "name": "Demo" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("location").unwrap(), "/apps/Demo");

        let response = app
            .clone()
            .oneshot(json_request("POST", "/apps", json!({ "name": "Demo" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(Request::get("/apps").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["apps"][0]["name"], "Demo");

        let response = app
            .oneshot(
                Request::get("/apps/Demo/deployments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["deployments"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_app_rejects_null_and_invalid_names() {
        let app = app_for("alice", test_state());

        let mut req = Request::post("/apps").body(Body::empty()).unwrap();
        req.extensions_mut().insert(RequestBody::Null);
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request("POST", "/apps", json!({ "name": "bad name" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_apps_are_scoped_to_the_caller() {
        let state = test_state();
        app_for("alice", state.clone())
            .oneshot(json_request("POST", "/apps", json!({ "name": "Demo" })))
            .await
            .unwrap();

        let response = app_for("bob", state)
            .oneshot(
                Request::get("/apps/Demo/deployments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_access_key_creation() {
        let state = test_state();
        let response = app_for("alice", state.clone())
            .oneshot(json_request(
                "POST",
                "/accessKeys",
                json!({ "friendlyName": "ci", "ttl": 1000 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = json_body(response).await;
        let key = json["accessKey"]["name"].as_str().unwrap().to_string();
        assert_eq!(
            state.documents.account_for_access_key(&key).await.unwrap(),
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_release_requires_package() {
        let state = test_state();
        state.documents.create_app("alice", "Demo").await.unwrap();
        let response = app_for("alice", state)
            .oneshot(json_request(
                "POST",
                "/apps/Demo/deployments/Staging/release",
                json!({ "appVersion": "1.0.0" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_release_stores_package() {
        let state = test_state();
        state.documents.create_app("alice", "Demo").await.unwrap();

        let mut req = json_request(
            "POST",
            "/apps/Demo/deployments/Staging/release",
            json!({ "appVersion": "1.0.0", "isMandatory": "true" }),
        );
        req.extensions_mut().insert(UploadedPackage {
            file_name: Some("bundle.zip".into()),
            contents: Bytes::from_static(b"bundle"),
        });
        let response = app_for("alice", state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = json_body(response).await;
        assert_eq!(json["package"]["label"], "v1");
        assert_eq!(json["package"]["isMandatory"], true);

        let staging = state
            .documents
            .get_deployment("alice", "Demo", "Staging")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(staging.package.unwrap().app_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_release_drops_cached_update_checks() {
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
        cache
            .put_update(&key, "http://localhost|1.0.0|", "{}".into())
            .await
            .unwrap();

        let mut req = json_request(
            "POST",
            "/apps/Demo/deployments/Staging/release",
            json!({ "appVersion": "1.0.0" }),
        );
        req.extensions_mut().insert(UploadedPackage {
            file_name: None,
            contents: Bytes::from_static(b"bundle"),
        });
        let response = app_for("alice", state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(cache.cached(&key), 0);
    }
}
