//! Multipart package upload stage.
//!
//! Runs in front of the management routes.  A `multipart/form-data` body is
//! read completely: the `package` file field becomes an [`UploadedPackage`]
//! extension and the text fields become the [`RequestBody`].  A text field
//! named `packageInfo` holding a JSON object is used as the body instead of
//! the raw field list.  The size limit is enforced by a `DefaultBodyLimit`
//! layer above this stage; the stage state only names it in errors.

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::{FromRequest, Multipart, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::debug;

use super::body::RequestBody;
use crate::errors::ApiError;

pub const PACKAGE_FIELD: &str = "package";
pub const PACKAGE_INFO_FIELD: &str = "packageInfo";

/// The uploaded package file.
#[derive(Debug, Clone)]
pub struct UploadedPackage {
    pub file_name: Option<String>,
    pub contents: Bytes,
}

pub async fn file_upload(State(limit): State<usize>, req: Request<Body>, next: Next) -> Response {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"));
    if !is_multipart {
        return next.run(req).await;
    }

    // Keep everything but the body for the rebuilt request.
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();
    let headers = req.headers().clone();
    let extensions = req.extensions().clone();

    let (package, body) = match read_multipart(req, limit).await {
        Ok(parsed) => parsed,
        Err(err) => return err.into_response(),
    };

    let mut rebuilt = Request::new(Body::empty());
    *rebuilt.method_mut() = method;
    *rebuilt.uri_mut() = uri;
    *rebuilt.version_mut() = version;
    *rebuilt.headers_mut() = headers;
    *rebuilt.extensions_mut() = extensions;
    rebuilt.extensions_mut().insert(body);
    if let Some(package) = package {
        debug!(
            "Received package upload {:?} ({} bytes)",
            package.file_name,
            package.contents.len()
        );
        rebuilt.extensions_mut().insert(package);
    }
    next.run(rebuilt).await
}

async fn read_multipart(
    req: Request<Body>,
    limit: usize,
) -> Result<(Option<UploadedPackage>, RequestBody), ApiError> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let mut package = None;
    let mut fields = Vec::new();
    let multipart_error = |err: MultipartError| {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge { limit }
        } else {
            ApiError::bad_request(err.body_text())
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        if name == PACKAGE_FIELD {
            let contents = field.bytes().await.map_err(multipart_error)?;
            package = Some(UploadedPackage {
                file_name,
                contents,
            });
        } else {
            let text = field.text().await.map_err(multipart_error)?;
            fields.push((name, text));
        }
    }

    let info = fields
        .iter()
        .find(|(k, _)| k == PACKAGE_INFO_FIELD)
        .and_then(|(_, v)| serde_json::from_str::<Value>(v).ok())
        .filter(Value::is_object);
    let body = match info {
        Some(value) => RequestBody::Json(value),
        None => RequestBody::Form(fields),
    };
    Ok((package, body))
}
