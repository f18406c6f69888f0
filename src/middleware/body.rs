//! Body parsing stages.
//!
//! The URL-encoded and JSON parsers buffer the body up to their own limit,
//! store the decoded value in the request extensions as a [`RequestBody`],
//! and put the bytes back so later extractors can still read them.  A parse
//! failure never answers the request here: it is stored as a
//! [`BodyParseFailure`] and [`recover_body_errors`] decides what to do.
//!
//! Only syntax failures are recovered: the body becomes [`RequestBody::Null`]
//! and the request goes on.  Every other failure is answered with an
//! unhandled [`ApiError`] for the terminal error stage.

use std::convert::Infallible;

use axum::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::LengthLimitError;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ApiError;

/// The decoded request body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    /// No parser claimed the request.
    #[default]
    Absent,
    Json(Value),
    Form(Vec<(String, String)>),
    /// The JSON body was malformed and has been discarded.
    Null,
}

impl RequestBody {
    pub fn is_null(&self) -> bool {
        matches!(self, RequestBody::Null)
    }

    /// The JSON object, if the body is one.
    pub fn as_object(&self) -> Option<&serde_json::Map<String, Value>> {
        match self {
            RequestBody::Json(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// A string field from either a JSON object or a form body.
    pub fn field(&self, name: &str) -> Option<String> {
        match self {
            RequestBody::Json(Value::Object(map)) => map.get(name).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }),
            RequestBody::Form(pairs) => pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestBody {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestBody>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Raw JSON body text, kept when invalid-JSON logging is enabled.
#[derive(Debug, Clone)]
pub struct RawBody(pub String);

/// Why a body parser gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyParseFailure {
    Syntax(String),
    TooLarge { limit: usize },
    UnsupportedCharset(String),
    Read(String),
}

impl BodyParseFailure {
    pub fn is_syntax(&self) -> bool {
        matches!(self, BodyParseFailure::Syntax(_))
    }

    fn into_api_error(self) -> ApiError {
        match self {
            BodyParseFailure::TooLarge { limit } => ApiError::PayloadTooLarge { limit },
            BodyParseFailure::UnsupportedCharset(charset) => {
                debug!("Rejecting body with charset {}", charset);
                ApiError::UnsupportedMediaType
            }
            BodyParseFailure::Syntax(msg) | BodyParseFailure::Read(msg) => {
                ApiError::Internal(anyhow::anyhow!("failed to read request body: {msg}"))
            }
        }
    }
}

/// Settings for one parser stage.
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    pub limit: usize,
    /// Keep the raw text in a [`RawBody`] extension.
    pub capture_raw: bool,
}

// -- Stages ------------------------------------------------------------------

pub async fn urlencoded_body(
    State(config): State<ParserConfig>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !claims(&req, is_urlencoded) {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match read_limited(&parts.headers, body, config.limit).await {
        Ok(bytes) => bytes,
        Err(failure) => {
            parts.extensions.insert(failure);
            return next.run(Request::from_parts(parts, Body::empty())).await;
        }
    };

    parts
        .extensions
        .insert(RequestBody::Form(parse_form(&bytes)));
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

pub async fn json_body(
    State(config): State<ParserConfig>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !claims(&req, is_json) {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match read_limited(&parts.headers, body, config.limit).await {
        Ok(bytes) => bytes,
        Err(failure) => {
            parts.extensions.insert(failure);
            return next.run(Request::from_parts(parts, Body::empty())).await;
        }
    };

    if config.capture_raw && !bytes.is_empty() {
        parts
            .extensions
            .insert(RawBody(String::from_utf8_lossy(&bytes).into_owned()));
    }

    match parse_json_strict(&bytes) {
        Ok(value) => {
            parts.extensions.insert(RequestBody::Json(value));
        }
        Err(failure) => {
            parts.extensions.insert(failure);
        }
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Recover malformed JSON as a `null` body; answer anything else.
pub async fn recover_body_errors(mut req: Request<Body>, next: Next) -> Response {
    let Some(failure) = req.extensions_mut().remove::<BodyParseFailure>() else {
        return next.run(req).await;
    };

    if !failure.is_syntax() {
        return failure.into_api_error().into_response();
    }

    match req.extensions().get::<RawBody>() {
        Some(RawBody(raw)) => warn!(
            "Invalid JSON body on {} {}: {}",
            req.method(),
            req.uri(),
            raw
        ),
        None => debug!("Invalid JSON body on {} {}", req.method(), req.uri()),
    }
    req.extensions_mut().insert(RequestBody::Null);
    next.run(req).await
}

// -- Helpers -----------------------------------------------------------------

/// Whether a parser claims the request.  Parsers only act on a matching
/// content type and when no earlier parser already failed.
fn claims(req: &Request<Body>, matches_type: fn(&str) -> bool) -> bool {
    if req.extensions().get::<BodyParseFailure>().is_some() {
        return false;
    }
    media_type(req.headers()).is_some_and(|m| matches_type(&m))
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let media = value.split(';').next()?.trim().to_ascii_lowercase();
    Some(media)
}

fn charset(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    value.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| v.trim().trim_matches('"').to_ascii_lowercase())
    })
}

fn is_json(media: &str) -> bool {
    media == "application/json" || media.ends_with("+json")
}

fn is_urlencoded(media: &str) -> bool {
    media == "application/x-www-form-urlencoded"
}

async fn read_limited(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<Bytes, BodyParseFailure> {
    if let Some(cs) = charset(headers) {
        if cs != "utf-8" && cs != "utf8" {
            return Err(BodyParseFailure::UnsupportedCharset(cs));
        }
    }

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(BodyParseFailure::TooLarge { limit });
    }

    axum::body::to_bytes(body, limit).await.map_err(|err| {
        let inner = err.into_inner();
        if inner.downcast_ref::<LengthLimitError>().is_some() {
            BodyParseFailure::TooLarge { limit }
        } else {
            BodyParseFailure::Read(inner.to_string())
        }
    })
}

/// Parse a JSON body.  Empty bodies become `{}`; anything but an object or
/// array at the top level is a syntax failure.
fn parse_json_strict(bytes: &[u8]) -> Result<Value, BodyParseFailure> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| BodyParseFailure::Syntax(e.to_string()))?;
    match value {
        Value::Object(_) | Value::Array(_) => Ok(value),
        _ => Err(BodyParseFailure::Syntax(
            "top-level JSON value must be an object or array".to_string(),
        )),
    }
}

fn parse_form(bytes: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(bytes);
    let decode = |s: &str| {
        percent_decode_str(&s.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned()
    };
    text.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(part), String::new()),
        })
        .collect()
}
