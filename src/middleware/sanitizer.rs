//! Input sanitizer stage.
//!
//! Clients routinely paste deployment keys with stray whitespace or a
//! trailing newline.  This stage trims surrounding whitespace from every
//! query value before any later stage reads the query.  Pairs that need no
//! change keep their original encoding.

use axum::body::Body;
use axum::http::uri::PathAndQuery;
use axum::http::{Request, Uri};
use axum::middleware::Next;
use axum::response::Response;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Characters re-encoded in a rewritten query value.
const QUERY_VALUE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'=')
    .add(b'>');

pub async fn sanitize_input(mut req: Request<Body>, next: Next) -> Response {
    if let Some(query) = req.uri().query() {
        if let Some(clean) = sanitize_query(query) {
            if let Some(uri) = with_query(req.uri(), &clean) {
                *req.uri_mut() = uri;
            }
        }
    }
    next.run(req).await
}

/// Trim every query value.  Returns `None` when nothing changed.
pub fn sanitize_query(query: &str) -> Option<String> {
    let mut changed = false;
    let parts: Vec<String> = query
        .split('&')
        .map(|part| {
            let Some((k, v)) = part.split_once('=') else {
                return part.to_string();
            };
            let decoded = percent_decode_str(&v.replace('+', " "))
                .decode_utf8_lossy()
                .into_owned();
            let trimmed = decoded.trim();
            if trimmed.len() == decoded.len() {
                return part.to_string();
            }
            changed = true;
            format!("{}={}", k, utf8_percent_encode(trimmed, QUERY_VALUE_ENCODE_SET))
        })
        .collect();
    changed.then(|| parts.join("&"))
}

fn with_query(uri: &Uri, query: &str) -> Option<Uri> {
    let path_and_query: PathAndQuery = format!("{}?{}", uri.path(), query).parse().ok()?;
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    #[test]
    fn test_untouched_query_returns_none() {
        assert_eq!(sanitize_query("deploymentKey=abc&appVersion=1.0.0"), None);
        assert_eq!(sanitize_query("flag&x=y"), None);
        assert_eq!(sanitize_query("flag&x=%20y").as_deref(), Some("flag&x=y"));
    }

    #[test]
    fn test_trims_encoded_whitespace() {
        assert_eq!(
            sanitize_query("deploymentKey=%20abc%0A&appVersion=1.0.0").as_deref(),
            Some("deploymentKey=abc&appVersion=1.0.0")
        );
        assert_eq!(
            sanitize_query("deploymentKey=+abc+").as_deref(),
            Some("deploymentKey=abc")
        );
    }

    #[test]
    fn test_inner_characters_are_reencoded() {
        assert_eq!(
            sanitize_query("label=%20a%20b%26c").as_deref(),
            Some("label=a%20b%26c")
        );
    }

    #[tokio::test]
    async fn test_downstream_sees_trimmed_values() {
        let app = Router::new()
            .route(
                "/updateCheck",
                get(
                    |axum::extract::Query(q): axum::extract::Query<HashMap<String, String>>| async move {
                        q.get("deploymentKey").cloned().unwrap_or_default()
                    },
                ),
            )
            .layer(axum::middleware::from_fn(sanitize_input));

        let response = app
            .oneshot(
                Request::get("/updateCheck?deploymentKey=%20key123%0D%0A")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"key123");
    }
}
