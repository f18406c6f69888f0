//! Azure Blob Storage backend.
//!
//! Stores every value as a block blob in a single container via the Azure
//! Blob REST API using `reqwest`.  Keys map 1:1 to blob names.
//!
//! All credential state (account, endpoint, auth material) lives in one
//! immutable [`AzureCredentials`] value behind a lock.  Each operation takes
//! a snapshot of it once and uses that snapshot for the URL and the
//! signature, and [`StorageBackend::reinitialize`] replaces the whole value
//! in one assignment.  A request racing a rotation therefore signs with
//! either the old or the new credentials, never a mix of the two.
//!
//! When not supplied by a secret store, credentials are resolved from:
//!   - `AZURE_STORAGE_ACCESS_KEY` (Shared Key auth)
//!   - `AZURE_STORAGE_CONNECTION_STRING` (parsed for `AccountKey`)
//!   - `AZURE_STORAGE_SAS_TOKEN` (SAS token auth)

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::backend::StorageBackend;
use crate::vault::Secret;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Percent-encoding set for Azure blob names: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Azure authentication method.
enum AzureAuth {
    /// Shared Key authentication using the storage account key.
    SharedKey { key_bytes: Vec<u8> },
    /// SAS token authentication (appended as query parameter).
    SasToken { token: String },
}

/// One complete, immutable credential set.
struct AzureCredentials {
    /// Azure storage account name.
    account: String,
    /// The base URL for the Azure Blob service endpoint.
    base_url: String,
    /// Authentication method.
    auth: AzureAuth,
}

impl AzureCredentials {
    fn new(account: &str, auth: AzureAuth) -> Self {
        Self {
            account: account.to_string(),
            base_url: format!("https://{}.blob.core.windows.net", account),
            auth,
        }
    }

    /// Build Shared Key credentials from a secret holding either the
    /// base64 account key or a full connection string.
    fn from_secret(account: &str, secret: &Secret) -> anyhow::Result<Self> {
        let raw = secret.expose().trim();
        let key = match raw.split(';').find_map(|p| p.strip_prefix("AccountKey=")) {
            Some(key) => key,
            None => raw,
        };
        let key_bytes = BASE64_STANDARD
            .decode(key)
            .map_err(|e| anyhow::anyhow!("Storage secret is not a valid base64 key: {}", e))?;
        Ok(Self::new(account, AzureAuth::SharedKey { key_bytes }))
    }

    /// Resolve credentials for `account` from environment-style variables.
    fn from_lookup<F>(account: &str, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        // 1. Try AZURE_STORAGE_ACCESS_KEY
        if let Some(key) = var("AZURE_STORAGE_ACCESS_KEY") {
            let key_bytes = BASE64_STANDARD.decode(&key).map_err(|e| {
                anyhow::anyhow!("Invalid AZURE_STORAGE_ACCESS_KEY (not valid base64): {}", e)
            })?;
            return Ok(Self::new(account, AzureAuth::SharedKey { key_bytes }));
        }

        // 2. Try AZURE_STORAGE_CONNECTION_STRING (extract AccountKey)
        if let Some(conn_str) = var("AZURE_STORAGE_CONNECTION_STRING") {
            if conn_str.split(';').any(|p| p.starts_with("AccountKey=")) {
                return Self::from_secret(account, &Secret::new(conn_str));
            }
        }

        // 3. Try AZURE_STORAGE_SAS_TOKEN
        if let Some(sas) = var("AZURE_STORAGE_SAS_TOKEN") {
            let token = sas.strip_prefix('?').unwrap_or(&sas).to_string();
            return Ok(Self::new(account, AzureAuth::SasToken { token }));
        }

        Err(anyhow::anyhow!(
            "No Azure credentials found. Set AZURE_STORAGE_ACCESS_KEY, \
             AZURE_STORAGE_CONNECTION_STRING, or AZURE_STORAGE_SAS_TOKEN, \
             or configure AZURE_KEYVAULT_ACCOUNT."
        ))
    }

    /// Build the full URL for a container or blob operation.
    fn url(&self, container: &str, blob_name: Option<&str>, query: &[(String, String)]) -> String {
        let mut url = match blob_name {
            Some(name) => {
                let encoded =
                    percent_encoding::utf8_percent_encode(name, &AZURE_BLOB_ENCODE_SET).to_string();
                format!("{}/{}/{}", self.base_url, container, encoded)
            }
            None => format!("{}/{}", self.base_url, container),
        };

        let mut params: Vec<String> = query
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    k,
                    percent_encoding::utf8_percent_encode(v, percent_encoding::NON_ALPHANUMERIC)
                )
            })
            .collect();
        if let AzureAuth::SasToken { token } = &self.auth {
            params.push(token.clone());
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }

    /// Sign a request using Azure Shared Key authentication and return
    /// the Authorization header value, or `None` under SAS auth.
    ///
    /// The string-to-sign format:
    /// ```text
    /// VERB\n
    /// Content-Encoding\n
    /// Content-Language\n
    /// Content-Length\n
    /// Content-MD5\n
    /// Content-Type\n
    /// Date\n
    /// If-Modified-Since\n
    /// If-Match\n
    /// If-None-Match\n
    /// If-Unmodified-Since\n
    /// Range\n
    /// CanonicalizedHeaders\n
    /// CanonicalizedResource
    /// ```
    #[allow(clippy::too_many_arguments)]
    fn sign_request(
        &self,
        method: &str,
        container: &str,
        blob_name: Option<&str>,
        content_length: usize,
        content_type: &str,
        date: &str,
        extra_headers: &[(&str, &str)],
        query_params: &[(String, String)],
    ) -> anyhow::Result<Option<String>> {
        let key_bytes = match &self.auth {
            AzureAuth::SharedKey { key_bytes } => key_bytes,
            AzureAuth::SasToken { .. } => return Ok(None),
        };

        // Content-Length: empty for 0 (GET/DELETE/HEAD).
        let content_length_str = match content_length {
            0 => String::new(),
            len => len.to_string(),
        };

        // Build canonicalized headers (x-ms-* headers, sorted).
        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        for (k, v) in extra_headers {
            let lk = k.to_lowercase();
            if lk.starts_with("x-ms-") && lk != "x-ms-date" && lk != "x-ms-version" {
                ms_headers.push((lk, v.to_string()));
            }
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonicalized_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        // The canonicalized resource uses the un-encoded blob name.
        let mut canonicalized_resource = match blob_name {
            Some(name) => format!("/{}/{}/{}", self.account, container, name),
            None => format!("/{}/{}", self.account, container),
        };
        if !query_params.is_empty() {
            let mut sorted_params = query_params.to_vec();
            sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in &sorted_params {
                canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
            }
        }

        let string_to_sign = format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}\n{}",
            method, content_length_str, content_type, canonicalized_headers, canonicalized_resource
        );

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(key_bytes)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(Some(format!("SharedKey {}:{}", self.account, signature)))
    }
}

/// Storage backend that keeps every value in an Azure blob container.
pub struct AzureBlobBackend {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    /// The Azure container name.
    container: String,
    /// Current credential set; replaced wholesale on reinitialize.
    credentials: RwLock<Arc<AzureCredentials>>,
}

impl AzureBlobBackend {
    fn with_credentials(container: String, credentials: AzureCredentials) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        info!(
            "Azure blob backend initialized: container={} account={}",
            container, credentials.account
        );

        Ok(Self {
            client,
            container,
            credentials: RwLock::new(Arc::new(credentials)),
        })
    }

    /// Create a backend for `account`, resolving credentials from the
    /// process environment.
    pub fn from_env(container: String, account: &str) -> anyhow::Result<Self> {
        Self::from_lookup(container, account, |name| std::env::var(name).ok())
    }

    /// Create a backend for `account`, resolving credentials through `lookup`.
    pub fn from_lookup<F>(container: String, account: &str, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::with_credentials(container, AzureCredentials::from_lookup(account, lookup)?)
    }

    /// Create a backend for `account` using a key fetched from a secret store.
    pub fn from_secret(container: String, account: &str, secret: &Secret) -> anyhow::Result<Self> {
        Self::with_credentials(container, AzureCredentials::from_secret(account, secret)?)
    }

    /// Snapshot of the current credential set.
    async fn credentials(&self) -> Arc<AzureCredentials> {
        Arc::clone(&*self.credentials.read().await)
    }

    /// Account name of the current credential set.
    pub async fn account(&self) -> String {
        self.credentials().await.account.clone()
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(std::time::SystemTime::now())
    }

    /// Map an Azure HTTP error to an anyhow error with context.
    fn map_azure_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow::anyhow!("Azure {}: HTTP {} - {}", context, status, body)
    }

    /// Build and send one signed request against a credential snapshot.
    async fn send(
        &self,
        creds: &AzureCredentials,
        method: Method,
        blob_name: Option<&str>,
        query: &[(String, String)],
        body: Option<Bytes>,
    ) -> anyhow::Result<reqwest::Response> {
        let date = Self::rfc1123_date();
        let url = creds.url(&self.container, blob_name, query);
        let content_length = body.as_ref().map_or(0, |b| b.len());
        let (content_type, extra_headers): (&str, Vec<(&str, &str)>) = if body.is_some() {
            ("application/octet-stream", vec![("x-ms-blob-type", "BlockBlob")])
        } else {
            ("", Vec::new())
        };

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION);
        for (k, v) in &extra_headers {
            req = req.header(*k, *v);
        }

        if let Some(auth_header) = creds.sign_request(
            method.as_str(),
            &self.container,
            blob_name,
            content_length,
            content_type,
            &date,
            &extra_headers,
            query,
        )? {
            req = req.header("Authorization", auth_header);
        }
        if let Some(data) = body {
            req = req.header("Content-Type", content_type).body(data);
        }

        req.send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure {} request failed: {}", method, e))
    }

    /// List blob names under `prefix`, following continuation markers.
    async fn list_blobs(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let creds = self.credentials().await;
        let mut all_names: Vec<String> = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query = vec![
                ("comp".to_string(), "list".to_string()),
                ("prefix".to_string(), prefix.to_string()),
                ("restype".to_string(), "container".to_string()),
            ];
            if let Some(ref m) = marker {
                query.push(("marker".to_string(), m.clone()));
            }

            let resp = self.send(&creds, Method::GET, None, &query, None).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("list_blobs", status, &body));
            }

            let body = resp.text().await.unwrap_or_default();
            let (names, next_marker) = parse_blob_list(&body)?;
            all_names.extend(names);

            match next_marker {
                Some(m) => marker = Some(m),
                None => break,
            }
        }

        all_names.sort();
        Ok(all_names)
    }
}

/// Extract blob names and the continuation marker from a List Blobs response.
fn parse_blob_list(xml: &str) -> anyhow::Result<(Vec<String>, Option<String>)> {
    enum Field {
        Name,
        NextMarker,
    }

    let mut reader = quick_xml::Reader::from_str(xml);
    reader.trim_text(true);

    let mut names = Vec::new();
    let mut next_marker = None;
    let mut in_blob = false;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"Blob" => in_blob = true,
                b"Name" if in_blob => field = Some(Field::Name),
                b"NextMarker" => field = Some(Field::NextMarker),
                _ => {}
            },
            Event::End(e) => {
                if e.name().as_ref() == b"Blob" {
                    in_blob = false;
                }
                field = None;
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                match field {
                    Some(Field::Name) => names.push(text),
                    Some(Field::NextMarker) if !text.is_empty() => next_marker = Some(text),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok((names, next_marker))
}

impl StorageBackend for AzureBlobBackend {
    fn kind(&self) -> &'static str {
        "azure"
    }

    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let creds = self.credentials().await;
            let resp = self
                .send(&creds, Method::PUT, Some(&key), &[], Some(data))
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("upload", status, &body));
            }
            debug!("Azure put {}", key);
            Ok(())
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let creds = self.credentials().await;
            let resp = self.send(&creds, Method::GET, Some(&key), &[], None).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("download", status, &body));
            }
            let body = resp
                .bytes()
                .await
                .map_err(|e| anyhow::anyhow!("Azure download body read failed: {}", e))?;
            Ok(Some(body))
        })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let creds = self.credentials().await;
            let resp = self
                .send(&creds, Method::DELETE, Some(&key), &[], None)
                .await?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("delete", status, &body));
            }
            Ok(())
        })
    }

    fn list(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move { self.list_blobs(&prefix).await })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let creds = self.credentials().await;
            let query = [("restype".to_string(), "container".to_string())];
            let resp = self.send(&creds, Method::GET, None, &query, None).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("container properties", status, &body));
            }
            Ok(())
        })
    }

    fn reinitialize(
        &self,
        account_name: &str,
        secret: &Secret,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        // Validate before touching the live slot so a bad secret keeps the old set.
        let fresh = AzureCredentials::from_secret(account_name, secret);
        Box::pin(async move {
            let fresh = Arc::new(fresh?);
            let account = fresh.account.clone();
            *self.credentials.write().await = fresh;
            info!("Azure blob backend credentials replaced for account {}", account);
            Ok(())
        })
    }
}

// -- Tests -------------------------------------------------------------------
