//! Configuration loading and types for the CodePush server.
//!
//! Configuration is read from an optional YAML file and deserialized into
//! the [`Config`] struct, then overlaid with the environment variables the
//! service has always honoured (`AZURE_KEYVAULT_ACCOUNT`, `DISABLE_MANAGEMENT`,
//! ...).  Every field has a default, so an empty document is valid.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::path::Path;

/// Default credential refresh interval: once a day.
pub const DEFAULT_REFRESH_CREDENTIALS_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend selection and credential refresh.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Feature switches, read once at startup.
    #[serde(default)]
    pub features: FeatureFlags,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Cross-origin settings.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Update-check cache; off unless a Redis URL is configured.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// HTTP listener and request-limit configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on the total processing time of one request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum size of a JSON request body.
    #[serde(default = "default_json_limit")]
    pub json_limit_bytes: usize,

    /// Maximum size of a URL-encoded request body.
    #[serde(default = "default_urlencoded_limit")]
    pub urlencoded_limit_bytes: usize,

    /// Maximum size of a multipart package upload.
    #[serde(default = "default_upload_limit")]
    pub upload_limit_bytes: usize,

    /// Directory holding view templates; images are served from `<views_dir>/images`.
    #[serde(default = "default_views_dir")]
    pub views_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            json_limit_bytes: default_json_limit(),
            urlencoded_limit_bytes: default_urlencoded_limit(),
            upload_limit_bytes: default_upload_limit(),
            views_dir: default_views_dir(),
        }
    }
}

/// Storage backend selection inputs.
///
/// Precedence: `use_local_storage` first, then the presence of
/// `keyvault_account`, else plain cloud storage.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Use the in-memory backend; no network calls at all.
    #[serde(default)]
    pub use_local_storage: bool,

    /// Key Vault account holding the storage secret.
    #[serde(default)]
    pub keyvault_account: Option<String>,

    /// Azure storage account name.
    #[serde(default)]
    pub storage_account: Option<String>,

    /// Blob container holding the service's documents.
    #[serde(default = "default_container")]
    pub container: String,

    /// Interval between credential refreshes, in milliseconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_credentials_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            use_local_storage: false,
            keyvault_account: None,
            storage_account: None,
            container: default_container(),
            refresh_credentials_interval_ms: default_refresh_interval(),
        }
    }
}

/// Boolean switches, immutable for the process lifetime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub disable_acquisition: bool,

    #[serde(default)]
    pub disable_management: bool,

    /// Replace real authentication with a synthetic user identity.
    #[serde(default)]
    pub debug_disable_auth: bool,

    /// Identity injected when `debug_disable_auth` is set. `None` means `"default"`.
    #[serde(default)]
    pub debug_user_id: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log one line per received request.
    #[serde(default)]
    pub requests: bool,

    /// Keep the raw text of JSON bodies so malformed ones can be logged.
    #[serde(default)]
    pub invalid_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            requests: false,
            invalid_json: false,
        }
    }
}

/// Cross-origin configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origin")]
    pub origin: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origin: default_cors_origin(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

/// Redis cache for update-check results.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// `redis://` or `rediss://` URL.  `None` disables the cache.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Lifetime of a cached deployment entry.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Config {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Overlay environment-style variables resolved through `lookup`.
    ///
    /// Unset and empty variables leave the current value in place.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let flag = |name: &str| var(name).map(|v| v == "true");

        if let Some(v) = var("AZURE_KEYVAULT_ACCOUNT") {
            self.storage.keyvault_account = Some(v);
        }
        if let Some(v) = var("AZURE_STORAGE_ACCOUNT") {
            self.storage.storage_account = Some(v);
        }
        if let Some(v) = var("AZURE_STORAGE_CONTAINER") {
            self.storage.container = v;
        }
        if let Some(v) = flag("USE_LOCAL_STORAGE") {
            self.storage.use_local_storage = v;
        }
        if let Some(v) = var("REFRESH_CREDENTIALS_INTERVAL") {
            self.storage.refresh_credentials_interval_ms = parse_interval_ms(&v);
        }

        if let Some(v) = flag("LOGGING") {
            self.logging.requests = v;
        }
        if let Some(v) = flag("LOG_INVALID_JSON_REQUESTS") {
            self.logging.invalid_json = v;
        }
        if let Some(v) = var("CORS_ORIGIN") {
            self.cors.origin = v;
        }

        if let Some(v) = flag("DISABLE_ACQUISITION") {
            self.features.disable_acquisition = v;
        }
        if let Some(v) = flag("DISABLE_MANAGEMENT") {
            self.features.disable_management = v;
        }
        if let Some(v) = flag("DEBUG_DISABLE_AUTH") {
            self.features.debug_disable_auth = v;
        }
        if let Some(v) = var("DEBUG_USER_ID") {
            self.features.debug_user_id = Some(v);
        }

        if let Some(host) = var("REDIS_HOST") {
            let port = var("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
            self.cache.redis_url = Some(redis_url(&host, &port, var("REDIS_KEY").as_deref()));
        }

        if let Some(port) = var("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(ms) = var("REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.server.request_timeout_ms = ms;
        }
    }
}

/// Connection URL for a Redis host.  An access key switches to TLS.
fn redis_url(host: &str, port: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => {
            let key = utf8_percent_encode(key, NON_ALPHANUMERIC);
            format!("rediss://:{key}@{host}:{port}")
        }
        None => format!("redis://{host}:{port}"),
    }
}

/// Parse a refresh interval, falling back to one day for anything that is
/// not a positive number of milliseconds.
fn parse_interval_ms(raw: &str) -> u64 {
    match raw.trim().parse::<f64>() {
        Ok(ms) if ms.is_finite() && ms >= 1.0 => ms as u64,
        _ => DEFAULT_REFRESH_CREDENTIALS_INTERVAL_MS,
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_json_limit() -> usize {
    10 * 1024
}

fn default_urlencoded_limit() -> usize {
    100 * 1024
}

fn default_upload_limit() -> usize {
    200 * 1024 * 1024
}

fn default_views_dir() -> String {
    "./views".to_string()
}

fn default_container() -> String {
    "codepush".to_string()
}

fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_CREDENTIALS_INTERVAL_MS
}

fn default_cache_ttl_secs() -> u64 {
    60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_cors_origin() -> String {
    "http://localhost:4000".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config: Config = serde_yaml::from_str(&contents)?;
    if config.storage.refresh_credentials_interval_ms == 0 {
        config.storage.refresh_credentials_interval_ms = DEFAULT_REFRESH_CREDENTIALS_INTERVAL_MS;
    }
    Ok(config)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cors.origin, "http://localhost:4000");
        assert_eq!(config.server.json_limit_bytes, 10 * 1024);
        assert_eq!(
            config.storage.refresh_credentials_interval_ms,
            86_400_000
        );
        assert!(!config.features.disable_management);
        assert!(config.features.debug_user_id.is_none());
    }

    #[test]
    fn test_env_overlay() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("AZURE_KEYVAULT_ACCOUNT", "vault1"),
            ("AZURE_STORAGE_ACCOUNT", "acct1"),
            ("LOGGING", "true"),
            ("LOG_INVALID_JSON_REQUESTS", "true"),
            ("CORS_ORIGIN", "https://example.com"),
            ("DISABLE_ACQUISITION", "true"),
            ("DEBUG_DISABLE_AUTH", "true"),
            ("DEBUG_USER_ID", "alice"),
            ("REFRESH_CREDENTIALS_INTERVAL", "60000"),
        ]));

        assert_eq!(config.storage.keyvault_account.as_deref(), Some("vault1"));
        assert_eq!(config.storage.storage_account.as_deref(), Some("acct1"));
        assert!(config.logging.requests);
        assert!(config.logging.invalid_json);
        assert_eq!(config.cors.origin, "https://example.com");
        assert!(config.features.disable_acquisition);
        assert!(!config.features.disable_management);
        assert!(config.features.debug_disable_auth);
        assert_eq!(config.features.debug_user_id.as_deref(), Some("alice"));
        assert_eq!(config.storage.refresh_credentials_interval_ms, 60_000);
    }

    #[test]
    fn test_redis_env() {
        let mut config = Config::default();
        assert!(config.cache.redis_url.is_none());

        config.apply_env(env(&[("REDIS_HOST", "cache.local")]));
        assert_eq!(
            config.cache.redis_url.as_deref(),
            Some("redis://cache.local:6379")
        );

        config.apply_env(env(&[
            ("REDIS_HOST", "cache.local"),
            ("REDIS_PORT", "6380"),
            ("REDIS_KEY", "s3cr/t="),
        ]));
        assert_eq!(
            config.cache.redis_url.as_deref(),
            Some("rediss://:s3cr%2Ft%3D@cache.local:6380")
        );
    }

    #[test]
    fn test_flags_require_exact_true() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("DISABLE_MANAGEMENT", "TRUE"),
            ("LOGGING", "1"),
            ("DEBUG_DISABLE_AUTH", "yes"),
        ]));
        assert!(!config.features.disable_management);
        assert!(!config.logging.requests);
        assert!(!config.features.debug_disable_auth);
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("AZURE_KEYVAULT_ACCOUNT", ""),
            ("CORS_ORIGIN", ""),
            ("DEBUG_USER_ID", ""),
        ]));
        assert!(config.storage.keyvault_account.is_none());
        assert_eq!(config.cors.origin, "http://localhost:4000");
        assert!(config.features.debug_user_id.is_none());
    }

    #[test]
    fn test_invalid_refresh_interval_falls_back() {
        assert_eq!(parse_interval_ms("abc"), DEFAULT_REFRESH_CREDENTIALS_INTERVAL_MS);
        assert_eq!(parse_interval_ms("0"), DEFAULT_REFRESH_CREDENTIALS_INTERVAL_MS);
        assert_eq!(parse_interval_ms("-5"), DEFAULT_REFRESH_CREDENTIALS_INTERVAL_MS);
        assert_eq!(parse_interval_ms("1500"), 1500);
    }

    #[test]
    fn test_load_yaml_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 8080\nstorage:\n  use_local_storage: true\nfeatures:\n  disable_management: true\n"
        )
        .unwrap();

        let mut config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.storage.use_local_storage);
        assert!(config.features.disable_management);
        assert_eq!(config.server.request_timeout_ms, 30_000);

        config.apply_env(env(&[("DISABLE_MANAGEMENT", "false")]));
        assert!(!config.features.disable_management);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.storage.container, "codepush");
        assert!(config.observability.metrics);
    }
}
