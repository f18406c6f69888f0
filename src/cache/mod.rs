//! Update-check cache.
//!
//! Update checks are the hottest acquisition path and every one of them
//! costs two storage reads.  When a Redis URL is configured the rendered
//! answers are cached per deployment key and dropped on every release to
//! that deployment.  Without one the service runs uncached.

pub mod redis_cache;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use redis_cache::RedisCache;

/// The process-wide cache, if one is configured.
pub type CacheHandle = Arc<dyn UpdateCache>;

/// Cached update-check answers, grouped by deployment key.
pub trait UpdateCache: Send + Sync + 'static {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Verify the cache server answers.
    fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// The cached answer to `request` against `deployment_key`.
    fn get_update(
        &self,
        deployment_key: &str,
        request: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>>;

    /// Remember `body` as the answer to `request` against `deployment_key`.
    fn put_update(
        &self,
        deployment_key: &str,
        request: &str,
        body: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Forget every answer cached for `deployment_key`.
    fn invalidate(
        &self,
        deployment_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Redis hash holding the answers for one deployment.
pub fn cache_key(deployment_key: &str) -> String {
    format!("cache:{deployment_key}")
}

/// Hash field identifying one update-check request.
///
/// The base URL is part of it because download URLs in the answer are
/// absolute.
pub fn request_field(app_version: &str, package_hash: Option<&str>, base_url: &str) -> String {
    format!(
        "{base_url}|{app_version}|{}",
        package_hash.unwrap_or_default()
    )
}
