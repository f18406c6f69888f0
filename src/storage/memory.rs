//! In-memory storage backend.
//!
//! Values are held in a `tokio::sync::RwLock<BTreeMap<...>>`, so listing by
//! prefix comes back sorted.  Nothing survives a restart; this is the
//! backend for local development and tests, and it never touches the
//! network.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use super::backend::StorageBackend;
use crate::vault::Secret;

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryBackend {
    /// key -> value.
    entries: tokio::sync::RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl StorageBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.write().await.insert(key, data);
            Ok(())
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.entries.read().await.get(&key).cloned()) })
    }

    fn delete(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.write().await.remove(&key);
            Ok(())
        })
    }

    fn list(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect())
        })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn reinitialize(
        &self,
        account_name: &str,
        _secret: &Secret,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        tracing::debug!(
            "Memory backend has no credentials; ignoring reinitialize for {}",
            account_name
        );
        Box::pin(async { Ok(()) })
    }
}
