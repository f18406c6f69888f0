//! Shared fixtures for in-crate tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::cache::{CacheHandle, UpdateCache};
use crate::config::Config;
use crate::storage::memory::MemoryBackend;
use crate::storage::{StorageBackend, StorageHandle};
use crate::vault::Secret;
use crate::AppState;

pub(crate) fn state_with(config: Config, storage: StorageHandle) -> Arc<AppState> {
    Arc::new(AppState::new(config, storage))
}

pub(crate) fn test_state() -> Arc<AppState> {
    state_with_config(Config::default())
}

pub(crate) fn state_with_config(config: Config) -> Arc<AppState> {
    state_with(config, Arc::new(MemoryBackend::new()))
}

pub(crate) fn state_with_storage(storage: StorageHandle) -> Arc<AppState> {
    state_with(Config::default(), storage)
}

/// Backend whose health check always fails.
pub(crate) struct FailingHealthBackend;

impl StorageBackend for FailingHealthBackend {
    fn kind(&self) -> &'static str {
        "failing"
    }

    fn put(
        &self,
        _key: &str,
        _data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { anyhow::bail!("unavailable") })
    }

    fn get(
        &self,
        _key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>> {
        Box::pin(async { anyhow::bail!("unavailable") })
    }

    fn delete(&self, _key: &str) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { anyhow::bail!("unavailable") })
    }

    fn list(
        &self,
        _prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        Box::pin(async { anyhow::bail!("unavailable") })
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { anyhow::bail!("container unreachable") })
    }

    fn reinitialize(
        &self,
        _account_name: &str,
        _secret: &Secret,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

pub(crate) fn state_with_cache(cache: Arc<FakeCache>) -> Arc<AppState> {
    let storage: StorageHandle = Arc::new(MemoryBackend::new());
    let cache: CacheHandle = cache;
    Arc::new(AppState::new(Config::default(), storage).with_cache(Some(cache)))
}

/// In-memory [`UpdateCache`] with switchable health and failure modes.
pub(crate) struct FakeCache {
    pub entries: Mutex<HashMap<String, HashMap<String, String>>>,
    pub hits: AtomicUsize,
    healthy: AtomicBool,
    failing: AtomicBool,
}

impl FakeCache {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make every read and write fail.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn cached(&self, deployment_key: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(deployment_key)
            .map_or(0, HashMap::len)
    }

    fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "cache unavailable");
        Ok(())
    }
}

impl UpdateCache for FakeCache {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let healthy = self.healthy.load(Ordering::SeqCst);
        Box::pin(async move {
            anyhow::ensure!(healthy, "cache unreachable");
            Ok(())
        })
    }

    fn get_update(
        &self,
        deployment_key: &str,
        request: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let result = self.check().map(|()| {
            let cached = self
                .entries
                .lock()
                .unwrap()
                .get(deployment_key)
                .and_then(|fields| fields.get(request).cloned());
            if cached.is_some() {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
            cached
        });
        Box::pin(async move { result })
    }

    fn put_update(
        &self,
        deployment_key: &str,
        request: &str,
        body: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let result = self.check().map(|()| {
            self.entries
                .lock()
                .unwrap()
                .entry(deployment_key.to_string())
                .or_default()
                .insert(request.to_string(), body);
        });
        Box::pin(async move { result })
    }

    fn invalidate(
        &self,
        deployment_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let result = self.check().map(|()| {
            self.entries.lock().unwrap().remove(deployment_key);
        });
        Box::pin(async move { result })
    }
}
