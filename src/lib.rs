//! CodePush server library: storage selection, the request pipeline and
//! storage credential rotation.
//!
//! [`startup::start`] selects the storage backend, builds the pipeline
//! around it and, when the storage key comes from a Key Vault, starts the
//! rotation task that keeps the key fresh.

use std::sync::Arc;

pub mod cache;
pub mod config;
pub mod documents;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod rotation;
pub mod server;
pub mod startup;
pub mod storage;
pub mod telemetry;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

use crate::cache::CacheHandle;
use crate::config::Config;
use crate::documents::Documents;
use crate::storage::StorageHandle;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The one live storage backend; rotation swaps its credentials in place.
    pub storage: StorageHandle,
    /// Typed documents over `storage`.
    pub documents: Documents,
    /// Update-check cache, when one is configured.
    pub cache: Option<CacheHandle>,
}

impl AppState {
    pub fn new(config: Config, storage: StorageHandle) -> Self {
        Self {
            config,
            documents: Documents::new(storage.clone()),
            storage,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<CacheHandle>) -> Self {
        self.cache = cache;
        self
    }
}
