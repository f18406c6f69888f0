//! Startup sequencing.
//!
//! Storage is selected first; only once it exists is the pipeline built
//! around it.  On the Key Vault path the rotation task starts after the
//! pipeline, so the first rotation never races the initial fetch.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::info;

use crate::cache::{CacheHandle, RedisCache, UpdateCache};
use crate::config::{CacheConfig, Config};
use crate::errors::StartupError;
use crate::rotation::{CredentialRotation, RotationHandle};
use crate::server::Pipeline;
use crate::storage::{select_storage, StorageHandle, StorageSelection};
use crate::vault::SecretStoreConnector;
use crate::AppState;

/// A ready-to-serve service.
pub struct Service {
    pub router: Router,
    pub state: Arc<AppState>,
    pub storage: StorageHandle,
    /// Running only when the storage key came from a Key Vault.
    pub rotation: Option<RotationHandle>,
}

impl Service {
    /// Stop background work.  Call after the listener has drained.
    pub async fn shutdown(self) {
        if let Some(rotation) = self.rotation {
            rotation.stop().await;
            info!("Credential rotation stopped");
        }
    }
}

/// Select storage, build the pipeline and start credential rotation.
///
/// Either a complete [`Service`] or an error; a failed secret fetch never
/// yields a router.
pub async fn start(
    config: Config,
    connector: &dyn SecretStoreConnector,
) -> Result<Service, StartupError> {
    let selection = StorageSelection::from_config(&config.storage);
    info!("Starting with {} storage", selection.name());

    let selected = select_storage(&selection, &config.storage.container, connector).await?;
    let storage = selected.handle.clone();
    let interval = Duration::from_millis(config.storage.refresh_credentials_interval_ms);

    let cache = open_cache(&config.cache)?;
    let state = Arc::new(AppState::new(config, storage.clone()).with_cache(cache));
    let router = Pipeline::build(state.clone());

    let rotation = selected.vault.map(|vault| {
        info!(
            "Rotating credentials for storage account {} every {:?}",
            vault.storage_account, interval
        );
        CredentialRotation::new(storage.clone(), vault, interval).start()
    });

    Ok(Service {
        router,
        state,
        storage,
        rotation,
    })
}

fn open_cache(config: &CacheConfig) -> Result<Option<CacheHandle>, StartupError> {
    let Some(url) = &config.redis_url else {
        return Ok(None);
    };
    let cache =
        RedisCache::new(url, config.ttl_secs).map_err(|e| StartupError::Config(format!("{e:#}")))?;
    info!("Update-check cache enabled ({})", cache.kind());
    Ok(Some(Arc::new(cache)))
}
