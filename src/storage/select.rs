//! Storage backend selection.
//!
//! [`StorageSelection::from_config`] picks exactly one path with a fixed
//! precedence: the local flag first, then the presence of a Key Vault
//! account, else plain cloud storage.  [`select_storage`] then builds the
//! backend; only the vault path performs I/O (one secret fetch).

use std::sync::Arc;

use tracing::info;

use super::azure::AzureBlobBackend;
use super::backend::StorageHandle;
use super::memory::MemoryBackend;
use crate::config::StorageConfig;
use crate::errors::StartupError;
use crate::vault::{secret_name, vault_url, SecretStore, SecretStoreConnector};

/// The storage path chosen at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSelection {
    /// In-memory backend, no network calls.
    Local,
    /// Cloud storage with credentials from the process environment.
    PlainCloud { storage_account: Option<String> },
    /// Cloud storage with its key fetched from a Key Vault.
    VaultResolved {
        vault_account: String,
        storage_account: Option<String>,
    },
}

impl StorageSelection {
    pub fn from_config(config: &StorageConfig) -> Self {
        if config.use_local_storage {
            return StorageSelection::Local;
        }
        match &config.keyvault_account {
            Some(vault_account) => StorageSelection::VaultResolved {
                vault_account: vault_account.clone(),
                storage_account: config.storage_account.clone(),
            },
            None => StorageSelection::PlainCloud {
                storage_account: config.storage_account.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageSelection::Local => "local",
            StorageSelection::PlainCloud { .. } => "plain-cloud",
            StorageSelection::VaultResolved { .. } => "vault-resolved",
        }
    }
}

/// What the rotation task needs to re-fetch the storage secret.
#[derive(Clone)]
pub struct VaultBinding {
    pub secret_store: Arc<dyn SecretStore>,
    pub storage_account: String,
}

impl VaultBinding {
    pub fn secret_name(&self) -> String {
        secret_name(&self.storage_account)
    }
}

/// The constructed backend plus, on the vault path, its secret source.
pub struct SelectedStorage {
    pub handle: StorageHandle,
    pub vault: Option<VaultBinding>,
}

impl SelectedStorage {
    /// Whether the storage key came from a Key Vault.
    pub fn is_vault_configured(&self) -> bool {
        self.vault.is_some()
    }
}

/// Build the storage backend for `selection`.
///
/// A failed secret fetch is fatal: the caller must not start serving.
pub async fn select_storage(
    selection: &StorageSelection,
    container: &str,
    connector: &dyn SecretStoreConnector,
) -> Result<SelectedStorage, StartupError> {
    let selected = match selection {
        StorageSelection::Local => SelectedStorage {
            handle: Arc::new(MemoryBackend::new()),
            vault: None,
        },
        StorageSelection::PlainCloud { storage_account } => {
            let account = require_account(storage_account)?;
            let backend = AzureBlobBackend::from_env(container.to_string(), account)
                .map_err(StartupError::Storage)?;
            SelectedStorage {
                handle: Arc::new(backend),
                vault: None,
            }
        }
        StorageSelection::VaultResolved {
            vault_account,
            storage_account,
        } => {
            let account = require_account(storage_account)?;
            let url = vault_url(vault_account);
            let secret_store = connector.connect(&url).map_err(StartupError::Storage)?;

            let name = secret_name(account);
            let secret = secret_store
                .get_secret(&name)
                .await
                .map_err(|source| StartupError::SecretFetch {
                    name: name.clone(),
                    source,
                })?;

            let backend = AzureBlobBackend::from_secret(container.to_string(), account, &secret)
                .map_err(StartupError::Storage)?;
            SelectedStorage {
                handle: Arc::new(backend),
                vault: Some(VaultBinding {
                    secret_store,
                    storage_account: account.to_string(),
                }),
            }
        }
    };

    info!(
        "Storage selected: path={} backend={}",
        selection.name(),
        selected.handle.kind()
    );
    Ok(selected)
}

fn require_account(account: &Option<String>) -> Result<&str, StartupError> {
    account.as_deref().ok_or_else(|| {
        StartupError::Config("AZURE_STORAGE_ACCOUNT is required for cloud storage".to_string())
    })
}
