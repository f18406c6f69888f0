//! Remote secret store access.
//!
//! The storage account key can live in an Azure Key Vault instead of the
//! process environment.  [`SecretStore`] is the seam the storage selector
//! and the credential rotation task fetch through; [`KeyVaultConnector`]
//! is the production implementation.

pub mod credential;
pub mod keyvault;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use credential::DefaultCredential;
pub use keyvault::{KeyVaultClient, KeyVaultConnector};

/// Opaque credential material fetched from a secret store.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    value: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// The raw secret value.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Async secret lookup by name.
pub trait SecretStore: Send + Sync + 'static {
    fn get_secret(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Secret>> + Send + '_>>;
}

/// Builds a [`SecretStore`] for a vault endpoint.
pub trait SecretStoreConnector: Send + Sync + 'static {
    fn connect(&self, vault_url: &str) -> anyhow::Result<Arc<dyn SecretStore>>;
}

/// Endpoint of the Key Vault named `account`.
pub fn vault_url(account: &str) -> String {
    format!("https://{account}.vault.azure.net")
}

/// Name of the secret holding the key for `storage_account`.
pub fn secret_name(storage_account: &str) -> String {
    format!("storage-{storage_account}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_url() {
        assert_eq!(vault_url("myvault"), "https://myvault.vault.azure.net");
    }

    #[test]
    fn test_secret_name() {
        assert_eq!(secret_name("prodstore"), "storage-prodstore");
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
        assert_eq!(secret.expose(), "hunter2");
    }
}
