//! Azure Key Vault secret client.
//!
//! Reads secrets through the Key Vault REST API:
//! `GET {vault_url}/secrets/{name}?api-version=7.4` with a bearer token from
//! [`DefaultCredential`].  The secret is the `value` field of the response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::credential::DefaultCredential;
use super::{Secret, SecretStore, SecretStoreConnector};

/// Key Vault REST API version used for all requests.
const KEYVAULT_API_VERSION: &str = "7.4";

/// OAuth scope for Key Vault data-plane access.
const KEYVAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// Secret names are alphanumerics and dashes; encode anything else.
const SECRET_NAME_ENCODE_SET: &percent_encoding::AsciiSet =
    &percent_encoding::NON_ALPHANUMERIC.remove(b'-');

/// Secret store backed by one Key Vault.
pub struct KeyVaultClient {
    client: reqwest::Client,
    vault_url: String,
    credential: DefaultCredential,
}

impl KeyVaultClient {
    pub fn new(vault_url: &str, credential: DefaultCredential) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn secret_url(&self, name: &str) -> String {
        let encoded = percent_encoding::utf8_percent_encode(name, SECRET_NAME_ENCODE_SET);
        format!(
            "{}/secrets/{}?api-version={}",
            self.vault_url, encoded, KEYVAULT_API_VERSION
        )
    }

    async fn fetch(&self, name: &str) -> anyhow::Result<Secret> {
        let token = self.credential.token(KEYVAULT_SCOPE).await?;
        let url = self.secret_url(name);
        debug!("Fetching secret {} from {}", name, self.vault_url);

        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Key Vault request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Key Vault get_secret: HTTP {} - {}", status, body);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Key Vault response is not JSON: {}", e))?;
        secret_from_json(&body)
    }
}

impl SecretStore for KeyVaultClient {
    fn get_secret(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Secret>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move { self.fetch(&name).await })
    }
}

fn secret_from_json(body: &serde_json::Value) -> anyhow::Result<Secret> {
    body.get("value")
        .and_then(|v| v.as_str())
        .map(Secret::new)
        .ok_or_else(|| anyhow::anyhow!("Key Vault response has no secret value"))
}

/// Production connector: one [`KeyVaultClient`] per vault, authenticated
/// with a [`DefaultCredential`] resolved from the environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyVaultConnector;

impl SecretStoreConnector for KeyVaultConnector {
    fn connect(&self, vault_url: &str) -> anyhow::Result<Arc<dyn SecretStore>> {
        let credential = DefaultCredential::from_env()?;
        info!(
            "Key Vault client configured for {} using {} credentials",
            vault_url,
            credential.source_name()
        );
        Ok(Arc::new(KeyVaultClient::new(vault_url, credential)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> KeyVaultClient {
        let credential = DefaultCredential::from_lookup(|_| None).unwrap();
        KeyVaultClient::new("https://myvault.vault.azure.net/", credential).unwrap()
    }

    #[test]
    fn test_secret_url() {
        assert_eq!(
            client().secret_url("storage-acct"),
            "https://myvault.vault.azure.net/secrets/storage-acct?api-version=7.4"
        );
    }

    #[test]
    fn test_secret_from_json() {
        let secret = secret_from_json(&json!({"value": "c2VjcmV0", "id": "x"})).unwrap();
        assert_eq!(secret.expose(), "c2VjcmV0");
        assert!(secret_from_json(&json!({"id": "x"})).is_err());
    }
}
