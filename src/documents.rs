//! Typed JSON documents stored through the storage handle.
//!
//! Every record is one JSON blob under a fixed key layout:
//!
//! ```text
//! accounts/{account}.json
//! accessKeys/{key}.json
//! apps/{account}/{app}.json
//! deployments/{account}/{app}/{deployment}.json
//! deploymentKeys/{key}.json            -> DeploymentPointer
//! packages/{hash}                      -> raw package bytes
//! ```
//!
//! [`Documents`] holds the shared [`StorageHandle`], never a copy of the
//! backend, so credential rotation is visible here without re-wiring.

use anyhow::Context;
use bytes::Bytes;
use garde::Validate;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::storage::StorageHandle;

/// Deployments created with every new app.
pub const DEFAULT_DEPLOYMENTS: &[&str] = &["Production", "Staging"];

// ── Records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub created_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKey {
    pub name: String,
    pub friendly_name: String,
    pub account_id: String,
    pub created_time: i64,
    /// Expiry in epoch milliseconds.
    pub expires: i64,
}

impl AccessKey {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires <= now_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: String,
    pub name: String,
    pub created_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub label: String,
    pub app_version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_mandatory: bool,
    pub package_hash: String,
    pub size: u64,
    pub blob_key: String,
    pub upload_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub package: Option<Package>,
    /// Number of releases made to this deployment.
    #[serde(default)]
    pub release_count: u32,
    pub created_time: i64,
}

/// Index from a deployment key to the deployment it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPointer {
    pub account_id: String,
    pub app_name: String,
    pub deployment_name: String,
}

/// App and deployment names.
#[derive(Debug, Validate)]
pub struct NameInput {
    #[garde(length(min = 1, max = 128), pattern(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$"))]
    pub name: String,
}

/// Check an app or deployment name, returning the validation report on failure.
pub fn validate_name(name: &str) -> Result<(), String> {
    NameInput {
        name: name.to_string(),
    }
    .validate()
    .map_err(|e| e.to_string())
}

/// Contents and metadata of a release.
#[derive(Debug, Clone)]
pub struct NewRelease {
    pub contents: Bytes,
    pub app_version: String,
    pub description: String,
    pub is_mandatory: bool,
}

// ── Keys ────────────────────────────────────────────────────────────

fn account_key(account_id: &str) -> String {
    format!("accounts/{account_id}.json")
}

fn access_key_key(key: &str) -> String {
    format!("accessKeys/{key}.json")
}

fn apps_prefix(account_id: &str) -> String {
    format!("apps/{account_id}/")
}

fn app_key(account_id: &str, app: &str) -> String {
    format!("apps/{account_id}/{app}.json")
}

fn deployments_prefix(account_id: &str, app: &str) -> String {
    format!("deployments/{account_id}/{app}/")
}

fn deployment_key(account_id: &str, app: &str, deployment: &str) -> String {
    format!("deployments/{account_id}/{app}/{deployment}.json")
}

fn deployment_pointer_key(key: &str) -> String {
    format!("deploymentKeys/{key}.json")
}

pub fn package_blob_key(hash: &str) -> String {
    format!("packages/{hash}")
}

/// Whether `key` has the shape [`generate_key`] produces.  Anything else
/// never reaches a storage key.
pub fn is_well_formed_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= 128 && key.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn is_package_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Random URL-safe token used for access and deployment keys.
pub fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Store ───────────────────────────────────────────────────────────

/// Document access over the shared storage handle.
#[derive(Clone)]
pub struct Documents {
    storage: StorageHandle,
}

impl Documents {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.storage.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt document at {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let body = serde_json::to_vec(value)?;
        self.storage.put(key, Bytes::from(body)).await
    }

    async fn read_all<T: DeserializeOwned>(&self, prefix: &str) -> anyhow::Result<Vec<T>> {
        let mut out = Vec::new();
        for key in self.storage.list(prefix).await? {
            // Only direct children; deeper keys belong to nested collections.
            if key[prefix.len()..].contains('/') {
                continue;
            }
            if let Some(doc) = self.read(&key).await? {
                out.push(doc);
            }
        }
        Ok(out)
    }

    // -- Accounts --------------------------------------------------------

    pub async fn get_or_create_account(&self, account_id: &str) -> anyhow::Result<Account> {
        let key = account_key(account_id);
        if let Some(account) = self.read(&key).await? {
            return Ok(account);
        }
        let account = Account {
            id: account_id.to_string(),
            created_time: now_ms(),
        };
        self.write(&key, &account).await?;
        Ok(account)
    }

    // -- Access keys -----------------------------------------------------

    pub async fn create_access_key(
        &self,
        account_id: &str,
        friendly_name: &str,
        ttl_ms: i64,
    ) -> anyhow::Result<AccessKey> {
        let created_time = now_ms();
        let access_key = AccessKey {
            name: generate_key(),
            friendly_name: friendly_name.to_string(),
            account_id: account_id.to_string(),
            created_time,
            expires: created_time.saturating_add(ttl_ms),
        };
        self.write(&access_key_key(&access_key.name), &access_key)
            .await?;
        Ok(access_key)
    }

    /// Resolve an access key to its account, ignoring expired keys.
    pub async fn account_for_access_key(&self, key: &str) -> anyhow::Result<Option<String>> {
        if !is_well_formed_key(key) {
            return Ok(None);
        }
        let access_key: Option<AccessKey> = self.read(&access_key_key(key)).await?;
        Ok(access_key
            .filter(|k| !k.is_expired(now_ms()))
            .map(|k| k.account_id))
    }

    // -- Apps ------------------------------------------------------------

    pub async fn list_apps(&self, account_id: &str) -> anyhow::Result<Vec<App>> {
        self.read_all(&apps_prefix(account_id)).await
    }

    pub async fn get_app(&self, account_id: &str, name: &str) -> anyhow::Result<Option<App>> {
        self.read(&app_key(account_id, name)).await
    }

    /// Create an app with its default deployments.  The caller checks for
    /// an existing app of the same name.
    pub async fn create_app(&self, account_id: &str, name: &str) -> anyhow::Result<App> {
        let app = App {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_time: now_ms(),
        };
        self.write(&app_key(account_id, name), &app).await?;
        for deployment in DEFAULT_DEPLOYMENTS {
            self.create_deployment(account_id, name, deployment).await?;
        }
        Ok(app)
    }

    // -- Deployments -----------------------------------------------------

    pub async fn create_deployment(
        &self,
        account_id: &str,
        app: &str,
        name: &str,
    ) -> anyhow::Result<Deployment> {
        let deployment = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            key: generate_key(),
            package: None,
            release_count: 0,
            created_time: now_ms(),
        };
        self.write(&deployment_key(account_id, app, name), &deployment)
            .await?;
        let pointer = DeploymentPointer {
            account_id: account_id.to_string(),
            app_name: app.to_string(),
            deployment_name: name.to_string(),
        };
        self.write(&deployment_pointer_key(&deployment.key), &pointer)
            .await?;
        Ok(deployment)
    }

    pub async fn list_deployments(
        &self,
        account_id: &str,
        app: &str,
    ) -> anyhow::Result<Vec<Deployment>> {
        self.read_all(&deployments_prefix(account_id, app)).await
    }

    pub async fn get_deployment(
        &self,
        account_id: &str,
        app: &str,
        name: &str,
    ) -> anyhow::Result<Option<Deployment>> {
        self.read(&deployment_key(account_id, app, name)).await
    }

    /// Look a deployment up by its client-facing key.
    pub async fn deployment_by_key(&self, key: &str) -> anyhow::Result<Option<Deployment>> {
        if !is_well_formed_key(key) {
            return Ok(None);
        }
        let pointer: Option<DeploymentPointer> = self.read(&deployment_pointer_key(key)).await?;
        match pointer {
            Some(p) => {
                self.get_deployment(&p.account_id, &p.app_name, &p.deployment_name)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Store a package blob and make it the deployment's current release.
    pub async fn release(
        &self,
        account_id: &str,
        app: &str,
        mut deployment: Deployment,
        release: NewRelease,
    ) -> anyhow::Result<Package> {
        use sha2::Digest;

        let NewRelease {
            contents,
            app_version,
            description,
            is_mandatory,
        } = release;
        let package_hash = hex::encode(sha2::Sha256::digest(&contents));
        let blob_key = package_blob_key(&package_hash);
        let size = contents.len() as u64;
        self.storage.put(&blob_key, contents).await?;

        deployment.release_count += 1;
        let package = Package {
            label: format!("v{}", deployment.release_count),
            app_version,
            description,
            is_mandatory,
            package_hash,
            size,
            blob_key,
            upload_time: now_ms(),
        };
        deployment.package = Some(package.clone());
        self.write(&deployment_key(account_id, app, &deployment.name), &deployment)
            .await?;
        Ok(package)
    }

    pub async fn package_blob(&self, hash: &str) -> anyhow::Result<Option<Bytes>> {
        if !is_package_hash(hash) {
            return Ok(None);
        }
        self.storage.get(&package_blob_key(hash)).await
    }
}
