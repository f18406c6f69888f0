//! OAuth token acquisition for Key Vault requests.
//!
//! Credentials are resolved from the environment:
//!   - `AZURE_TENANT_ID` + `AZURE_CLIENT_ID` + `AZURE_CLIENT_SECRET`
//!     (service principal, client-credentials grant)
//!   - otherwise the managed identity endpoint, optionally pinned to a
//!     user-assigned identity through `AZURE_CLIENT_ID`

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Default Azure AD authority host.
const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Instance metadata service token endpoint.
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Refresh tokens this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

enum CredentialSource {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ManagedIdentity {
        client_id: Option<String>,
    },
}

struct CachedToken {
    scope: String,
    token: String,
    refresh_at: Instant,
}

/// Credential provider resolving bearer tokens for Azure resources.
pub struct DefaultCredential {
    client: reqwest::Client,
    source: CredentialSource,
    cached: Mutex<Option<CachedToken>>,
}

impl DefaultCredential {
    /// Resolve the credential source from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve the credential source through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let source = match (
            var("AZURE_TENANT_ID"),
            var("AZURE_CLIENT_ID"),
            var("AZURE_CLIENT_SECRET"),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                CredentialSource::ClientSecret {
                    tenant_id,
                    client_id,
                    client_secret,
                }
            }
            (_, client_id, _) => CredentialSource::ManagedIdentity { client_id },
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            source,
            cached: Mutex::new(None),
        })
    }

    /// Name of the resolved source, for logging.
    pub fn source_name(&self) -> &'static str {
        match self.source {
            CredentialSource::ClientSecret { .. } => "client-secret",
            CredentialSource::ManagedIdentity { .. } => "managed-identity",
        }
    }

    /// Return a bearer token for `scope`, reusing the cached one while it is fresh.
    pub async fn token(&self, scope: &str) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.scope == scope && Instant::now() < entry.refresh_at {
                return Ok(entry.token.clone());
            }
        }

        let (token, expires_in) = match &self.source {
            CredentialSource::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                self.client_secret_token(tenant_id, client_id, client_secret, scope)
                    .await?
            }
            CredentialSource::ManagedIdentity { client_id } => {
                self.managed_identity_token(client_id.as_deref(), scope)
                    .await?
            }
        };
        debug!(
            "Acquired {} token for {} (expires in {}s)",
            self.source_name(),
            scope,
            expires_in
        );

        *cached = Some(CachedToken {
            scope: scope.to_string(),
            token: token.clone(),
            refresh_at: refresh_deadline(Instant::now(), expires_in),
        });
        Ok(token)
    }

    async fn client_secret_token(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        scope: &str,
    ) -> anyhow::Result<(String, u64)> {
        let url = format!("{AUTHORITY_HOST}/{tenant_id}/oauth2/v2.0/token");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", scope),
        ];

        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token request failed: {}", e))?;
        parse_token_response(resp).await
    }

    async fn managed_identity_token(
        &self,
        client_id: Option<&str>,
        scope: &str,
    ) -> anyhow::Result<(String, u64)> {
        let resource = scope_to_resource(scope);
        let mut query = vec![("api-version", "2018-02-01"), ("resource", resource)];
        if let Some(id) = client_id {
            query.push(("client_id", id));
        }

        let resp = self
            .client
            .get(IMDS_TOKEN_ENDPOINT)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Managed identity token request failed: {}", e))?;
        parse_token_response(resp).await
    }
}

/// Managed identity endpoints take a resource URI rather than a `/.default` scope.
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

fn refresh_deadline(now: Instant, expires_in: u64) -> Instant {
    let lifetime = Duration::from_secs(expires_in);
    now + lifetime.saturating_sub(EXPIRY_MARGIN)
}

async fn parse_token_response(resp: reqwest::Response) -> anyhow::Result<(String, u64)> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Token endpoint returned HTTP {} - {}", status, body);
    }
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Token response is not JSON: {}", e))?;
    token_from_json(&body)
}

/// Extract `(access_token, expires_in)`; `expires_in` is a string on the
/// managed identity endpoint and a number elsewhere.
fn token_from_json(body: &serde_json::Value) -> anyhow::Result<(String, u64)> {
    let token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Token response has no access_token"))?;
    let expires_in = match body.get("expires_in") {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };
    Ok((token.to_string(), expires_in))
}
