//! Credentials for calling Azure resource APIs.
//!
//! [`DefaultCredential`] tries a service principal from the environment
//! first and a managed identity second, and caches tokens until shortly
//! before they expire.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Cached tokens are replaced this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential unavailable: {0}")]
    Unavailable(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
}

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

impl AccessToken {
    pub fn is_fresh(&self) -> bool {
        self.expires_on - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) > Utc::now()
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken, CredentialError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<Value>,
    expires_on: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

impl TokenResponse {
    fn into_access_token(self) -> Result<AccessToken, CredentialError> {
        let now = Utc::now();
        let expires_on = if let Some(secs) = self.expires_on.as_ref().and_then(as_seconds) {
            DateTime::from_timestamp(secs, 0)
        } else {
            self.expires_in
                .as_ref()
                .and_then(as_seconds)
                .map(|secs| now + chrono::Duration::seconds(secs))
        };

        let expires_on = expires_on.ok_or_else(|| {
            CredentialError::Authentication("token response has no expiry".to_string())
        })?;

        Ok(AccessToken {
            token: self.access_token,
            expires_on,
        })
    }
}

// Token endpoints disagree on whether numbers are quoted
fn as_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

async fn read_token(response: reqwest::Response) -> Result<AccessToken, CredentialError> {
    let status = response.status();
    if !status.is_success() {
        let detail = match response.json::<TokenErrorResponse>().await {
            Ok(body) => format!(
                "{}: {}",
                body.error.unwrap_or_else(|| status.to_string()),
                body.error_description.unwrap_or_default()
            ),
            Err(_) => status.to_string(),
        };
        return Err(CredentialError::Authentication(detail));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| CredentialError::Authentication(format!("invalid token response: {}", e)))?
        .into_access_token()
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, CredentialError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| CredentialError::Unavailable(format!("failed to create HTTP client: {}", e)))
}

/// Service principal secret from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and
/// `AZURE_CLIENT_SECRET` (client credentials grant).
pub struct EnvironmentCredential {
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

impl EnvironmentCredential {
    pub fn new(
        authority_host: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            authority_host: authority_host.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http: http_client(Duration::from_secs(30))?,
        })
    }

    /// `None` when the environment does not describe a service principal.
    pub fn from_env() -> Option<Result<Self, CredentialError>> {
        let non_empty = |name: &str| env::var(name).ok().filter(|v| !v.is_empty());
        let tenant_id = non_empty("AZURE_TENANT_ID")?;
        let client_id = non_empty("AZURE_CLIENT_ID")?;
        let client_secret = non_empty("AZURE_CLIENT_SECRET")?;
        let authority_host =
            non_empty("AZURE_AUTHORITY_HOST").unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string());
        Some(Self::new(authority_host, tenant_id, client_id, client_secret))
    }

    fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken, CredentialError> {
        let scope = scopes.join(" ");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!(client_id = %self.client_id, "Requesting token with client credentials");
        let response = self
            .http
            .post(self.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                CredentialError::Unavailable(format!("token endpoint unreachable: {}", e))
            })?;

        read_token(response).await
    }
}

enum ManagedIdentitySource {
    AppService { endpoint: String, header: String },
    Imds { endpoint: String },
}

/// Managed identity via the App Service identity endpoint or the instance
/// metadata service.
pub struct ManagedIdentityCredential {
    source: ManagedIdentitySource,
    client_id: Option<String>,
    http: reqwest::Client,
}

impl ManagedIdentityCredential {
    pub fn from_env() -> Result<Self, CredentialError> {
        let source = match (env::var("IDENTITY_ENDPOINT"), env::var("IDENTITY_HEADER")) {
            (Ok(endpoint), Ok(header)) => ManagedIdentitySource::AppService { endpoint, header },
            _ => ManagedIdentitySource::Imds {
                endpoint: IMDS_ENDPOINT.to_string(),
            },
        };
        // AZURE_CLIENT_ID selects a user-assigned identity
        let client_id = env::var("AZURE_CLIENT_ID").ok().filter(|v| !v.is_empty());
        Ok(Self {
            source,
            client_id,
            http: http_client(Duration::from_secs(10))?,
        })
    }

    /// Instance metadata service at a custom address.
    pub fn imds(
        endpoint: impl Into<String>,
        client_id: Option<String>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            source: ManagedIdentitySource::Imds {
                endpoint: endpoint.into(),
            },
            client_id,
            http: http_client(Duration::from_secs(10))?,
        })
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken, CredentialError> {
        let [scope] = scopes else {
            return Err(CredentialError::Unavailable(
                "managed identity supports exactly one scope".to_string(),
            ));
        };
        let resource = scope.trim_end_matches("/.default");

        let mut query = vec![("resource", resource.to_string())];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.clone()));
        }

        let request = match &self.source {
            ManagedIdentitySource::AppService { endpoint, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION.to_string()));
                self.http.get(endpoint).header("X-IDENTITY-HEADER", header)
            }
            ManagedIdentitySource::Imds { endpoint } => {
                query.push(("api-version", IMDS_API_VERSION.to_string()));
                self.http.get(endpoint).header("Metadata", "true")
            }
        };

        let response = request
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                CredentialError::Unavailable(format!(
                    "managed identity endpoint unreachable: {}",
                    e
                ))
            })?;

        read_token(response).await
    }
}

/// Ordered credential chain with a per-scope token cache.
pub struct DefaultCredential {
    sources: Vec<Box<dyn TokenCredential>>,
    cache: RwLock<HashMap<String, AccessToken>>,
}

impl DefaultCredential {
    pub fn from_env() -> Result<Self, CredentialError> {
        let mut sources: Vec<Box<dyn TokenCredential>> = Vec::new();
        if let Some(environment) = EnvironmentCredential::from_env() {
            sources.push(Box::new(environment?));
        }
        sources.push(Box::new(ManagedIdentityCredential::from_env()?));
        Ok(Self::with_sources(sources))
    }

    pub fn with_sources(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self {
            sources,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TokenCredential for DefaultCredential {
    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken, CredentialError> {
        let key = scopes.join(" ");
        if let Some(token) = self.cache.read().await.get(&key) {
            if token.is_fresh() {
                return Ok(token.clone());
            }
        }

        let mut failures = Vec::new();
        for source in &self.sources {
            match source.get_token(scopes).await {
                Ok(token) => {
                    self.cache.write().await.insert(key, token.clone());
                    return Ok(token);
                }
                Err(e) => {
                    warn!(error = %e, "Credential source failed, trying next");
                    failures.push(e.to_string());
                }
            }
        }

        Err(CredentialError::Unavailable(if failures.is_empty() {
            "no credential sources configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        calls: Arc<AtomicUsize>,
        lifetime_secs: i64,
    }

    #[async_trait]
    impl TokenCredential for Fixed {
        async fn get_token(&self, _scopes: &[&str]) -> Result<AccessToken, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("token-{}", n),
                expires_on: Utc::now() + chrono::Duration::seconds(self.lifetime_secs),
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl TokenCredential for Failing {
        async fn get_token(&self, _scopes: &[&str]) -> Result<AccessToken, CredentialError> {
            Err(CredentialError::Unavailable("not on Azure".to_string()))
        }
    }

    #[test]
    fn test_token_response_expiry_forms() {
        let relative: TokenResponse =
            serde_json::from_value(json!({"access_token": "a", "expires_in": 3599})).unwrap();
        assert!(relative.into_access_token().unwrap().is_fresh());

        let quoted: TokenResponse =
            serde_json::from_value(json!({"access_token": "a", "expires_on": "1700000000"}))
                .unwrap();
        assert_eq!(quoted.into_access_token().unwrap().expires_on.timestamp(), 1_700_000_000);

        let missing: TokenResponse = serde_json::from_value(json!({"access_token": "a"})).unwrap();
        assert!(missing.into_access_token().is_err());
    }

    #[test]
    fn test_debug_output_redacts_token() {
        let token = AccessToken {
            token: "eyJ0eXAiOiJKV1QiLCJhbGciOiJSUzI1NiJ9.secret".to_string(),
            expires_on: Utc::now(),
        };
        let printed = format!("{:?}", token);
        assert!(!printed.contains("eyJ0eXAi"), "{}", printed);
        assert!(printed.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_chain_falls_through_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = DefaultCredential::with_sources(vec![
            Box::new(Failing),
            Box::new(Fixed { calls: calls.clone(), lifetime_secs: 3600 }),
        ]);

        let first = chain.get_token(&["https://vault.azure.net/.default"]).await.unwrap();
        let second = chain.get_token(&["https://vault.azure.net/.default"]).await.unwrap();
        assert_eq!(first.token, "token-0");
        assert_eq!(second.token, "token-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nearly_expired_token_is_replaced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = DefaultCredential::with_sources(vec![Box::new(Fixed {
            calls: calls.clone(),
            lifetime_secs: 60,
        })]);

        chain.get_token(&["scope"]).await.unwrap();
        let again = chain.get_token(&["scope"]).await.unwrap();
        assert_eq!(again.token, "token-1");
    }

    #[tokio::test]
    async fn test_chain_reports_every_failure() {
        let chain = DefaultCredential::with_sources(vec![Box::new(Failing), Box::new(Failing)]);
        let err = chain.get_token(&["scope"]).await.unwrap_err();
        assert_eq!(err.to_string().matches("not on Azure").count(), 2);
    }

    #[tokio::test]
    async fn test_managed_identity_requires_single_scope() {
        let credential = ManagedIdentityCredential::imds("http://127.0.0.1:9/token", None).unwrap();
        assert!(credential.get_token(&["a", "b"]).await.is_err());
    }
}
