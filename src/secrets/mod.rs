//! Azure Key Vault secret client.
//!
//! Registered as a singleton only when a vault URL is configured. Speaks the
//! Key Vault REST API directly and authenticates through a [`TokenCredential`].

pub mod credential;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

pub use credential::{
    AccessToken, CredentialError, DefaultCredential, EnvironmentCredential,
    ManagedIdentityCredential, TokenCredential,
};

pub const API_VERSION: &str = "7.4";
pub const VAULT_SCOPE: &str = "https://vault.azure.net/.default";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("invalid secret name '{0}'")]
    InvalidName(String),
    #[error("invalid vault URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vault returned {status} {code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretAttributes {
    pub enabled: Option<bool>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, rename = "exp", with = "chrono::serde::ts_seconds_option")]
    pub expires_on: Option<DateTime<Utc>>,
    #[serde(default, rename = "nbf", with = "chrono::serde::ts_seconds_option")]
    pub not_before: Option<DateTime<Utc>>,
    pub recovery_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVaultSecret {
    pub value: String,
    pub id: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub attributes: SecretAttributes,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl KeyVaultSecret {
    pub fn name(&self) -> Option<String> {
        id_segment(&self.id, 1)
    }

    pub fn version(&self) -> Option<String> {
        id_segment(&self.id, 2)
    }
}

/// Secret metadata as returned by the list operation (no value).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretProperties {
    pub id: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub attributes: SecretAttributes,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl SecretProperties {
    pub fn name(&self) -> Option<String> {
        id_segment(&self.id, 1)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretListPage {
    #[serde(default)]
    value: Vec<SecretProperties>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    error: ServiceErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorDetail {
    code: String,
    message: String,
}

// Ids look like {vault}/secrets/{name}/{version}
fn id_segment(id: &str, index: usize) -> Option<String> {
    let url = Url::parse(id).ok()?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.first() {
        Some(&"secrets") => segments.get(index).map(|s| s.to_string()),
        _ => None,
    }
}

fn validate_name(name: &str) -> Result<(), SecretError> {
    let valid = !name.is_empty()
        && name.len() <= 127
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SecretError::InvalidName(name.to_string()))
    }
}

pub struct SecretClient {
    vault_url: Url,
    credential: Arc<dyn TokenCredential>,
    scope: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for SecretClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretClient")
            .field("vault_url", &self.vault_url.as_str())
            .finish_non_exhaustive()
    }
}

impl SecretClient {
    pub fn new(vault_url: &str, credential: Arc<dyn TokenCredential>) -> Result<Self, SecretError> {
        let vault_url = Url::parse(vault_url).map_err(|e| SecretError::InvalidUrl(e.to_string()))?;
        if vault_url.cannot_be_a_base() {
            return Err(SecretError::InvalidUrl(format!("{} is not a base URL", vault_url)));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            vault_url,
            credential,
            scope: VAULT_SCOPE.to_string(),
            http,
        })
    }

    /// Override the token scope (sovereign clouds use a different audience).
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn vault_url(&self) -> &Url {
        &self.vault_url
    }

    /// Latest version of a secret.
    pub async fn get_secret(&self, name: &str) -> Result<KeyVaultSecret, SecretError> {
        self.get_secret_version(name, "").await
    }

    /// A specific version of a secret; an empty version means the latest.
    pub async fn get_secret_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<KeyVaultSecret, SecretError> {
        validate_name(name)?;
        if !version.is_empty() && !version.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SecretError::InvalidName(format!("{}/{}", name, version)));
        }

        let mut url = self.endpoint(&["secrets", name, version])?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);

        tracing::debug!(secret = %name, version = %version, "Fetching secret");
        let response = self.authorized_get(url).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(name.to_string()));
        }
        Ok(Self::read_json(response).await?)
    }

    /// Metadata of every secret in the vault, following `nextLink` pages.
    pub async fn list_secret_properties(&self) -> Result<Vec<SecretProperties>, SecretError> {
        let mut url = self.endpoint(&["secrets"])?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);

        let mut secrets = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let page: SecretListPage = Self::read_json(self.authorized_get(url).await?).await?;
            secrets.extend(page.value);
            next = match page.next_link.filter(|l| !l.is_empty()) {
                Some(link) => {
                    Some(Url::parse(&link).map_err(|e| SecretError::InvalidUrl(e.to_string()))?)
                }
                None => None,
            };
        }
        Ok(secrets)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SecretError> {
        let mut url = self.vault_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SecretError::InvalidUrl(self.vault_url.to_string()))?;
            path.pop_if_empty();
            path.extend(segments.iter().filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    async fn authorized_get(&self, url: Url) -> Result<reqwest::Response, SecretError> {
        let token = self.credential.get_token(&[self.scope.as_str()]).await?;
        Ok(self.http.get(url).bearer_auth(&token.token).send().await?)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SecretError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let (code, message) = match response.json::<ServiceErrorBody>().await {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (status.to_string(), String::new()),
        };
        Err(SecretError::Service {
            status: status.as_u16(),
            code,
            message,
        })
    }
}
