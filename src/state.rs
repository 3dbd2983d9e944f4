//! Application service container shared by all handlers.

use std::sync::Arc;

use anyhow::Context;

use crate::auth::{JwksKeyStore, SigningKeys, TokenValidator};
use crate::config::AppConfig;
use crate::secrets::{DefaultCredential, SecretClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub validator: Arc<TokenValidator>,
    /// Present only when a vault URL is configured
    pub secrets: Option<Arc<SecretClient>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        validator: TokenValidator,
        secrets: Option<SecretClient>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            validator: Arc::new(validator),
            secrets: secrets.map(Arc::new),
        }
    }

    /// State with an explicit key source, no network discovery involved.
    pub fn with_keys(config: AppConfig, keys: Arc<dyn SigningKeys>) -> Self {
        let validator = TokenValidator::new(&config.azure_ad, keys);
        Self::new(config, validator, None)
    }

    /// Compose the production services: provider-backed token validation and,
    /// when `KEY_VAULT_URL` is set, a Key Vault client.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        let keys = JwksKeyStore::for_azure_ad(&config.azure_ad)
            .context("failed to create signing key store")?;
        tracing::info!(
            authority = %config.azure_ad.authority(),
            client_id = %config.azure_ad.client_id,
            "Bearer authentication bound to identity provider"
        );
        let validator = TokenValidator::new(&config.azure_ad, Arc::new(keys));

        let secrets = match &config.key_vault_url {
            Some(url) => {
                let credential =
                    DefaultCredential::from_env().context("failed to build Azure credential")?;
                let client = SecretClient::new(url, Arc::new(credential))
                    .with_context(|| format!("failed to create Key Vault client for {}", url))?;
                tracing::info!(vault = %client.vault_url(), "Key Vault client registered");
                Some(client)
            }
            None => {
                tracing::info!("KEY_VAULT_URL not set, secret store disabled");
                None
            }
        };

        Ok(Self::new(config.clone(), validator, secrets))
    }
}
