use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub azure_ad: AzureAdConfig,
    pub key_vault_url: Option<String>,
    pub security: SecurityConfig,
    pub enable_openapi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Identity provider binding, equivalent to an `AzureAd` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureAdConfig {
    pub instance: String,
    pub tenant_id: String,
    pub client_id: String,
    /// Explicit audience; when unset both `client_id` and `api://{client_id}` are accepted
    pub audience: Option<String>,
    pub name_claim_type: String,
    pub clock_skew_secs: u64,
    pub metadata_refresh_secs: u64,
    pub metadata_min_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    /// HTTPS redirection is only active when a target port is known
    pub https_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        Self::defaults(environment).with_env_overrides()
    }

    /// Built-in settings for an environment, without reading the process environment.
    pub fn defaults(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
    }

    fn with_env_overrides(mut self) -> Self {
        // Server overrides
        if let Ok(v) = env::var("HOST") {
            self.server.host = v;
        }
        if let Ok(v) = env::var("PORT") {
            self.server.port = v.parse().unwrap_or(self.server.port);
        }

        // Identity provider overrides
        if let Ok(v) = env::var("AZURE_AD_INSTANCE") {
            self.azure_ad.instance = v;
        }
        if let Ok(v) = env::var("AZURE_AD_TENANT_ID") {
            self.azure_ad.tenant_id = v;
        }
        if let Ok(v) = env::var("AZURE_AD_CLIENT_ID") {
            self.azure_ad.client_id = v;
        }
        if let Ok(v) = env::var("AZURE_AD_AUDIENCE") {
            self.azure_ad.audience = Some(v).filter(|s| !s.is_empty());
        }
        if let Ok(v) = env::var("AZURE_AD_NAME_CLAIM_TYPE") {
            self.azure_ad.name_claim_type = v;
        }
        if let Ok(v) = env::var("AZURE_AD_CLOCK_SKEW_SECS") {
            self.azure_ad.clock_skew_secs = v.parse().unwrap_or(self.azure_ad.clock_skew_secs);
        }
        if let Ok(v) = env::var("AZURE_AD_METADATA_REFRESH_SECS") {
            self.azure_ad.metadata_refresh_secs =
                v.parse().unwrap_or(self.azure_ad.metadata_refresh_secs);
        }

        // Secret store
        if let Ok(v) = env::var("KEY_VAULT_URL") {
            self.key_vault_url = Some(v);
        }
        self.key_vault_url = self.key_vault_url.filter(|s| !s.trim().is_empty());

        // Security overrides
        if let Ok(v) = env::var("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = v.parse().unwrap_or(self.security.enable_cors);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("HTTPS_PORT") {
            self.security.https_port = v.parse().ok();
        }

        if let Ok(v) = env::var("ENABLE_OPENAPI") {
            self.enable_openapi = v.parse().unwrap_or(self.enable_openapi);
        }

        self
    }

    /// Reject configurations that cannot authenticate anyone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.azure_ad.tenant_id.trim().is_empty() {
            return Err(ConfigError::Missing("AZURE_AD_TENANT_ID"));
        }
        if self.azure_ad.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("AZURE_AD_CLIENT_ID"));
        }
        if let Err(e) = url::Url::parse(&self.azure_ad.instance) {
            return Err(ConfigError::Invalid { name: "AZURE_AD_INSTANCE", reason: e.to_string() });
        }
        if let Some(vault) = &self.key_vault_url {
            if let Err(e) = url::Url::parse(vault) {
                return Err(ConfigError::Invalid { name: "KEY_VAULT_URL", reason: e.to_string() });
            }
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            server: ServerConfig { host: "0.0.0.0".to_string(), port: 3000 },
            azure_ad: AzureAdConfig::default(),
            key_vault_url: None,
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ],
                https_port: None,
            },
            enable_openapi: true,
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            server: ServerConfig { host: "0.0.0.0".to_string(), port: 8080 },
            azure_ad: AzureAdConfig::default(),
            key_vault_url: None,
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://staging.example.com".to_string()],
                https_port: Some(443),
            },
            enable_openapi: false,
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            server: ServerConfig { host: "0.0.0.0".to_string(), port: 8080 },
            azure_ad: AzureAdConfig::default(),
            key_vault_url: None,
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://app.example.com".to_string()],
                https_port: Some(443),
            },
            enable_openapi: false,
        }
    }
}

impl Default for AzureAdConfig {
    fn default() -> Self {
        Self {
            instance: "https://login.microsoftonline.com/".to_string(),
            tenant_id: String::new(),
            client_id: String::new(),
            audience: None,
            name_claim_type: "name".to_string(),
            clock_skew_secs: 300,
            metadata_refresh_secs: 12 * 60 * 60,
            metadata_min_refresh_secs: 5 * 60,
        }
    }
}

impl AzureAdConfig {
    /// `{instance}{tenant}` with exactly one slash between the two.
    pub fn authority(&self) -> String {
        format!("{}/{}", self.instance.trim_end_matches('/'), self.tenant_id)
    }

    pub fn metadata_url(&self) -> String {
        format!("{}/v2.0/.well-known/openid-configuration", self.authority())
    }

    pub fn valid_audiences(&self) -> Vec<String> {
        match &self.audience {
            Some(aud) => vec![aud.clone()],
            None => vec![self.client_id.clone(), format!("api://{}", self.client_id)],
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> AppConfig {
        let mut config = AppConfig::development();
        config.azure_ad.tenant_id = "tenant".to_string();
        config.azure_ad.client_id = "client".to_string();
        config
    }

    #[test]
    fn test_default_development_config() {
        let config = AppConfig::development();
        assert!(config.enable_openapi);
        assert_eq!(config.security.https_port, None);
        assert_eq!(config.azure_ad.name_claim_type, "name");
    }

    #[test]
    fn test_default_production_config() {
        let config = AppConfig::production();
        assert!(!config.enable_openapi);
        assert_eq!(config.security.https_port, Some(443));
    }

    #[test]
    fn test_validate_requires_identity_settings() {
        assert!(matches!(
            AppConfig::development().validate(),
            Err(ConfigError::Missing("AZURE_AD_TENANT_ID"))
        ));
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_vault_url() {
        let mut config = configured();
        config.key_vault_url = Some("my-vault".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "KEY_VAULT_URL", .. })
        ));
    }

    #[test]
    fn test_authority_normalises_slashes() {
        let mut ad = configured().azure_ad;
        assert_eq!(ad.authority(), "https://login.microsoftonline.com/tenant");
        ad.instance = "https://login.microsoftonline.com".to_string();
        assert_eq!(
            ad.metadata_url(),
            "https://login.microsoftonline.com/tenant/v2.0/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_audiences_default_to_client_id_forms() {
        let mut ad = configured().azure_ad;
        assert_eq!(ad.valid_audiences(), vec!["client".to_string(), "api://client".to_string()]);
        ad.audience = Some("api://custom".to_string());
        assert_eq!(ad.valid_audiences(), vec!["api://custom".to_string()]);
    }
}
