//! Signing key sources.
//!
//! [`JwksKeyStore`] follows the identity provider's OpenID Connect metadata
//! to its JSON Web Key Set and caches the RSA signing keys by `kid`. Keys are
//! fetched on first use, refreshed once the cache is older than the refresh
//! interval, and refreshed early when a token names an unknown key (rate
//! limited so that garbage `kid`s cannot hammer the provider). A refresh that
//! fails keeps the previous key set in service, and no new attempt is made
//! until the minimum refresh interval has passed. While one caller refreshes,
//! callers holding a stale key are served from the cache without waiting.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::AuthError;
use crate::config::AzureAdConfig;

/// Resolves the verification key for a token's `kid` header.
#[async_trait]
pub trait SigningKeys: Send + Sync {
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError>;

    /// Issuer published by the provider, when the source knows one. May hold
    /// a `{tenantid}` placeholder for multi-tenant authorities.
    async fn issuer(&self) -> Option<String> {
        None
    }
}

/// Fixed key set, for offline deployments and tests.
#[derive(Default)]
pub struct StaticKeys {
    keys: HashMap<String, DecodingKey>,
    issuer: Option<String>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, kid: impl Into<String>, key: DecodingKey) -> Self {
        self.keys.insert(kid.into(), key);
        self
    }

    /// Add an RSA public key in PEM form (PKCS#1 or SPKI).
    pub fn with_rsa_pem(self, kid: impl Into<String>, pem: &[u8]) -> Result<Self, AuthError> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| AuthError::Configuration(format!("invalid RSA public key: {}", e)))?;
        Ok(self.with_key(kid, key))
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }
}

#[async_trait]
impl SigningKeys for StaticKeys {
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        self.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownSigningKey(kid.to_string()))
    }

    async fn issuer(&self) -> Option<String> {
        self.issuer.clone()
    }
}

/// The subset of the OpenID Connect discovery document used here.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenIdMetadata {
    pub issuer: String,
    pub jwks_uri: String,
}

/// Where the key set is found.
#[derive(Debug, Clone)]
pub enum KeySetLocation {
    /// OpenID Connect discovery document, which names the `jwks_uri`
    Discovery(String),
    /// Key set URL used directly
    Jwks(String),
}

/// JWKS response format (RFC 7517).
#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Deserialize)]
struct JwkKey {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
    #[serde(rename = "use")]
    key_use: Option<String>,
    alg: Option<String>,
}

struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    issuer: Option<String>,
    fetched_at: Instant,
}

enum Lookup {
    Fresh(DecodingKey),
    Stale(DecodingKey),
    Missing,
    Unloaded,
}

pub struct JwksKeyStore {
    location: KeySetLocation,
    client: reqwest::Client,
    refresh_interval: Duration,
    min_refresh_interval: Duration,
    cache: RwLock<Option<KeyCache>>,
    /// When the last refresh attempt finished, successful or not. Held while refreshing.
    last_attempt: Mutex<Option<Instant>>,
}

impl JwksKeyStore {
    pub fn new(
        location: KeySetLocation,
        refresh_interval: Duration,
        min_refresh_interval: Duration,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            location,
            client,
            refresh_interval,
            min_refresh_interval,
            cache: RwLock::new(None),
            last_attempt: Mutex::new(None),
        })
    }

    /// Key store bound to the tenant's v2.0 discovery document.
    pub fn for_azure_ad(config: &AzureAdConfig) -> Result<Self, AuthError> {
        Self::new(
            KeySetLocation::Discovery(config.metadata_url()),
            Duration::from_secs(config.metadata_refresh_secs),
            Duration::from_secs(config.metadata_min_refresh_secs),
        )
    }

    async fn lookup(&self, kid: &str) -> Lookup {
        let cache = self.cache.read().await;
        let Some(entry) = cache.as_ref() else {
            return Lookup::Unloaded;
        };
        match entry.keys.get(kid) {
            Some(key) if entry.fetched_at.elapsed() < self.refresh_interval => {
                Lookup::Fresh(key.clone())
            }
            Some(key) => Lookup::Stale(key.clone()),
            None => Lookup::Missing,
        }
    }

    async fn fresh_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        match self.lookup(kid).await {
            Lookup::Fresh(key) => Ok(key),
            _ => Err(AuthError::UnknownSigningKey(kid.to_string())),
        }
    }

    /// Fetch the current key set and replace the cache.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let (jwks_uri, issuer) = match &self.location {
            KeySetLocation::Jwks(url) => (url.clone(), None),
            KeySetLocation::Discovery(url) => {
                let metadata = fetch_metadata(&self.client, url).await?;
                (metadata.jwks_uri, Some(metadata.issuer))
            }
        };

        debug!(url = %jwks_uri, "Fetching JWKS keys");
        let response = self
            .client
            .get(&jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::Metadata(format!("JWKS fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Metadata(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }

        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Metadata(format!("failed to parse JWKS response: {}", e)))?;

        let keys = load_rsa_keys(&jwks);
        if keys.is_empty() {
            warn!(url = %jwks_uri, "No usable RSA signing keys in JWKS response");
        } else {
            debug!(count = keys.len(), "JWKS keys refreshed");
        }

        *self.cache.write().await = Some(KeyCache {
            keys,
            issuer,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl SigningKeys for JwksKeyStore {
    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let stale = match self.lookup(kid).await {
            Lookup::Fresh(key) => return Ok(key),
            Lookup::Stale(key) => Some(key),
            Lookup::Missing | Lookup::Unloaded => None,
        };

        // Only one caller refreshes. Callers with a stale key don't wait for it
        let mut last_attempt = match self.last_attempt.try_lock() {
            Ok(guard) => guard,
            Err(_) => match stale {
                Some(key) => return Ok(key),
                None => self.last_attempt.lock().await,
            },
        };

        let lookup = self.lookup(kid).await;
        if let Lookup::Fresh(key) = lookup {
            return Ok(key);
        }

        let throttled = matches!(
            *last_attempt,
            Some(at) if at.elapsed() < self.min_refresh_interval
        );
        if throttled {
            return match lookup {
                Lookup::Stale(key) => Ok(key),
                Lookup::Unloaded => Err(AuthError::Metadata(
                    "signing keys unavailable, waiting before the next attempt".to_string(),
                )),
                _ => Err(AuthError::UnknownSigningKey(kid.to_string())),
            };
        }

        let refreshed = self.refresh().await;
        *last_attempt = Some(Instant::now());
        match (refreshed, lookup) {
            (Ok(()), _) => self.fresh_key(kid).await,
            (Err(e), Lookup::Stale(key)) => {
                warn!(error = %e, "JWKS refresh failed, serving cached keys");
                Ok(key)
            }
            (Err(e), _) => Err(e),
        }
    }

    async fn issuer(&self) -> Option<String> {
        self.cache.read().await.as_ref().and_then(|entry| entry.issuer.clone())
    }
}

pub async fn fetch_metadata(
    client: &reqwest::Client,
    url: &str,
) -> Result<OpenIdMetadata, AuthError> {
    debug!(url = %url, "Fetching OpenID Connect metadata");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AuthError::Metadata(format!("discovery fetch failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(AuthError::Metadata(format!(
            "discovery endpoint returned {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AuthError::Metadata(format!("failed to parse discovery document: {}", e)))
}

fn load_rsa_keys(jwks: &JwksResponse) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    for jwk in &jwks.keys {
        if jwk.kty != "RSA" {
            continue;
        }
        if matches!(&jwk.key_use, Some(u) if u != "sig") {
            continue;
        }
        if matches!(&jwk.alg, Some(alg) if alg != "RS256") {
            debug!(kid = ?jwk.kid, alg = ?jwk.alg, "Skipping JWKS key with unsupported algorithm");
            continue;
        }
        let (Some(kid), Some(n), Some(e)) = (&jwk.kid, &jwk.n, &jwk.e) else {
            continue;
        };
        match DecodingKey::from_rsa_components(n, e) {
            Ok(key) => {
                keys.insert(kid.clone(), key);
            }
            Err(err) => warn!(kid = %kid, error = %err, "Failed to parse JWKS key components"),
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULUS: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    fn parse(json: serde_json::Value) -> JwksResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_loads_rsa_signing_keys_only() {
        let jwks = parse(serde_json::json!({
            "keys": [
                {"kty": "RSA", "kid": "good", "use": "sig", "n": MODULUS, "e": "AQAB"},
                {"kty": "RSA", "kid": "no-use", "n": MODULUS, "e": "AQAB"},
                {"kty": "RSA", "kid": "enc", "use": "enc", "n": MODULUS, "e": "AQAB"},
                {"kty": "RSA", "kid": "ps", "alg": "PS256", "n": MODULUS, "e": "AQAB"},
                {"kty": "EC", "kid": "ec", "use": "sig"},
                {"kty": "RSA", "use": "sig", "n": MODULUS, "e": "AQAB"}
            ]
        }));
        let keys = load_rsa_keys(&jwks);
        let mut kids: Vec<&String> = keys.keys().collect();
        kids.sort();
        assert_eq!(kids, vec!["good", "no-use"]);
    }

    #[test]
    fn test_metadata_ignores_extra_fields() {
        let metadata: OpenIdMetadata = serde_json::from_value(serde_json::json!({
            "issuer": "https://login.microsoftonline.com/t/v2.0",
            "jwks_uri": "https://login.microsoftonline.com/t/discovery/v2.0/keys",
            "token_endpoint": "https://login.microsoftonline.com/t/oauth2/v2.0/token"
        }))
        .unwrap();
        assert!(metadata.jwks_uri.ends_with("/keys"));
    }

    #[tokio::test]
    async fn test_static_keys_reject_unknown_kid() {
        let keys = StaticKeys::new().with_key("known", DecodingKey::from_secret(b"unused"));
        assert!(keys.decoding_key("known").await.is_ok());
        assert!(matches!(
            keys.decoding_key("other").await,
            Err(AuthError::UnknownSigningKey(kid)) if kid == "other"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_metadata_error() {
        let store = JwksKeyStore::new(
            KeySetLocation::Jwks("http://127.0.0.1:9/keys".to_string()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(matches!(store.decoding_key("any").await, Err(AuthError::Metadata(_))));
    }
}
