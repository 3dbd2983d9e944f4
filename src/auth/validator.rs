use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, Validation};
use serde_json::{Map, Value};

use super::{AuthError, Principal, SigningKeys};
use crate::config::AzureAdConfig;

const TENANT_PLACEHOLDER: &str = "{tenantid}";
const MULTI_TENANT_ALIASES: &[&str] = &["common", "organizations", "consumers"];

/// Accepted issuers, either fixed or derived from the token's `tid`.
#[derive(Debug, Clone)]
enum IssuerPolicy {
    Exact(Vec<String>),
    TenantTemplate(Vec<String>),
}

/// Validates bearer tokens issued by the configured tenant for this API.
///
/// Issuers are derived from the configured tenant and, once the key source
/// has read it, from the issuer the provider publishes. The latter covers
/// tenants configured by domain name, whose tokens carry the tenant id.
pub struct TokenValidator {
    keys: Arc<dyn SigningKeys>,
    audiences: Vec<String>,
    templates: Vec<String>,
    issuers: IssuerPolicy,
    leeway: u64,
    name_claim_type: String,
}

impl TokenValidator {
    pub fn new(config: &AzureAdConfig, keys: Arc<dyn SigningKeys>) -> Self {
        let templates = vec![
            format!("{}/{}/v2.0", config.instance.trim_end_matches('/'), TENANT_PLACEHOLDER),
            format!("https://sts.windows.net/{}/", TENANT_PLACEHOLDER),
        ];

        let tenant = config.tenant_id.to_ascii_lowercase();
        let issuers = if MULTI_TENANT_ALIASES.contains(&tenant.as_str()) {
            IssuerPolicy::TenantTemplate(templates.clone())
        } else {
            IssuerPolicy::Exact(for_tenant(&templates, &config.tenant_id))
        };

        Self {
            keys,
            audiences: config.valid_audiences(),
            templates,
            issuers,
            leeway: config.clock_skew_secs,
            name_claim_type: config.name_claim_type.clone(),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed token: {}", e)))?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken(format!(
                "unsupported signing algorithm {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("token header has no 'kid'".to_string()))?;
        let key = self.keys.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.set_audience(self.audiences.as_slice());
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        let data = decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(describe(e.kind())))?;

        let discovered = self.keys.issuer().await;
        self.check_issuer(&data.claims, discovered.as_deref())?;

        let principal = Principal::from_payload(&data.claims, self.name_claim_type.clone());
        tracing::debug!(subject = ?principal.subject(), "Bearer token validated");
        Ok(principal)
    }

    fn check_issuer(
        &self,
        claims: &Map<String, Value>,
        discovered: Option<&str>,
    ) -> Result<(), AuthError> {
        let issuer = claims
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::InvalidToken("missing issuer".to_string()))?;
        let tid = claims.get("tid").and_then(Value::as_str).filter(|t| !t.is_empty());

        let configured = match &self.issuers {
            IssuerPolicy::Exact(issuers) => issuers.iter().any(|i| i == issuer),
            IssuerPolicy::TenantTemplate(templates) => {
                tid.is_some_and(|tid| for_tenant(templates, tid).iter().any(|i| i == issuer))
            }
        };
        let accepted = configured
            || discovered.is_some_and(|d| self.discovered_accepts(d, issuer, tid));

        if accepted {
            Ok(())
        } else {
            Err(AuthError::InvalidToken(format!("issuer '{}' is not trusted", issuer)))
        }
    }

    /// The published issuer, or the v1 issuer of the same tenant.
    fn discovered_accepts(&self, discovered: &str, issuer: &str, tid: Option<&str>) -> bool {
        if discovered.contains(TENANT_PLACEHOLDER) {
            return tid.is_some_and(|tid| discovered.replace(TENANT_PLACEHOLDER, tid) == issuer);
        }
        if discovered == issuer {
            return true;
        }
        match issuer_tenant(discovered) {
            Some(tenant) => for_tenant(&self.templates, &tenant).iter().any(|i| i == issuer),
            None => false,
        }
    }
}

fn for_tenant(templates: &[String], tenant: &str) -> Vec<String> {
    templates
        .iter()
        .map(|t| t.replace(TENANT_PLACEHOLDER, tenant))
        .collect()
}

/// First path segment of an issuer URL, e.g. the tenant id in `{instance}/{tenant}/v2.0`.
fn issuer_tenant(issuer: &str) -> Option<String> {
    let url = url::Url::parse(issuer).ok()?;
    let tenant = url.path_segments()?.next()?;
    (!tenant.is_empty()).then(|| tenant.to_string())
}

fn describe(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::ExpiredSignature => "token expired".to_string(),
        ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
        ErrorKind::InvalidAudience => "invalid audience".to_string(),
        ErrorKind::InvalidSignature => "signature verification failed".to_string(),
        ErrorKind::InvalidAlgorithm => "unsupported signing algorithm".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing required claim '{}'", claim),
        other => format!("{:?}", other),
    }
}
