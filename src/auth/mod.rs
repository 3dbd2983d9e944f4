//! Bearer token authentication against an OpenID Connect identity provider.
//!
//! Signature keys come from the provider's published key set ([`jwks`]),
//! tokens are checked by [`validator::TokenValidator`], and the result is a
//! [`Principal`] holding the token's claims in their original order.

pub mod jwks;
pub mod validator;

use serde::Serialize;
use serde_json::{Map, Value};

pub use jwks::{JwksKeyStore, SigningKeys, StaticKeys};
pub use validator::TokenValidator;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("{0}")]
    InvalidHeader(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("signing key '{0}' not found")]
    UnknownSigningKey(String),
    #[error("identity provider metadata: {0}")]
    Metadata(String),
    #[error("authentication configuration: {0}")]
    Configuration(String),
}

/// A single `type`/`value` assertion about the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct Claim {
    #[serde(rename = "type")]
    pub claim_type: String,
    pub value: String,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
        }
    }
}

/// Identity established from a validated token.
#[derive(Debug, Clone)]
pub struct Principal {
    claims: Vec<Claim>,
    name_claim_type: String,
}

impl Principal {
    pub fn new(claims: Vec<Claim>, name_claim_type: impl Into<String>) -> Self {
        Self {
            claims,
            name_claim_type: name_claim_type.into(),
        }
    }

    /// Build a principal from a decoded JWT payload.
    pub fn from_payload(payload: &Map<String, Value>, name_claim_type: impl Into<String>) -> Self {
        Self::new(flatten_claims(payload), name_claim_type)
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn find_first(&self, claim_type: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.claim_type == claim_type)
            .map(|c| c.value.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.find_first(&self.name_claim_type)
    }

    pub fn subject(&self) -> Option<&str> {
        self.find_first("sub")
    }
}

/// Turn a JWT payload into a flat claim list, preserving token order.
///
/// Arrays yield one claim per element; objects and nested arrays are kept
/// as compact JSON text; nulls are dropped.
pub fn flatten_claims(payload: &Map<String, Value>) -> Vec<Claim> {
    let mut claims = Vec::with_capacity(payload.len());
    for (claim_type, value) in payload {
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(v) = claim_value(item) {
                        claims.push(Claim::new(claim_type.clone(), v));
                    }
                }
            }
            other => {
                if let Some(v) = claim_value(other) {
                    claims.push(Claim::new(claim_type.clone(), v));
                }
            }
        }
    }
    claims
}

fn claim_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_flatten_keeps_token_order() {
        let claims = flatten_claims(&payload(json!({
            "aud": "api://client",
            "iss": "https://login.microsoftonline.com/t/v2.0",
            "exp": 1700000000,
            "name": "Ada Lovelace"
        })));
        let types: Vec<&str> = claims.iter().map(|c| c.claim_type.as_str()).collect();
        assert_eq!(types, vec!["aud", "iss", "exp", "name"]);
        assert_eq!(claims[2].value, "1700000000");
    }

    #[test]
    fn test_flatten_expands_arrays_and_stringifies_objects() {
        let claims = flatten_claims(&payload(json!({
            "roles": ["Reader", "Writer"],
            "ver": true,
            "ctx": {"a": 1},
            "missing": null,
            "nested": [["x"], 2]
        })));
        assert_eq!(
            claims,
            vec![
                Claim::new("roles", "Reader"),
                Claim::new("roles", "Writer"),
                Claim::new("ver", "true"),
                Claim::new("ctx", r#"{"a":1}"#),
                Claim::new("nested", r#"["x"]"#),
                Claim::new("nested", "2"),
            ]
        );
    }

    #[test]
    fn test_name_uses_configured_claim_type() {
        let principal = Principal::new(
            vec![
                Claim::new("preferred_username", "ada@contoso.com"),
                Claim::new("name", "Ada"),
            ],
            "preferred_username",
        );
        assert_eq!(principal.name(), Some("ada@contoso.com"));

        let unnamed = Principal::new(vec![Claim::new("sub", "abc")], "name");
        assert_eq!(unnamed.name(), None);
        assert_eq!(unnamed.subject(), Some("abc"));
    }
}
