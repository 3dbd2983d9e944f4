#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use entra_api::auth::StaticKeys;
use entra_api::config::{AppConfig, Environment};
use entra_api::AppState;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

pub const TENANT: &str = "7f3c1d2e-5a4b-4c3d-9e8f-0123456789ab";
pub const CLIENT_ID: &str = "0a1b2c3d-4e5f-4a6b-8c7d-9e8f7a6b5c4d";
pub const KID: &str = "test-signing-key";

pub const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/signing_key.pem");
pub const SIGNING_KEY_PUBLIC: &[u8] = include_bytes!("../fixtures/signing_key.pub.pem");
pub const UNTRUSTED_KEY: &[u8] = include_bytes!("../fixtures/untrusted_key.pem");
pub const JWKS: &str = include_str!("../fixtures/jwks.json");

pub struct TestServer {
    pub port: u16,
    pub base_url: String,
}

/// Development settings bound to the test tenant, independent of the process environment.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::defaults(Environment::Development);
    config.azure_ad.tenant_id = TENANT.to_string();
    config.azure_ad.client_id = CLIENT_ID.to_string();
    config
}

pub fn test_state(config: AppConfig) -> AppState {
    let keys = StaticKeys::new()
        .with_rsa_pem(KID, SIGNING_KEY_PUBLIC)
        .expect("test public key");
    AppState::with_keys(config, Arc::new(keys))
}

/// Serve a router on a free local port for the lifetime of the test runtime.
pub async fn serve(router: Router) -> Result<TestServer> {
    let port = portpicker::pick_unused_port().context("failed to pick free port")?;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .context("failed to bind test listener")?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(TestServer {
        port,
        base_url: format!("http://127.0.0.1:{}", port),
    })
}

pub async fn spawn_app(config: AppConfig) -> Result<TestServer> {
    serve(entra_api::app(test_state(config))).await
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Claims shaped like a v2.0 access token issued to this API.
pub fn access_token_claims() -> Value {
    json!({
        "aud": CLIENT_ID,
        "iss": format!("https://login.microsoftonline.com/{}/v2.0", TENANT),
        "iat": now(),
        "nbf": now(),
        "exp": now() + 3600,
        "name": "Ada Lovelace",
        "oid": "00000000-0000-0000-0000-00000000a1a1",
        "preferred_username": "ada@contoso.com",
        "roles": ["Reader", "Writer"],
        "scp": "access_as_user",
        "sub": "b5f1c2d3",
        "tid": TENANT,
        "ver": "2.0"
    })
}

pub fn sign_with(claims: &Value, kid: &str, private_pem: &[u8]) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(private_pem).expect("test private key");
    encode(&header, claims, &key).expect("sign test token")
}

pub fn sign(claims: &Value) -> String {
    sign_with(claims, KID, SIGNING_KEY)
}
