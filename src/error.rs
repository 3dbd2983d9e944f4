// HTTP API Error Types
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::auth::AuthError;
use crate::secrets::SecretError;

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug)]
pub enum ApiError {
    // 401 Unauthorized, `challenge` becomes the WWW-Authenticate header
    Unauthorized { message: String, challenge: String },

    // 404 Not Found
    NotFound(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 502 Bad Gateway (identity provider or vault misbehaving)
    BadGateway(String),

    // 503 Service Unavailable
    ServiceUnavailable(String),
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::Unauthorized { message, .. } => message,
            ApiError::NotFound(msg) => msg,
            ApiError::InternalServerError(msg) => msg,
            ApiError::BadGateway(msg) => msg,
            ApiError::ServiceUnavailable(msg) => msg,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized { .. } => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::BadGateway(_) => "BAD_GATEWAY",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        json!({
            "error": true,
            "message": self.message(),
            "code": self.error_code()
        })
    }
}

impl ApiError {
    /// 401 for a request that carried no credentials at all.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized {
            message: message.into(),
            challenge: "Bearer".to_string(),
        }
    }

    /// 401 for a request whose bearer token was rejected.
    pub fn invalid_token(description: impl Into<String>) -> Self {
        let description = description.into();
        let challenge = format!(
            "Bearer error=\"invalid_token\", error_description=\"{}\"",
            description.replace('"', "'")
        );
        ApiError::Unauthorized {
            message: description,
            challenge,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        ApiError::BadGateway(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable(message.into())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => ApiError::unauthorized("Missing Authorization header"),
            AuthError::InvalidHeader(msg) => ApiError::unauthorized(msg),
            AuthError::InvalidToken(msg) => ApiError::invalid_token(msg),
            AuthError::UnknownSigningKey(kid) => {
                ApiError::invalid_token(format!("Signing key '{}' is not trusted", kid))
            }
            AuthError::Metadata(msg) => {
                // Don't expose identity provider internals to clients
                tracing::error!(error = %msg, "Identity provider metadata unavailable");
                ApiError::service_unavailable("Identity provider temporarily unavailable")
            }
            AuthError::Configuration(msg) => {
                tracing::error!(error = %msg, "Authentication misconfigured");
                ApiError::internal_server_error("Authentication is not configured")
            }
        }
    }
}

impl From<SecretError> for ApiError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::NotFound(name) => {
                ApiError::not_found(format!("Secret '{}' not found", name))
            }
            SecretError::Service { status, code, message } => {
                tracing::error!(%status, %code, %message, "Key Vault request failed");
                ApiError::bad_gateway("Secret store request failed")
            }
            other => {
                tracing::error!(error = %other, "Secret store unavailable");
                ApiError::service_unavailable("Secret store temporarily unavailable")
            }
        }
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut response = (self.status_code(), Json(self.to_json())).into_response();
        if let ApiError::Unauthorized { challenge, .. } = &self {
            if let Ok(value) = HeaderValue::from_str(challenge) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_token_challenge_has_no_error_code() {
        let response = ApiError::from(AuthError::MissingToken).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn test_invalid_token_challenge_carries_description() {
        let response = ApiError::invalid_token("token \"expired\"").into_response();
        let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.starts_with("Bearer error=\"invalid_token\""));
        assert!(challenge.contains("token 'expired'"));
    }

    #[test]
    fn test_metadata_failure_hides_details() {
        let err = ApiError::from(AuthError::Metadata("connect refused 10.0.0.1".to_string()));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.message().contains("10.0.0.1"));
        assert_eq!(err.to_json()["code"], "SERVICE_UNAVAILABLE");
    }

    #[test]
    fn test_secret_not_found_maps_to_404() {
        let err = ApiError::from(SecretError::NotFound("db-password".to_string()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
