use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::auth::{AuthError, Principal};
use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller, inserted into request extensions by [`require_identity`]
#[derive(Clone, Debug)]
pub struct AuthenticatedUser(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))
    }
}

/// Bearer authentication middleware that validates tokens and attaches the caller
pub async fn require_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers()).map_err(|e| {
        tracing::debug!(
            error = %e,
            path = %request.uri().path(),
            "Rejecting unauthenticated request"
        );
        ApiError::from(e)
    })?;

    let principal = state.validator.validate(token).await.map_err(|e| {
        tracing::warn!(error = %e, path = %request.uri().path(), "Bearer token rejected");
        ApiError::from(e)
    })?;

    request.extensions_mut().insert(AuthenticatedUser(principal));

    Ok(next.run(request).await)
}

/// Extract the bearer token from the Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| AuthError::InvalidHeader("Invalid Authorization header format".to_string()))?;

    // The scheme name is case-insensitive
    let (scheme, token) = auth_str.split_once(' ').unwrap_or((auth_str, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidHeader(
            "Authorization header must use Bearer token format".to_string(),
        ));
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidHeader("Empty bearer token".to_string()));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_extracts_bearer_token() {
        assert_eq!(extract_bearer_token(&headers("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
        assert_eq!(extract_bearer_token(&headers("bearer  abc")).unwrap(), "abc");
    }

    #[test]
    fn test_rejects_missing_and_foreign_schemes() {
        assert!(matches!(extract_bearer_token(&HeaderMap::new()), Err(AuthError::MissingToken)));
        assert!(matches!(
            extract_bearer_token(&headers("Basic dXNlcjpwYXNz")),
            Err(AuthError::InvalidHeader(_))
        ));
        for value in ["Bearer ", "Bearer"] {
            assert!(matches!(
                extract_bearer_token(&headers(value)),
                Err(AuthError::InvalidHeader(_))
            ));
        }
    }
}
