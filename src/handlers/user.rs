// GET /api/user - echo the authenticated caller's claims

use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::Claim;
use crate::middleware::AuthenticatedUser;

#[derive(Debug, Serialize, ToSchema)]
pub struct UserResponse {
    pub authenticated: bool,
    /// Value of the configured name claim, if the token carries one
    pub name: Option<String>,
    pub claims: Vec<Claim>,
    pub timestamp: DateTime<Utc>,
}

/// The principal was already validated by `require_identity`; this only
/// reshapes it for the response.
#[utoipa::path(
    get,
    path = "/api/user",
    responses(
        (status = 200, description = "Claims of the authenticated caller", body = UserResponse),
        (status = 401, description = "Missing or invalid bearer token")
    ),
    security(("bearer_auth" = [])),
    tag = "user"
)]
pub async fn user_get(AuthenticatedUser(principal): AuthenticatedUser) -> Json<UserResponse> {
    Json(UserResponse {
        authenticated: true,
        name: principal.name().map(str::to_string),
        claims: principal.claims().to_vec(),
        timestamp: Utc::now(),
    })
}
