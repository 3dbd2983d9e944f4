//! OpenAPI document, served only when enabled (development by default).

use axum::Json;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::auth::Claim;
use crate::handlers;
use crate::handlers::health::HealthResponse;
use crate::handlers::user::UserResponse;

#[derive(Debug)]
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    paths(
        handlers::health::health,
        handlers::user::user_get,
    ),
    components(schemas(HealthResponse, UserResponse, Claim)),
    tags(
        (name = "health", description = "Liveness"),
        (name = "user", description = "Authenticated caller information"),
    ),
    info(
        title = "Entra API",
        description = "Health check and user-claims echo behind Microsoft Entra ID"
    )
)]
#[derive(Debug)]
pub struct ApiDoc;

/// GET /swagger/v1/swagger.json
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
