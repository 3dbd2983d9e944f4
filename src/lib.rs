pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod secrets;
pub mod state;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::AppConfig;
use crate::middleware::{https_redirect, require_identity, MakeRequestUuid};
pub use crate::state::AppState;

/// Assemble the application router around the given service container.
pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        // Public
        .route("/health", get(handlers::health))
        // Protected
        .merge(protected_routes(state.clone()));

    if state.config.enable_openapi {
        router = router.route("/swagger/v1/swagger.json", get(api::openapi_json));
    }

    router
        .fallback(handlers::not_found)
        // Global middleware, outermost last
        .layer(from_fn_with_state(state.clone(), https_redirect))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/user", get(handlers::user_get))
        .route_layer(from_fn_with_state(state, require_identity))
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    if !config.security.enable_cors {
        return CorsLayer::new();
    }
    if config.is_development() {
        return CorsLayer::permissive();
    }

    let origins = &config.security.cors_origins;
    let allow_origin = if origins.iter().any(|origin| origin.trim() == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
