// Route handlers, grouped by access tier:
// public (no identity) and protected (valid bearer token required).
pub mod health;
pub mod user;

pub use health::health;
pub use user::user_get;

use axum::http::Uri;

use crate::error::ApiError;

/// Fallback for unmatched routes.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("No route for {}", uri.path()))
}
