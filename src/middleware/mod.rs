pub mod auth;
pub mod https;
pub mod request_id;

pub use auth::{require_identity, AuthenticatedUser};
pub use https::https_redirect;
pub use request_id::MakeRequestUuid;
