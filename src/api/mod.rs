pub mod openapi;

pub use openapi::{openapi_json, ApiDoc};
