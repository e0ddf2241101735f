//! HTTP handlers for the JSON:API endpoints.

pub mod resource;
pub use resource::*;
