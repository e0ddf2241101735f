//! ResourceService: every JSON:API operation over a finalized registry and a storage driver.

mod resource;
mod validation;
pub use resource::ResourceService;
pub use validation::RequestValidator;
