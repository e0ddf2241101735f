//! Schema registry: resource types, their fields and relationships.

mod builder;
pub mod registry;
pub mod types;

pub use builder::ResourceSchemaBuilder;
pub use registry::SchemaRegistry;
pub use types::*;
