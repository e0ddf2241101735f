//! Architect JSON:API: schema-driven JSON:API resource engine with pluggable storage.

pub mod config;
pub mod document;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod migration;
pub mod pipeline;
pub mod query;
pub mod resolver;
pub mod response;
pub mod routes;
pub mod schema;
pub mod service;
pub mod sql;
pub mod state;
pub mod store;
pub mod transform;
pub mod write;

pub use config::{load_from_dir, resolve, ApiSettings, ResourceConfig, TransformRegistry};
pub use document::{Document, DocumentAssembler, RelationshipDocument};
pub use error::{AppError, ConfigError};
pub use hooks::{from_fn, Denied, HookChain, Method, PermissionContext, PermissionHook};
pub use migration::apply_migrations;
pub use query::QueryParams;
pub use routes::{common_routes, common_routes_with_ready, resource_routes};
pub use schema::{ResourceSchema, SchemaRegistry};
pub use service::ResourceService;
pub use state::AppState;
pub use store::{MemoryStorage, PgStorage, Storage};
pub use transform::{ComputeFn, Transform, TransformError};
pub use write::UpdateMode;
