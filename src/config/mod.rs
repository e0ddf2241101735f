//! Engine settings and declarative resource configuration.

pub mod loader;
pub mod settings;
pub mod types;
pub mod validator;

pub use loader::{build_schema, load_from_dir, load_from_pool, resolve, TransformRegistry};
pub use settings::ApiSettings;
pub use types::*;
pub use validator::validate;
