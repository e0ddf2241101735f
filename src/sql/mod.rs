//! PostgreSQL statement builder: identifiers from schemas only, values as parameters.

mod builder;
pub mod params;
pub use builder::*;
pub use params::*;
pub(crate) use builder::{qualified_table, quoted};
