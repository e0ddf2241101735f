//! Query compilation and execution for collection and single-record reads.

pub mod compiler;
mod execute;
pub mod filter;
pub mod params;

pub use compiler::{CompiledQuery, IncludeNode, QueryCompiler, SortKey, Window};
pub use execute::{LoadedRelations, QueryResult};
pub use params::{FilterOp, FilterParam, PageParams, QueryParams, SortParam};
