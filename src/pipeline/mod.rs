//! Field pipeline: ordered getters/setters, computed fields and column planning.

pub mod columns;
pub mod order;
mod passes;

pub use columns::{plan_columns, ColumnPlan};
pub use order::{execution_order, Pass};
pub use passes::{read_pass, write_pass};
