//! Storage drivers: the transaction-capable interface the engine runs on, plus a
//! PostgreSQL driver and an in-memory driver with the same semantics.

pub mod memory;
pub mod postgres;
pub mod query;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;
pub use query::*;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("duplicate value for {table}.{column}")]
    UniqueViolation { table: String, column: String },
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    /// True when the failure is a uniqueness conflict rather than a broken store.
    pub fn is_conflict(&self) -> bool {
        match self {
            StorageError::UniqueViolation { .. } => true,
            StorageError::Db(e) => e
                .as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Read access plus transactions.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn select(&self, query: &Select) -> Result<Vec<Row>, StorageError>;

    /// Number of rows `query` matches, ignoring its order and window.
    async fn count(&self, query: &Select) -> Result<u64, StorageError>;

    async fn begin(&self) -> Result<Box<dyn StorageTx>, StorageError>;
}

/// An open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StorageTx: Send {
    async fn select(&mut self, query: &Select) -> Result<Vec<Row>, StorageError>;

    /// Inserts and returns the stored row, generated identity included.
    async fn insert(&mut self, op: &Insert) -> Result<Row, StorageError>;

    /// Returns the number of rows changed.
    async fn update(&mut self, op: &Update) -> Result<u64, StorageError>;

    /// Returns the number of rows removed.
    async fn delete(&mut self, op: &Delete) -> Result<u64, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Grouping key for identities and foreign keys: `5`, `5.0` and `"5"` collapse to one key.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}
