//! PostgreSQL storage driver on a sqlx pool.

use super::{Delete, Insert, Row, Select, Storage, StorageError, StorageTx, TableRef, Update};
use crate::schema::SemanticType;
use crate::sql::{self, PgBindValue, QueryBuf};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Postgres, Transaction};

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        PgStorage { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bound(q: &QueryBuf) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(PgBindValue::from_json(p));
    }
    query
}

async fn fetch_rows(conn: &mut PgConnection, q: &QueryBuf, table: &TableRef) -> Result<Vec<Row>, StorageError> {
    let rows = bound(q).fetch_all(conn).await?;
    Ok(rows.iter().map(|r| row_to_json(r, table)).collect())
}

#[async_trait]
impl Storage for PgStorage {
    async fn select(&self, query: &Select) -> Result<Vec<Row>, StorageError> {
        let q = sql::select(query);
        let rows = bound(&q).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| row_to_json(r, &query.table)).collect())
    }

    async fn count(&self, query: &Select) -> Result<u64, StorageError> {
        use sqlx::Row as _;
        let q = sql::count(query);
        let row = bound(&q).fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("count")?;
        Ok(n.max(0) as u64)
    }

    async fn begin(&self) -> Result<Box<dyn StorageTx>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PgTx {
    async fn select(&mut self, query: &Select) -> Result<Vec<Row>, StorageError> {
        let q = sql::select(query);
        fetch_rows(&mut self.tx, &q, &query.table).await
    }

    async fn insert(&mut self, op: &Insert) -> Result<Row, StorageError> {
        let q = sql::insert(op);
        let mut rows = fetch_rows(&mut self.tx, &q, &op.table).await?;
        rows.pop()
            .ok_or_else(|| StorageError::Backend(format!("insert into {} returned no row", op.table.name)))
    }

    async fn update(&mut self, op: &Update) -> Result<u64, StorageError> {
        if op.set.is_empty() {
            return Ok(0);
        }
        let q = sql::update(op);
        let done = bound(&q).execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn delete(&mut self, op: &Delete) -> Result<u64, StorageError> {
        let q = sql::delete(op);
        let done = bound(&q).execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Decodes a row; numeric columns were selected as text and are parsed back here.
fn row_to_json(row: &PgRow, table: &TableRef) -> Row {
    use sqlx::Column;
    use sqlx::Row as _;
    let mut map = Row::new();
    for col in row.columns() {
        let name = col.name();
        let mut v = cell_to_value(row, name);
        if table.column_type(name) == Some(SemanticType::Number) {
            v = parse_number(v);
        }
        map.insert(name.to_string(), v);
    }
    map
}

fn parse_number(v: Value) -> Value {
    let parsed = match &v {
        Value::String(s) => s.parse::<i64>().ok().map(Value::from).or_else(|| {
            s.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }),
        _ => None,
    };
    parsed.unwrap_or(v)
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row as _;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::from(n);
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::from(n);
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::from(n);
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
