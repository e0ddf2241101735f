//! In-memory storage driver. Transactions work on a snapshot of all tables and are
//! serialized by a writer lock; commit swaps the snapshot in.

use super::{value_key, ColumnRef, CompareOp, Condition, Delete, Insert, JoinCondition, Row, Select, Storage, StorageError, StorageTx, Update};
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

static NULL: Value = Value::Null;

#[derive(Clone, Debug, Default)]
struct Table {
    last_identity: i64,
    rows: Vec<Row>,
}

type Tables = HashMap<String, Table>;

struct Inner {
    tables: Mutex<Tables>,
    writer: Arc<AsyncMutex<()>>,
}

#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage {
            inner: Arc::new(Inner {
                tables: Mutex::new(HashMap::new()),
                writer: Arc::new(AsyncMutex::new(())),
            }),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Storage with one empty table per registered schema.
    pub fn for_registry(registry: &SchemaRegistry) -> Result<Self, StorageError> {
        let storage = MemoryStorage::new();
        for schema in registry.schemas() {
            storage.create_table(&schema.table)?;
        }
        Ok(storage)
    }

    pub fn create_table(&self, name: &str) -> Result<(), StorageError> {
        self.lock()?.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Committed rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        let tables = self.lock()?;
        let t = tables.get(table).ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        Ok(t.rows.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.inner
            .tables
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn select(&self, query: &Select) -> Result<Vec<Row>, StorageError> {
        let tables = self.lock()?;
        run_select(&tables, query)
    }

    async fn count(&self, query: &Select) -> Result<u64, StorageError> {
        let tables = self.lock()?;
        Ok(matching(&tables, query)?.len() as u64)
    }

    async fn begin(&self) -> Result<Box<dyn StorageTx>, StorageError> {
        let writer = self.inner.writer.clone().lock_owned().await;
        let snapshot = self.lock()?.clone();
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            tables: snapshot,
            _writer: writer,
        }))
    }
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    tables: Tables,
    _writer: OwnedMutexGuard<()>,
}

impl MemoryTx {
    fn table_mut(&mut self, name: &str) -> Result<&mut Table, StorageError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn select(&mut self, query: &Select) -> Result<Vec<Row>, StorageError> {
        run_select(&self.tables, query)
    }

    async fn insert(&mut self, op: &Insert) -> Result<Row, StorageError> {
        let table = self.table_mut(&op.table.name)?;
        let mut row = Row::new();
        for column in &op.table.columns {
            row.insert(column.clone(), op.values.get(column).cloned().unwrap_or(Value::Null));
        }
        if op.table.columns.is_empty() {
            row = op.values.clone();
        }

        match op.values.get(&op.identity_column).filter(|v| !v.is_null()) {
            Some(identity) => {
                let taken = table
                    .rows
                    .iter()
                    .any(|r| r.get(&op.identity_column).map(|v| same(v, identity)).unwrap_or(false));
                if taken {
                    return Err(StorageError::UniqueViolation {
                        table: op.table.name.clone(),
                        column: op.identity_column.clone(),
                    });
                }
                if let Ok(n) = value_key(identity).parse::<i64>() {
                    table.last_identity = table.last_identity.max(n);
                }
            }
            None => {
                table.last_identity += 1;
                row.insert(op.identity_column.clone(), Value::from(table.last_identity));
            }
        }
        table.rows.push(row.clone());
        Ok(row)
    }

    async fn update(&mut self, op: &Update) -> Result<u64, StorageError> {
        let table = self.table_mut(&op.table.name)?;
        let mut changed = 0;
        for row in table.rows.iter_mut() {
            if !matches(&op.filter, &Scope::base(row)) {
                continue;
            }
            for (column, value) in &op.set {
                row.insert(column.clone(), value.clone());
            }
            changed += 1;
        }
        Ok(changed)
    }

    async fn delete(&mut self, op: &Delete) -> Result<u64, StorageError> {
        let table = self.table_mut(&op.table.name)?;
        let before = table.rows.len();
        table.rows.retain(|row| !matches(&op.filter, &Scope::base(row)));
        Ok((before - table.rows.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTx { inner, tables, _writer } = *self;
        let mut committed = inner
            .tables
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".into()))?;
        *committed = tables;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A base row plus the row each join alias matched, if any.
struct Scope<'a> {
    base: &'a Row,
    joined: HashMap<&'a str, Option<&'a Row>>,
}

impl<'a> Scope<'a> {
    fn base(row: &'a Row) -> Self {
        Scope {
            base: row,
            joined: HashMap::new(),
        }
    }

    fn lookup(&self, column: &ColumnRef) -> &'a Value {
        let row = match &column.source {
            None => Some(self.base),
            Some(alias) => self.joined.get(alias.as_str()).copied().flatten(),
        };
        row.and_then(|r| r.get(&column.column)).unwrap_or(&NULL)
    }
}

fn matching<'a>(tables: &'a Tables, query: &'a Select) -> Result<Vec<Scope<'a>>, StorageError> {
    let base = tables
        .get(&query.table.name)
        .ok_or_else(|| StorageError::UnknownTable(query.table.name.clone()))?;
    let mut joined_tables = Vec::with_capacity(query.joins.len());
    for join in &query.joins {
        let t = tables
            .get(&join.table.name)
            .ok_or_else(|| StorageError::UnknownTable(join.table.name.clone()))?;
        joined_tables.push((join, t));
    }

    let mut out = Vec::new();
    for row in &base.rows {
        let mut scope = Scope::base(row);
        for &(join, table) in &joined_tables {
            let hit = table.rows.iter().find(|candidate| {
                join.on.iter().all(|cond| join_matches(cond, &join.alias, candidate, &scope))
            });
            scope.joined.insert(join.alias.as_str(), hit);
        }
        let keep = query.filter.as_ref().map(|f| matches(f, &scope)).unwrap_or(true);
        if keep {
            out.push(scope);
        }
    }
    Ok(out)
}

fn run_select(tables: &Tables, query: &Select) -> Result<Vec<Row>, StorageError> {
    let mut scopes = matching(tables, query)?;
    if !query.order.is_empty() {
        scopes.sort_by(|a, b| {
            for order in &query.order {
                let ord = sort_cmp(a.lookup(&order.column), b.lookup(&order.column));
                let ord = if order.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
    let offset = query.offset.unwrap_or(0) as usize;
    let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    let columns = query.output_columns();
    Ok(scopes
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|scope| {
            if columns.is_empty() {
                return scope.base.clone();
            }
            columns
                .iter()
                .map(|c| (c.clone(), scope.base.get(c).cloned().unwrap_or(Value::Null)))
                .collect()
        })
        .collect())
}

fn join_matches(cond: &JoinCondition, alias: &str, candidate: &Row, scope: &Scope<'_>) -> bool {
    let resolve = |column: &ColumnRef| -> Value {
        if column.source.as_deref() == Some(alias) {
            candidate.get(&column.column).cloned().unwrap_or(Value::Null)
        } else {
            scope.lookup(column).clone()
        }
    };
    let (left, right) = match cond {
        JoinCondition::Literal { column, value } => (resolve(column), value.clone()),
        JoinCondition::Columns { left, right } => (resolve(left), resolve(right)),
    };
    !left.is_null() && !right.is_null() && same(&left, &right)
}

fn matches(cond: &Condition, scope: &Scope<'_>) -> bool {
    match cond {
        Condition::Compare { column, op, value } => {
            let current = scope.lookup(column);
            if current.is_null() || value.is_null() {
                return false;
            }
            match op {
                CompareOp::Contains => text(current).to_lowercase().contains(&text(value).to_lowercase()),
                CompareOp::Eq => same(current, value),
                CompareOp::Ne => !same(current, value),
                CompareOp::Lt => compare(current, value) == Some(Ordering::Less),
                CompareOp::Lte => matches!(compare(current, value), Some(Ordering::Less | Ordering::Equal)),
                CompareOp::Gt => compare(current, value) == Some(Ordering::Greater),
                CompareOp::Gte => matches!(compare(current, value), Some(Ordering::Greater | Ordering::Equal)),
            }
        }
        Condition::In { column, values } => {
            let current = scope.lookup(column);
            !current.is_null() && values.iter().any(|v| same(current, v))
        }
        Condition::IsNull { column, negated } => scope.lookup(column).is_null() != *negated,
        Condition::And(all) => all.iter().all(|c| matches(c, scope)),
        Condition::Or(any) => any.iter().any(|c| matches(c, scope)),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => value_key(other),
    }
}

fn same(a: &Value, b: &Value) -> bool {
    match compare(a, b) {
        Some(ord) => ord == Ordering::Equal,
        None => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Number(x), Value::String(s)) => x.as_f64()?.partial_cmp(&s.parse::<f64>().ok()?),
        (Value::String(s), Value::Number(y)) => s.parse::<f64>().ok()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Nulls sort after every value, as in PostgreSQL.
fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => compare(a, b).unwrap_or_else(|| value_key(a).cmp(&value_key(b))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SemanticType;
    use crate::store::{Join, OrderBy, TableRef};
    use serde_json::json;

    fn table(name: &str) -> TableRef {
        TableRef::new(
            name,
            vec![
                ("id".into(), Some(SemanticType::Number)),
                ("name".into(), Some(SemanticType::String)),
                ("rank".into(), Some(SemanticType::Number)),
            ],
        )
    }

    async fn seeded() -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.create_table("people").unwrap();
        let mut tx = storage.begin().await.unwrap();
        for (name, rank) in [("ada", json!(2)), ("bob", Value::Null), ("cy", json!(1))] {
            let mut values = Row::new();
            values.insert("name".into(), json!(name));
            values.insert("rank".into(), rank);
            tx.insert(&Insert {
                table: table("people"),
                values,
                identity_column: "id".into(),
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn identities_autoincrement_and_nulls_sort_last() {
        let storage = seeded().await;
        let rows = storage
            .select(&Select::from(table("people")).order_by(OrderBy::asc("rank")))
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("cy"), json!("ada"), json!("bob")]);
        assert_eq!(rows[0]["id"], json!(3));

        let rows = storage
            .select(&Select::from(table("people")).order_by(OrderBy::desc("rank")))
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], json!("bob"));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let storage = seeded().await;
        {
            let mut tx = storage.begin().await.unwrap();
            tx.delete(&Delete {
                table: table("people"),
                filter: Condition::eq("name", json!("ada")),
            })
            .await
            .unwrap();
        }
        assert_eq!(storage.rows("people").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn comparisons_ignore_nulls_and_coerce_numeric_strings() {
        let storage = seeded().await;
        let q = Select::from(table("people")).filter(Condition::compare("rank", CompareOp::Gte, json!("1")));
        assert_eq!(storage.count(&q).await.unwrap(), 2);
        let q = Select::from(table("people")).filter(Condition::compare("name", CompareOp::Contains, json!("A")));
        assert_eq!(storage.count(&q).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn left_join_exposes_matched_columns() {
        let storage = seeded().await;
        let q = Select::from(table("people"))
            .join(Join {
                alias: "boss".into(),
                table: table("people"),
                on: vec![JoinCondition::Columns {
                    left: ColumnRef::on("boss", "id"),
                    right: ColumnRef::new("rank"),
                }],
            })
            .filter(Condition::eq(ColumnRef::on("boss", "name"), json!("ada")));
        let rows = storage.select(&q).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("cy"));
    }
}
