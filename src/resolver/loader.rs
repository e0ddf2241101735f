use super::{JoinStrategy, LoadOptions, LoadedChild, RelationshipPlan};
use crate::schema::ResourceSchema;
use crate::store::{value_key, Condition, OrderBy, Row, Select, Storage, StorageError};
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Distinct non-null values of `column` across `rows`, first-seen order.
fn distinct(rows: &[Row], column: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|r| r.get(column))
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(value_key(v)))
        .cloned()
        .collect()
}

fn key_of(row: &Row, column: &str) -> Option<String> {
    row.get(column).filter(|v| !v.is_null()).map(value_key)
}

impl<'r> RelationshipPlan<'r> {
    /// Loads this relationship for every parent row in a bounded number of queries.
    /// The result maps each parent's identity key to its children in storage order;
    /// parents with no children are absent.
    pub async fn load_batch(
        &self,
        storage: &dyn Storage,
        parents: &[Row],
        options: &LoadOptions,
    ) -> Result<HashMap<String, Vec<LoadedChild>>, StorageError> {
        let owner_id = self.owner.id_property.as_str();
        let mut out: HashMap<String, Vec<LoadedChild>> = HashMap::new();
        if parents.is_empty() {
            return Ok(out);
        }
        tracing::debug!(
            resource = %self.owner.type_name,
            relationship = %self.alias,
            parents = parents.len(),
            "loading relationship batch"
        );

        match &self.strategy {
            JoinStrategy::BelongsTo { target, foreign_key } => {
                let keys = distinct(parents, foreign_key);
                let by_id = self.fetch_by(storage, target, &target.id_property, keys, options).await?;
                for parent in parents {
                    let (Some(pk), Some(fk)) = (key_of(parent, owner_id), key_of(parent, foreign_key)) else {
                        continue;
                    };
                    if let Some(row) = by_id.get(&fk).and_then(|rows| rows.first()) {
                        out.entry(pk).or_default().push(child(target, row.clone(), None));
                    }
                }
            }
            JoinStrategy::Direct {
                target,
                foreign_key,
                single,
            } => {
                let ids = distinct(parents, owner_id);
                let by_fk = self.fetch_by(storage, target, foreign_key, ids, options).await?;
                for (fk, rows) in by_fk {
                    let children: Vec<LoadedChild> = rows.into_iter().map(|r| child(target, r, None)).collect();
                    out.insert(fk, children);
                }
                if *single {
                    self.keep_first(&mut out);
                }
            }
            JoinStrategy::Through {
                target,
                pivot,
                foreign_key,
                other_key,
                single,
            } => {
                let ids = distinct(parents, owner_id);
                let pivots = self.fetch(storage, pivot, foreign_key, ids, None, None).await?;
                let target_ids = distinct(&pivots, other_key);
                let by_id = self.fetch_by(storage, target, &target.id_property, target_ids, options).await?;
                for pivot_row in pivots {
                    let (Some(parent), Some(other)) = (key_of(&pivot_row, foreign_key), key_of(&pivot_row, other_key))
                    else {
                        continue;
                    };
                    let Some(row) = by_id.get(&other).and_then(|rows| rows.first()) else {
                        tracing::warn!(
                            resource = %self.owner.type_name,
                            relationship = %self.alias,
                            pivot = %pivot.type_name,
                            target_id = %other,
                            "pivot row points at a missing record"
                        );
                        continue;
                    };
                    let extras = pivot_extras(pivot, foreign_key, other_key, pivot_row);
                    out.entry(parent).or_default().push(child(target, row.clone(), extras));
                }
                if *single {
                    self.keep_first(&mut out);
                }
            }
            JoinStrategy::Polymorphic {
                targets,
                type_field,
                id_field,
            } => {
                let mut ids_by_type: Vec<(&ResourceSchema, Vec<Row>)> = Vec::new();
                for parent in parents {
                    let type_name = parent.get(type_field).and_then(Value::as_str);
                    let (Some(type_name), Some(_)) = (type_name, key_of(parent, id_field)) else {
                        continue;
                    };
                    let Some(schema) = targets.iter().find(|t| t.type_name == type_name) else {
                        tracing::warn!(
                            resource = %self.owner.type_name,
                            relationship = %self.alias,
                            discriminator = %type_name,
                            "polymorphic discriminator outside the allowed types"
                        );
                        continue;
                    };
                    match ids_by_type.iter_mut().find(|(s, _)| s.type_name == schema.type_name) {
                        Some((_, rows)) => rows.push(parent.clone()),
                        None => ids_by_type.push((*schema, vec![parent.clone()])),
                    }
                }
                let loads = ids_by_type.iter().map(|(schema, rows)| {
                    let schema: &ResourceSchema = schema;
                    let ids = distinct(rows, id_field);
                    async move {
                        let by_id = self.fetch_by(storage, schema, &schema.id_property, ids, options).await?;
                        Ok::<_, StorageError>((schema.type_name.as_str(), by_id))
                    }
                });
                let loaded: HashMap<&str, HashMap<String, Vec<Row>>> = try_join_all(loads).await?.into_iter().collect();
                for parent in parents {
                    let (Some(pk), Some(type_name), Some(id)) = (
                        key_of(parent, owner_id),
                        parent.get(type_field).and_then(Value::as_str),
                        key_of(parent, id_field),
                    ) else {
                        continue;
                    };
                    let row = loaded.get(type_name).and_then(|m| m.get(&id)).and_then(|rows| rows.first());
                    if let (Some(row), Some(schema)) = (row, targets.iter().find(|t| t.type_name == type_name)) {
                        out.entry(pk).or_default().push(child(schema, row.clone(), None));
                    }
                }
            }
            JoinStrategy::Via {
                target,
                type_field,
                id_field,
            } => {
                let ids = distinct(parents, owner_id);
                let discriminator = Condition::eq(type_field.as_str(), Value::String(self.owner.type_name.clone()));
                let rows = self.fetch(storage, target, id_field, ids, Some(discriminator), Some(options)).await?;
                for row in rows {
                    if let Some(parent) = key_of(&row, id_field) {
                        out.entry(parent).or_default().push(child(target, row, None));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Rows of `schema` whose `column` is in `keys`, grouped by that column's key.
    async fn fetch_by(
        &self,
        storage: &dyn Storage,
        schema: &ResourceSchema,
        column: &str,
        keys: Vec<Value>,
        options: &LoadOptions,
    ) -> Result<HashMap<String, Vec<Row>>, StorageError> {
        let rows = self.fetch(storage, schema, column, keys, None, Some(options)).await?;
        let mut grouped: HashMap<String, Vec<Row>> = HashMap::new();
        for row in rows {
            if let Some(k) = key_of(&row, column) {
                grouped.entry(k).or_default().push(row);
            }
        }
        Ok(grouped)
    }

    /// `column IN keys` ordered by identity, `extra` ANDed in. With options, only the planned
    /// columns (plus the identity and `column`) are selected.
    async fn fetch(
        &self,
        storage: &dyn Storage,
        schema: &ResourceSchema,
        column: &str,
        keys: Vec<Value>,
        extra: Option<Condition>,
        options: Option<&LoadOptions>,
    ) -> Result<Vec<Row>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut select = Select::from(self.registry.table_ref(schema))
            .filter(Condition::is_in(column, keys))
            .order_by(OrderBy::asc(schema.id_property.as_str()));
        if let Some(extra) = extra {
            select = select.filter(extra);
        }
        if let Some(options) = options {
            if let Some(columns) = options.columns.get(&schema.type_name) {
                let mut columns = columns.clone();
                for required in [schema.id_property.as_str(), column] {
                    if !columns.iter().any(|c| c == required) {
                        columns.push(required.to_string());
                    }
                }
                select = select.columns(columns);
            }
        }
        storage.select(&select).await
    }

    fn keep_first(&self, out: &mut HashMap<String, Vec<LoadedChild>>) {
        for (parent, children) in out.iter_mut() {
            if children.len() > 1 {
                tracing::warn!(
                    resource = %self.owner.type_name,
                    relationship = %self.alias,
                    parent = %parent,
                    count = children.len(),
                    "hasOne relationship matched more than one record; keeping the first"
                );
                children.truncate(1);
            }
        }
    }
}

fn child(schema: &ResourceSchema, row: Row, pivot: Option<Row>) -> LoadedChild {
    LoadedChild {
        type_name: schema.type_name.clone(),
        row,
        pivot,
    }
}

/// Pivot columns other than its identity and the two keys; `None` when there are none.
fn pivot_extras(pivot: &ResourceSchema, foreign_key: &str, other_key: &str, mut row: Row) -> Option<Row> {
    row.retain(|k, _| k != &pivot.id_property && k != foreign_key && k != other_key);
    if row.is_empty() {
        None
    } else {
        Some(row)
    }
}
