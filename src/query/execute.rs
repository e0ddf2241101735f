//! Runs a compiled plan: base query, optional count, then includes level by level.

use crate::query::compiler::{encode_cursor, CompiledQuery, IncludeNode, Window};
use crate::resolver::LoadedChild;
use crate::store::{value_key, Row, Storage, StorageError};
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Relationship data loaded for one document, keyed by owner `(type, key)` then alias.
#[derive(Debug, Default)]
pub struct LoadedRelations {
    by_owner: HashMap<(String, String), HashMap<String, Vec<LoadedChild>>>,
    /// Every loaded child in load order.
    loaded: Vec<LoadedChild>,
}

impl LoadedRelations {
    pub fn get(&self, type_name: &str, key: &str, alias: &str) -> Option<&[LoadedChild]> {
        self.by_owner
            .get(&(type_name.to_string(), key.to_string()))
            .and_then(|m| m.get(alias))
            .map(Vec::as_slice)
    }

    /// Aliases loaded for one owner.
    pub fn aliases(&self, type_name: &str, key: &str) -> Vec<&str> {
        self.by_owner
            .get(&(type_name.to_string(), key.to_string()))
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn insert(&mut self, type_name: &str, key: String, alias: &str, children: Vec<LoadedChild>) {
        self.loaded.extend(children.iter().cloned());
        self.by_owner
            .entry((type_name.to_string(), key))
            .or_default()
            .insert(alias.to_string(), children);
    }

    pub fn loaded(&self) -> &[LoadedChild] {
        &self.loaded
    }
}

#[derive(Debug)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub total: Option<u64>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub relations: LoadedRelations,
}

type TypedRow = (String, Row);

impl CompiledQuery<'_> {
    pub async fn execute(&self, storage: &dyn Storage) -> Result<QueryResult, StorageError> {
        let (mut rows, total) = match &self.count {
            Some(count) => {
                let (rows, total) = futures::try_join!(storage.select(&self.base), storage.count(count))?;
                (rows, Some(total))
            }
            None => (storage.select(&self.base).await?, None),
        };
        let limit = self.window.limit() as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let next_cursor = match (&self.window, rows.last()) {
            (Window::Cursor { .. }, Some(last)) if has_more => {
                let values: Vec<Value> = self
                    .sort
                    .iter()
                    .map(|k| last.get(&k.column).cloned().unwrap_or(Value::Null))
                    .collect();
                Some(encode_cursor(&values))
            }
            _ => None,
        };

        let typed: Vec<TypedRow> = rows.iter().map(|r| (self.schema.type_name.clone(), r.clone())).collect();
        let relations = self.load_includes(storage, typed).await?;
        Ok(QueryResult {
            rows,
            total,
            has_more,
            next_cursor,
            relations,
        })
    }

    /// Breadth-first include loading; every batch of one level runs concurrently.
    pub async fn load_includes(&self, storage: &dyn Storage, primary: Vec<TypedRow>) -> Result<LoadedRelations, StorageError> {
        let mut relations = LoadedRelations::default();
        let mut level: Vec<(&IncludeNode, Vec<TypedRow>)> = self.includes.iter().map(|n| (n, primary.clone())).collect();

        while !level.is_empty() {
            let mut jobs = Vec::new();
            for (index, (node, parents)) in level.iter().enumerate() {
                for plan in &node.plans {
                    let rows: Vec<Row> = parents
                        .iter()
                        .filter(|(t, _)| *t == plan.owner.type_name)
                        .map(|(_, r)| r.clone())
                        .collect();
                    jobs.push((index, plan, rows));
                }
            }
            let results = try_join_all(
                jobs.iter()
                    .map(|(_, plan, rows)| plan.load_batch(storage, rows, &self.load_options)),
            )
            .await?;

            let mut reached: Vec<Vec<TypedRow>> = vec![Vec::new(); level.len()];
            let mut seen: Vec<HashSet<(String, String)>> = vec![HashSet::new(); level.len()];
            for ((index, plan, parents), mut loaded) in jobs.into_iter().zip(results) {
                for parent in &parents {
                    let Some(key) = parent.get(&plan.owner.id_property).filter(|v| !v.is_null()).map(value_key) else {
                        continue;
                    };
                    let children = loaded.remove(&key).unwrap_or_default();
                    for child in &children {
                        let id = child.row.get(&identity_of(plan, &child.type_name)).map(value_key).unwrap_or_default();
                        if seen[index].insert((child.type_name.clone(), id)) {
                            reached[index].push((child.type_name.clone(), child.row.clone()));
                        }
                    }
                    relations.insert(&plan.owner.type_name, key, &plan.alias, children);
                }
            }

            let mut next = Vec::new();
            for ((node, _), rows) in level.into_iter().zip(reached) {
                for child in &node.children {
                    next.push((child, rows.clone()));
                }
            }
            level = next;
        }
        Ok(relations)
    }
}

fn identity_of(plan: &crate::resolver::RelationshipPlan<'_>, type_name: &str) -> String {
    plan.target_schemas()
        .into_iter()
        .find(|t| t.type_name == type_name)
        .map(|t| t.id_property.clone())
        .unwrap_or_else(|| "id".to_string())
}
