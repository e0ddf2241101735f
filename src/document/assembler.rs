//! Rows and loaded relationships to JSON:API resource objects.

use crate::document::links::LinkBuilder;
use crate::document::types::*;
use crate::error::AppError;
use crate::pipeline::{plan_columns, read_pass, ColumnPlan};
use crate::query::{CompiledQuery, LoadedRelations, QueryResult, Window};
use crate::resolver::LoadedChild;
use crate::schema::{RelationshipDefinition, ResourceSchema, SchemaRegistry};
use crate::store::{value_key, Row};
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

pub struct DocumentAssembler<'a> {
    registry: &'a SchemaRegistry,
    links: LinkBuilder<'a>,
}

impl<'a> DocumentAssembler<'a> {
    pub fn new(registry: &'a SchemaRegistry, base_url: &'a str) -> Self {
        DocumentAssembler {
            registry,
            links: LinkBuilder::new(base_url),
        }
    }

    pub fn links(&self) -> LinkBuilder<'a> {
        self.links
    }

    /// Identifier of a row of `schema`, or `None` when its identity is null.
    pub fn identifier(schema: &ResourceSchema, row: &Row) -> Option<ResourceIdentifier> {
        row.get(&schema.id_property)
            .filter(|v| !v.is_null())
            .map(|v| ResourceIdentifier::new(schema.type_name.clone(), value_key(v)))
    }

    pub async fn resource(
        &self,
        schema: &ResourceSchema,
        row: &Row,
        plan: &ColumnPlan,
        relations: &LoadedRelations,
    ) -> Result<ResourceObject, AppError> {
        let id = row.get(&schema.id_property).map(value_key).unwrap_or_default();
        let attributes = read_pass(schema, row, plan).await?;
        let mut relationships = BTreeMap::new();
        for alias in schema.relationship_aliases() {
            let Some(definition) = schema.relationship(alias) else { continue };
            let data = match &definition {
                RelationshipDefinition::BelongsTo(r) => Some(Linkage::One(
                    row.get(&r.foreign_key)
                        .filter(|v| !v.is_null())
                        .map(|v| ResourceIdentifier::new(r.target.clone(), value_key(v))),
                )),
                RelationshipDefinition::BelongsToPolymorphic(p) => {
                    let type_name = row.get(&p.type_field).and_then(Value::as_str).filter(|t| p.allows(t));
                    let target_id = row.get(&p.id_field).filter(|v| !v.is_null());
                    Some(Linkage::One(match (type_name, target_id) {
                        (Some(t), Some(i)) => Some(ResourceIdentifier::new(t, value_key(i))),
                        _ => None,
                    }))
                }
                _ => relations
                    .get(&schema.type_name, &id, alias)
                    .map(|children| self.loaded_linkage(children, definition.is_to_one())),
            };
            if let Some(data) = data {
                relationships.insert(
                    alias.to_string(),
                    Relationship {
                        data,
                        links: Some(self.links.relationship(&schema.type_name, &id, alias)),
                    },
                );
            }
        }
        Ok(ResourceObject {
            type_name: schema.type_name.clone(),
            links: self.links.resource(&schema.type_name, &id),
            id,
            attributes,
            relationships,
        })
    }

    /// Linkage of loaded children, storage order kept.
    pub fn loaded_linkage(&self, children: &[LoadedChild], to_one: bool) -> Linkage {
        let identifiers: Vec<ResourceIdentifier> = children
            .iter()
            .filter_map(|child| {
                let schema = self.registry.resolve(&child.type_name).ok()?;
                let mut identifier = Self::identifier(schema, &child.row)?;
                identifier.meta = child.pivot.clone().map(|extras| {
                    let mut meta = serde_json::Map::new();
                    meta.insert("pivot".into(), Value::Object(extras));
                    meta
                });
                Some(identifier)
            })
            .collect();
        if to_one {
            Linkage::One(identifiers.into_iter().next())
        } else {
            Linkage::Many(identifiers)
        }
    }

    /// Primary resources in row order.
    pub async fn primary(&self, query: &CompiledQuery<'_>, result: &QueryResult) -> Result<Vec<ResourceObject>, AppError> {
        let default_plan;
        let plan = match query.column_plan(&query.schema.type_name) {
            Some(plan) => plan,
            None => {
                default_plan = plan_columns(query.schema, None)?;
                &default_plan
            }
        };
        try_join_all(
            result
                .rows
                .iter()
                .map(|row| self.resource(query.schema, row, plan, &result.relations)),
        )
        .await
    }

    /// Every loaded child once, in load order, primary resources excluded.
    pub async fn included(
        &self,
        query: &CompiledQuery<'_>,
        result: &QueryResult,
        primary: &[ResourceObject],
    ) -> Result<Vec<ResourceObject>, AppError> {
        let mut seen: HashSet<(String, String)> =
            primary.iter().map(|r| (r.type_name.clone(), r.id.clone())).collect();
        let mut out = Vec::new();
        for child in result.relations.loaded() {
            let schema = self.registry.resolve(&child.type_name)?;
            let Some(identifier) = Self::identifier(schema, &child.row) else { continue };
            if !seen.insert((identifier.type_name, identifier.id)) {
                continue;
            }
            let plan = match query.column_plan(&schema.type_name) {
                Some(plan) => plan.clone(),
                None => plan_columns(schema, None)?,
            };
            out.push(self.resource(schema, &child.row, &plan, &result.relations).await?);
        }
        Ok(out)
    }

    /// Collection document with pagination links (rooted at `path`) and meta.
    pub async fn collection(&self, query: &CompiledQuery<'_>, result: &QueryResult, path: &str) -> Result<Document, AppError> {
        let data = self.primary(query, result).await?;
        let included = self.included(query, result, &data).await?;
        let links = self.links.paginated(
            path,
            &query.params,
            &query.window,
            result.has_more,
            result.next_cursor.as_deref(),
        );
        let pagination = match &query.window {
            Window::Offset { offset, limit } => PaginationMeta {
                offset: Some(*offset),
                limit: *limit,
                total: result.total,
                has_more: result.has_more,
                next_cursor: None,
            },
            Window::Cursor { limit, .. } => PaginationMeta {
                offset: None,
                limit: *limit,
                total: None,
                has_more: result.has_more,
                next_cursor: result.next_cursor.clone(),
            },
        };
        Ok(Document {
            data: PrimaryData::Many(data),
            included,
            links,
            meta: Some(DocumentMeta { pagination }),
        })
    }

    /// Single-resource document; `data` is null when the result holds no row.
    pub async fn single(&self, query: &CompiledQuery<'_>, result: &QueryResult, path: &str) -> Result<Document, AppError> {
        let mut data = self.primary(query, result).await?;
        let included = self.included(query, result, &data).await?;
        let query_string = query.params.to_query_string(&[]);
        Ok(Document {
            data: match data.pop() {
                Some(resource) => PrimaryData::One(Box::new(resource)),
                None => PrimaryData::Null,
            },
            included,
            links: DocumentLinks {
                self_link: if query_string.is_empty() {
                    path.to_string()
                } else {
                    format!("{}?{}", path, query_string)
                },
                ..Default::default()
            },
            meta: None,
        })
    }
}
