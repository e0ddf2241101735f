//! Write coordinator: validate, run setters, then apply the primary row and its
//! relationship side effects inside one storage transaction.

use crate::document::{Linkage, ResourceIdentifier, ResourceInput};
use crate::error::{AppError, FieldViolation, OperationContext, StorageResultExt};
use crate::hooks::Method;
use crate::pipeline::write_pass;
use crate::query::filter::coerce;
use crate::resolver::{self, JoinStrategy, RelationshipPlan};
use crate::schema::{FieldDefinition, ResourceSchema, SchemaRegistry};
use crate::service::RequestValidator;
use crate::store::{value_key, CompareOp, Condition, Delete, Insert, Row, Select, Storage, StorageTx, Update};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Only the given attributes change.
    Patch,
    /// Absent writable attributes are reset to null.
    Put,
}

/// Identity value of `id` for `schema`; ids that cannot be coerced match nothing.
pub fn identity_value(registry: &SchemaRegistry, schema: &ResourceSchema, id: &str) -> Result<Value, AppError> {
    coerce(&schema.id_property, id, registry.column_type(schema, &schema.id_property))
        .map_err(|_| AppError::not_found(&schema.type_name, id))
}

/// Target records a write points at; they must exist before anything is written.
struct Reference<'r> {
    alias: String,
    target: &'r ResourceSchema,
    ids: Vec<Value>,
}

struct ToMany<'r> {
    plan: RelationshipPlan<'r>,
    ids: Vec<Value>,
}

/// Input split into local column values and to-many side effects.
struct Prepared<'r> {
    attributes: Row,
    to_many: Vec<ToMany<'r>>,
    references: Vec<Reference<'r>>,
}

pub struct WriteCoordinator<'r> {
    registry: &'r SchemaRegistry,
    storage: &'r dyn Storage,
}

impl<'r> WriteCoordinator<'r> {
    pub fn new(registry: &'r SchemaRegistry, storage: &'r dyn Storage) -> Self {
        WriteCoordinator { registry, storage }
    }

    /// Inserts a record and its to-many linkage. Returns the stored identity.
    pub async fn create(&self, schema: &'r ResourceSchema, input: &ResourceInput) -> Result<Value, AppError> {
        let ctx = OperationContext::new(Method::Post, &schema.type_name, input.id.clone());
        check_type(schema, input)?;
        let prepared = self.prepare(schema, input)?;
        RequestValidator::validate(schema, &prepared.attributes, true)?;
        let mut columns = write_pass(schema, &prepared.attributes).await?;
        if let Some(id) = &input.id {
            let ty = self.registry.column_type(schema, &schema.id_property);
            columns.insert(schema.id_property.clone(), coerce(&schema.id_property, id, ty)?);
        }

        let mut tx = self.storage.begin().await.context(&ctx)?;
        let result = self.create_in(tx.as_mut(), schema, columns, &prepared, &ctx).await;
        let row = finish(tx, result, &ctx).await?;
        let id = row.get(&schema.id_property).cloned().unwrap_or(Value::Null);
        tracing::info!(resource = %schema.type_name, id = %value_key(&id), "created");
        Ok(id)
    }

    async fn create_in(
        &self,
        tx: &mut dyn StorageTx,
        schema: &ResourceSchema,
        columns: Row,
        prepared: &Prepared<'r>,
        ctx: &OperationContext,
    ) -> Result<Row, AppError> {
        check_polymorphic_pairs(schema, &columns)?;
        self.ensure_references(tx, &prepared.references, ctx).await?;
        self.check_unique(tx, schema, &columns, None, ctx).await?;
        let row = tx
            .insert(&Insert {
                table: self.registry.table_ref(schema),
                values: columns,
                identity_column: schema.id_property.clone(),
            })
            .await
            .context(ctx)?;
        let owner = row.get(&schema.id_property).cloned().unwrap_or(Value::Null);
        for link in &prepared.to_many {
            self.attach(tx, &link.plan, &owner, &link.ids, ctx).await?;
        }
        Ok(row)
    }

    /// PATCH or PUT. Only columns whose setter-resolved value differs from the stored row
    /// are written; to-many linkage in the input replaces the current set.
    pub async fn update(
        &self,
        schema: &'r ResourceSchema,
        id: &str,
        input: &ResourceInput,
        mode: UpdateMode,
    ) -> Result<(), AppError> {
        let method = match mode {
            UpdateMode::Patch => Method::Patch,
            UpdateMode::Put => Method::Put,
        };
        let ctx = OperationContext::new(method, &schema.type_name, Some(id.to_string()));
        check_type(schema, input)?;
        if input.id.as_deref().is_some_and(|given| given != id) {
            return Err(AppError::BadRequest(format!("body id does not match '{}'", id)));
        }
        let owner = identity_value(self.registry, schema, id)?;
        let prepared = self.prepare(schema, input)?;

        let reset: Vec<&str> = match mode {
            UpdateMode::Put => schema
                .fields
                .iter()
                .filter(|f| matches!(f.definition, FieldDefinition::Column(_)))
                .map(|f| f.name.as_str())
                .filter(|name| *name != schema.id_property && !schema.is_linkage_column(name))
                .filter(|name| !prepared.attributes.contains_key(*name))
                .collect(),
            UpdateMode::Patch => Vec::new(),
        };
        let mut checked = prepared.attributes.clone();
        for name in &reset {
            checked.insert(name.to_string(), Value::Null);
        }
        RequestValidator::validate(schema, &checked, false)?;
        let mut columns = write_pass(schema, &prepared.attributes).await?;
        for name in reset {
            columns.insert(name.to_string(), Value::Null);
        }

        let mut tx = self.storage.begin().await.context(&ctx)?;
        let result = self.update_in(tx.as_mut(), schema, &owner, columns, &prepared, &ctx).await;
        let changed = finish(tx, result, &ctx).await?;
        tracing::info!(resource = %schema.type_name, id = %id, method = %method, changed = changed, "updated");
        Ok(())
    }

    async fn update_in(
        &self,
        tx: &mut dyn StorageTx,
        schema: &ResourceSchema,
        owner: &Value,
        columns: Row,
        prepared: &Prepared<'r>,
        ctx: &OperationContext,
    ) -> Result<usize, AppError> {
        let current = self
            .fetch_one(tx, schema, owner, ctx)
            .await?
            .ok_or_else(|| AppError::not_found(&schema.type_name, value_key(owner)))?;
        self.ensure_references(tx, &prepared.references, ctx).await?;
        let changed: Row = columns
            .into_iter()
            .filter(|(name, value)| *name != schema.id_property && !same_value(current.get(name), value))
            .collect();
        let mut merged = current.clone();
        merged.extend(changed.iter().map(|(k, v)| (k.clone(), v.clone())));
        check_polymorphic_pairs(schema, &merged)?;
        let count = changed.len();
        if !changed.is_empty() {
            self.check_unique(tx, schema, &changed, Some(owner), ctx).await?;
            tx.update(&Update {
                table: self.registry.table_ref(schema),
                set: changed,
                filter: Condition::eq(schema.id_property.as_str(), owner.clone()),
            })
            .await
            .context(ctx)?;
        }
        for link in &prepared.to_many {
            self.replace(tx, &link.plan, owner, &link.ids, ctx).await?;
        }
        Ok(count)
    }

    /// Deletes a record and the pivot rows of its many-to-many relationships.
    pub async fn delete(&self, schema: &'r ResourceSchema, id: &str) -> Result<(), AppError> {
        let ctx = OperationContext::new(Method::Delete, &schema.type_name, Some(id.to_string()));
        let owner = identity_value(self.registry, schema, id)?;
        let mut tx = self.storage.begin().await.context(&ctx)?;
        let result = self.delete_in(tx.as_mut(), schema, &owner, &ctx).await;
        let pivots = finish(tx, result, &ctx).await?;
        tracing::info!(resource = %schema.type_name, id = %id, pivots_removed = pivots, "deleted");
        Ok(())
    }

    async fn delete_in(
        &self,
        tx: &mut dyn StorageTx,
        schema: &'r ResourceSchema,
        owner: &Value,
        ctx: &OperationContext,
    ) -> Result<u64, AppError> {
        if self.fetch_one(tx, schema, owner, ctx).await?.is_none() {
            return Err(AppError::not_found(&schema.type_name, value_key(owner)));
        }
        let mut pivots = 0;
        for alias in schema.relationship_aliases() {
            let plan = resolver::resolve(self.registry, schema, alias)?;
            if let JoinStrategy::Through { pivot, foreign_key, .. } = &plan.strategy {
                pivots += tx
                    .delete(&Delete {
                        table: self.registry.table_ref(pivot),
                        filter: Condition::eq(foreign_key.as_str(), owner.clone()),
                    })
                    .await
                    .context(ctx)?;
            }
        }
        self.release_dependents(tx, schema, owner, ctx).await?;
        tx.delete(&Delete {
            table: self.registry.table_ref(schema),
            filter: Condition::eq(schema.id_property.as_str(), owner.clone()),
        })
        .await
        .context(ctx)?;
        Ok(pivots)
    }

    /// Applies the foreign key delete rules for belongsTo columns that point at `owner`:
    /// nullable columns are cleared, non-nullable ones block the delete.
    async fn release_dependents(
        &self,
        tx: &mut dyn StorageTx,
        schema: &'r ResourceSchema,
        owner: &Value,
        ctx: &OperationContext,
    ) -> Result<(), AppError> {
        let mut blocked = Vec::new();
        for other in self.registry.schemas() {
            for (column, belongs_to) in other.belongs_to_fields() {
                if belongs_to.target != schema.type_name {
                    continue;
                }
                let filter = Condition::eq(column, owner.clone());
                if belongs_to.nullable {
                    let mut set = Row::new();
                    set.insert(column.to_string(), Value::Null);
                    let cleared = tx
                        .update(&Update {
                            table: self.registry.table_ref(other),
                            set,
                            filter,
                        })
                        .await
                        .context(ctx)?;
                    if cleared > 0 {
                        tracing::debug!(resource = %other.type_name, column = %column, cleared, "cleared references to deleted record");
                    }
                } else {
                    let select = Select::from(self.registry.table_ref(other)).filter(filter).limit(1);
                    if !tx.select(&select).await.context(ctx)?.is_empty() {
                        blocked.push(FieldViolation::new(
                            format!("{}.{}", other.type_name, column),
                            format!("{} records still reference this {}", other.type_name, schema.type_name),
                        ));
                    }
                }
            }
        }
        if blocked.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(blocked))
        }
    }

    /// Adds members to a to-many relationship; pivots that already exist are kept.
    pub async fn add_relationship(
        &self,
        schema: &'r ResourceSchema,
        id: &str,
        alias: &str,
        linkage: &Linkage,
    ) -> Result<(), AppError> {
        self.mutate_members(Method::AddRelationship, schema, id, alias, linkage).await
    }

    /// Removes members of a to-many relationship. Target records are never deleted.
    pub async fn delete_relationship(
        &self,
        schema: &'r ResourceSchema,
        id: &str,
        alias: &str,
        linkage: &Linkage,
    ) -> Result<(), AppError> {
        self.mutate_members(Method::DeleteRelationship, schema, id, alias, linkage).await
    }

    async fn mutate_members(
        &self,
        method: Method,
        schema: &'r ResourceSchema,
        id: &str,
        alias: &str,
        linkage: &Linkage,
    ) -> Result<(), AppError> {
        let ctx = OperationContext::new(method, &schema.type_name, Some(id.to_string()));
        let owner = identity_value(self.registry, schema, id)?;
        let plan = resolver::resolve(self.registry, schema, alias)?;
        if plan.is_to_one() {
            return Err(AppError::BadRequest(format!(
                "'{}' is a to-one relationship; replace it instead",
                alias
            )));
        }
        let (target, ids) = self.member_ids(alias, &plan, linkage)?;
        let mut tx = self.storage.begin().await.context(&ctx)?;
        let result = async {
            if self.fetch_one(tx.as_mut(), schema, &owner, &ctx).await?.is_none() {
                return Err(AppError::not_found(&schema.type_name, id));
            }
            if method == Method::AddRelationship {
                let reference = Reference {
                    alias: alias.to_string(),
                    target,
                    ids: ids.clone(),
                };
                self.ensure_references(tx.as_mut(), std::slice::from_ref(&reference), &ctx).await?;
                self.attach(tx.as_mut(), &plan, &owner, &ids, &ctx).await
            } else {
                self.detach(tx.as_mut(), &plan, &owner, &ids, &ctx).await
            }
        }
        .await;
        finish(tx, result, &ctx).await?;
        tracing::info!(resource = %schema.type_name, id = %id, relationship = %alias, method = %method, count = ids.len(), "relationship updated");
        Ok(())
    }

    /// Replaces a relationship wholesale. To-one relationships set or clear local columns.
    pub async fn replace_relationship(
        &self,
        schema: &'r ResourceSchema,
        id: &str,
        alias: &str,
        linkage: &Linkage,
    ) -> Result<(), AppError> {
        let ctx = OperationContext::new(Method::ReplaceRelationship, &schema.type_name, Some(id.to_string()));
        let owner = identity_value(self.registry, schema, id)?;
        let plan = resolver::resolve(self.registry, schema, alias)?;
        let local = self.local_columns(alias, &plan, linkage)?;
        if let Some((columns, _)) = &local {
            RequestValidator::validate(schema, columns, false)?;
        }
        let members = match local {
            Some(_) => None,
            None => Some(self.member_ids(alias, &plan, linkage)?),
        };

        let mut tx = self.storage.begin().await.context(&ctx)?;
        let result = async {
            if self.fetch_one(tx.as_mut(), schema, &owner, &ctx).await?.is_none() {
                return Err(AppError::not_found(&schema.type_name, id));
            }
            match (&local, &members) {
                (Some((columns, reference)), _) => {
                    if let Some(reference) = reference {
                        self.ensure_references(tx.as_mut(), std::slice::from_ref(reference), &ctx).await?;
                    }
                    tx.update(&Update {
                        table: self.registry.table_ref(schema),
                        set: columns.clone(),
                        filter: Condition::eq(schema.id_property.as_str(), owner.clone()),
                    })
                    .await
                    .context(&ctx)?;
                    Ok(())
                }
                (None, Some((target, ids))) => {
                    let reference = Reference {
                        alias: alias.to_string(),
                        target: *target,
                        ids: ids.clone(),
                    };
                    self.ensure_references(tx.as_mut(), std::slice::from_ref(&reference), &ctx).await?;
                    self.replace(tx.as_mut(), &plan, &owner, ids, &ctx).await
                }
                (None, None) => Ok(()),
            }
        }
        .await;
        finish(tx, result, &ctx).await?;
        tracing::info!(resource = %schema.type_name, id = %id, relationship = %alias, "relationship replaced");
        Ok(())
    }

    fn prepare(&self, schema: &'r ResourceSchema, input: &ResourceInput) -> Result<Prepared<'r>, AppError> {
        let mut prepared = Prepared {
            attributes: input.attributes.clone(),
            to_many: Vec::new(),
            references: Vec::new(),
        };
        for (alias, relationship) in &input.relationships {
            let plan = resolver::resolve(self.registry, schema, alias)?;
            match self.local_columns(alias, &plan, &relationship.data)? {
                Some((columns, reference)) => {
                    prepared.attributes.extend(columns);
                    prepared.references.extend(reference);
                }
                None => {
                    let (target, ids) = self.member_ids(alias, &plan, &relationship.data)?;
                    prepared.references.push(Reference {
                        alias: alias.clone(),
                        target,
                        ids: ids.clone(),
                    });
                    prepared.to_many.push(ToMany { plan, ids });
                }
            }
        }
        // Foreign keys written as plain attributes must point at existing records too.
        for (column, belongs_to) in schema.belongs_to_fields() {
            if input.relationships.contains_key(&belongs_to.alias) {
                continue;
            }
            let Some(value) = input.attributes.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let target = self.registry.resolve(&belongs_to.target)?;
            // Uncoercible values are left for the validator to report.
            let Ok(id) = coerce(column, &value_key(value), self.registry.column_type(schema, column)) else {
                continue;
            };
            prepared.references.push(Reference {
                alias: column.to_string(),
                target,
                ids: vec![id],
            });
        }
        Ok(prepared)
    }

    /// Owner-row columns for belongsTo and polymorphic linkage; `None` for other strategies.
    fn local_columns(
        &self,
        alias: &str,
        plan: &RelationshipPlan<'r>,
        linkage: &Linkage,
    ) -> Result<Option<(Row, Option<Reference<'r>>)>, AppError> {
        let (allowed, key_column, type_column) = match &plan.strategy {
            JoinStrategy::BelongsTo { target, foreign_key } => (vec![*target], foreign_key, None),
            JoinStrategy::Polymorphic {
                targets,
                type_field,
                id_field,
            } => (targets.clone(), id_field, Some(type_field)),
            _ => return Ok(None),
        };
        let Linkage::One(identifier) = linkage else {
            return Err(AppError::validation(alias, "expects a single resource identifier or null"));
        };
        let mut columns = Row::new();
        let mut reference = None;
        match identifier {
            Some(identifier) => {
                let (target, id) = self.resolve_identifier(alias, identifier, &allowed)?;
                if let Some(type_column) = type_column {
                    columns.insert(type_column.clone(), Value::String(target.type_name.clone()));
                }
                columns.insert(key_column.clone(), id.clone());
                reference = Some(Reference {
                    alias: alias.to_string(),
                    target,
                    ids: vec![id],
                });
            }
            None => {
                if let Some(type_column) = type_column {
                    columns.insert(type_column.clone(), Value::Null);
                }
                columns.insert(key_column.clone(), Value::Null);
            }
        }
        Ok(Some((columns, reference)))
    }

    /// Target identities of a to-many (or hasOne) linkage.
    fn member_ids(
        &self,
        alias: &str,
        plan: &RelationshipPlan<'r>,
        linkage: &Linkage,
    ) -> Result<(&'r ResourceSchema, Vec<Value>), AppError> {
        let targets = plan.target_schemas();
        let Some(target) = targets.first().copied() else {
            return Err(AppError::invalid_schema(&plan.owner.type_name, format!("'{}' has no target", alias)));
        };
        let identifiers: Vec<&ResourceIdentifier> = match linkage {
            Linkage::Many(list) if !plan.is_to_one() => list.iter().collect(),
            Linkage::One(one) if plan.is_to_one() => one.iter().collect(),
            Linkage::Many(_) => return Err(AppError::validation(alias, "expects a single resource identifier or null")),
            Linkage::One(_) => return Err(AppError::validation(alias, "expects an array of resource identifiers")),
        };
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            let (_, id) = self.resolve_identifier(alias, identifier, &[target])?;
            if seen.insert(value_key(&id)) {
                ids.push(id);
            }
        }
        Ok((target, ids))
    }

    fn resolve_identifier(
        &self,
        alias: &str,
        identifier: &ResourceIdentifier,
        allowed: &[&'r ResourceSchema],
    ) -> Result<(&'r ResourceSchema, Value), AppError> {
        let Some(target) = allowed.iter().copied().find(|t| t.type_name == identifier.type_name) else {
            let names: Vec<&str> = allowed.iter().map(|t| t.type_name.as_str()).collect();
            return Err(AppError::validation(
                alias,
                format!("type '{}' is not one of: {}", identifier.type_name, names.join(", ")),
            ));
        };
        let ty = self.registry.column_type(target, &target.id_property);
        let id = coerce(alias, &identifier.id, ty)?;
        Ok((target, id))
    }

    async fn fetch_one(
        &self,
        tx: &mut dyn StorageTx,
        schema: &ResourceSchema,
        owner: &Value,
        ctx: &OperationContext,
    ) -> Result<Option<Row>, AppError> {
        let rows = tx
            .select(
                &Select::from(self.registry.table_ref(schema))
                    .filter(Condition::eq(schema.id_property.as_str(), owner.clone()))
                    .limit(1),
            )
            .await
            .context(ctx)?;
        Ok(rows.into_iter().next())
    }

    async fn ensure_references(
        &self,
        tx: &mut dyn StorageTx,
        references: &[Reference<'r>],
        ctx: &OperationContext,
    ) -> Result<(), AppError> {
        let mut violations = Vec::new();
        for reference in references {
            if reference.ids.is_empty() {
                continue;
            }
            let target = reference.target;
            let rows = tx
                .select(
                    &Select::from(self.registry.table_ref(target))
                        .columns([target.id_property.as_str()])
                        .filter(Condition::is_in(target.id_property.as_str(), reference.ids.clone())),
                )
                .await
                .context(ctx)?;
            let found: HashSet<String> = rows.iter().filter_map(|r| r.get(&target.id_property)).map(value_key).collect();
            let missing: Vec<String> = reference
                .ids
                .iter()
                .map(value_key)
                .filter(|k| !found.contains(k))
                .collect();
            if !missing.is_empty() {
                violations.push(FieldViolation::new(
                    &reference.alias,
                    format!("references missing {} {}", target.type_name, missing.join(", ")),
                ));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(violations))
        }
    }

    async fn check_unique(
        &self,
        tx: &mut dyn StorageTx,
        schema: &ResourceSchema,
        columns: &Row,
        exclude: Option<&Value>,
        ctx: &OperationContext,
    ) -> Result<(), AppError> {
        let mut violations = Vec::new();
        for (name, value) in columns {
            let unique = schema.column(name).map(|c| c.validation.is_unique()).unwrap_or(false);
            if !unique || value.is_null() {
                continue;
            }
            let mut select = Select::from(self.registry.table_ref(schema))
                .columns([schema.id_property.as_str()])
                .filter(Condition::eq(name.as_str(), value.clone()))
                .limit(1);
            if let Some(exclude) = exclude {
                select = select.filter(Condition::compare(
                    schema.id_property.as_str(),
                    CompareOp::Ne,
                    exclude.clone(),
                ));
            }
            if !tx.select(&select).await.context(ctx)?.is_empty() {
                violations.push(FieldViolation::new(name, "must be unique"));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(violations))
        }
    }

    async fn attach(
        &self,
        tx: &mut dyn StorageTx,
        plan: &RelationshipPlan<'r>,
        owner: &Value,
        ids: &[Value],
        ctx: &OperationContext,
    ) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        match &plan.strategy {
            JoinStrategy::Through {
                pivot,
                foreign_key,
                other_key,
                ..
            } => {
                let mut linked = self.pivot_targets(tx, pivot, foreign_key, other_key, owner, ctx).await?;
                for id in ids {
                    if !linked.insert(value_key(id)) {
                        continue;
                    }
                    let values: Row = [(foreign_key.clone(), owner.clone()), (other_key.clone(), id.clone())]
                        .into_iter()
                        .collect();
                    tx.insert(&Insert {
                        table: self.registry.table_ref(pivot),
                        values,
                        identity_column: pivot.id_property.clone(),
                    })
                    .await
                    .context(ctx)?;
                }
            }
            JoinStrategy::Direct {
                target, foreign_key, ..
            } => {
                tx.update(&Update {
                    table: self.registry.table_ref(target),
                    set: [(foreign_key.clone(), owner.clone())].into_iter().collect(),
                    filter: Condition::is_in(target.id_property.as_str(), ids.to_vec()),
                })
                .await
                .context(ctx)?;
            }
            JoinStrategy::Via {
                target,
                type_field,
                id_field,
            } => {
                tx.update(&Update {
                    table: self.registry.table_ref(target),
                    set: [
                        (type_field.clone(), Value::String(plan.owner.type_name.clone())),
                        (id_field.clone(), owner.clone()),
                    ]
                    .into_iter()
                    .collect(),
                    filter: Condition::is_in(target.id_property.as_str(), ids.to_vec()),
                })
                .await
                .context(ctx)?;
            }
            JoinStrategy::BelongsTo { .. } | JoinStrategy::Polymorphic { .. } => {
                return Err(AppError::BadRequest(format!("'{}' is a to-one relationship", plan.alias)));
            }
        }
        Ok(())
    }

    async fn detach(
        &self,
        tx: &mut dyn StorageTx,
        plan: &RelationshipPlan<'r>,
        owner: &Value,
        ids: &[Value],
        ctx: &OperationContext,
    ) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        match &plan.strategy {
            JoinStrategy::Through {
                pivot,
                foreign_key,
                other_key,
                ..
            } => {
                let removed = tx
                    .delete(&Delete {
                        table: self.registry.table_ref(pivot),
                        filter: Condition::all(vec![
                            Condition::eq(foreign_key.as_str(), owner.clone()),
                            Condition::is_in(other_key.as_str(), ids.to_vec()),
                        ]),
                    })
                    .await
                    .context(ctx)?;
                tracing::debug!(pivot = %pivot.type_name, removed = removed, "pivot rows removed");
            }
            JoinStrategy::Direct {
                target, foreign_key, ..
            } => {
                if !target.is_nullable(foreign_key) {
                    return Err(AppError::validation(
                        &plan.alias,
                        format!("{}.{} is not nullable; children cannot be detached", target.type_name, foreign_key),
                    ));
                }
                tx.update(&Update {
                    table: self.registry.table_ref(target),
                    set: [(foreign_key.clone(), Value::Null)].into_iter().collect(),
                    filter: Condition::all(vec![
                        Condition::eq(foreign_key.as_str(), owner.clone()),
                        Condition::is_in(target.id_property.as_str(), ids.to_vec()),
                    ]),
                })
                .await
                .context(ctx)?;
            }
            JoinStrategy::Via {
                target,
                type_field,
                id_field,
            } => {
                tx.update(&Update {
                    table: self.registry.table_ref(target),
                    set: [(type_field.clone(), Value::Null), (id_field.clone(), Value::Null)]
                        .into_iter()
                        .collect(),
                    filter: Condition::all(vec![
                        Condition::eq(type_field.as_str(), Value::String(plan.owner.type_name.clone())),
                        Condition::eq(id_field.as_str(), owner.clone()),
                        Condition::is_in(target.id_property.as_str(), ids.to_vec()),
                    ]),
                })
                .await
                .context(ctx)?;
            }
            JoinStrategy::BelongsTo { .. } | JoinStrategy::Polymorphic { .. } => {
                return Err(AppError::BadRequest(format!("'{}' is a to-one relationship", plan.alias)));
            }
        }
        Ok(())
    }

    /// Full replace. Many-to-many deletes every pivot of the owner and inserts the new set,
    /// so extra pivot attributes do not survive.
    async fn replace(
        &self,
        tx: &mut dyn StorageTx,
        plan: &RelationshipPlan<'r>,
        owner: &Value,
        ids: &[Value],
        ctx: &OperationContext,
    ) -> Result<(), AppError> {
        match &plan.strategy {
            JoinStrategy::Through { pivot, foreign_key, .. } => {
                tx.delete(&Delete {
                    table: self.registry.table_ref(pivot),
                    filter: Condition::eq(foreign_key.as_str(), owner.clone()),
                })
                .await
                .context(ctx)?;
            }
            JoinStrategy::Direct {
                target, foreign_key, ..
            } => {
                let current = self
                    .current_members(tx, target, Condition::eq(foreign_key.as_str(), owner.clone()), ctx)
                    .await?;
                let stale = without(current, ids);
                self.detach(tx, plan, owner, &stale, ctx).await?;
            }
            JoinStrategy::Via {
                target,
                type_field,
                id_field,
            } => {
                let filter = Condition::all(vec![
                    Condition::eq(type_field.as_str(), Value::String(plan.owner.type_name.clone())),
                    Condition::eq(id_field.as_str(), owner.clone()),
                ]);
                let current = self.current_members(tx, target, filter, ctx).await?;
                let stale = without(current, ids);
                self.detach(tx, plan, owner, &stale, ctx).await?;
            }
            JoinStrategy::BelongsTo { .. } | JoinStrategy::Polymorphic { .. } => {
                return Err(AppError::BadRequest(format!("'{}' is a to-one relationship", plan.alias)));
            }
        }
        self.attach(tx, plan, owner, ids, ctx).await
    }

    async fn current_members(
        &self,
        tx: &mut dyn StorageTx,
        target: &ResourceSchema,
        filter: Condition,
        ctx: &OperationContext,
    ) -> Result<Vec<Value>, AppError> {
        let rows = tx
            .select(
                &Select::from(self.registry.table_ref(target))
                    .columns([target.id_property.as_str()])
                    .filter(filter),
            )
            .await
            .context(ctx)?;
        Ok(rows.into_iter().filter_map(|mut r| r.remove(&target.id_property)).collect())
    }

    async fn pivot_targets(
        &self,
        tx: &mut dyn StorageTx,
        pivot: &ResourceSchema,
        foreign_key: &str,
        other_key: &str,
        owner: &Value,
        ctx: &OperationContext,
    ) -> Result<HashSet<String>, AppError> {
        let rows = tx
            .select(
                &Select::from(self.registry.table_ref(pivot))
                    .columns([other_key])
                    .filter(Condition::eq(foreign_key, owner.clone())),
            )
            .await
            .context(ctx)?;
        Ok(rows.iter().filter_map(|r| r.get(other_key)).map(value_key).collect())
    }
}

/// Polymorphic type/id columns are both set or both null, and the type is an allowed one.
fn check_polymorphic_pairs(schema: &ResourceSchema, row: &Row) -> Result<(), AppError> {
    let mut violations = Vec::new();
    for (alias, p) in schema.polymorphic_relations() {
        let type_name = row.get(&p.type_field).filter(|v| !v.is_null());
        let id = row.get(&p.id_field).filter(|v| !v.is_null());
        match (type_name, id) {
            (Some(t), Some(_)) => {
                if !t.as_str().is_some_and(|t| p.allows(t)) {
                    violations.push(FieldViolation::new(
                        &p.type_field,
                        format!("is not an allowed type for '{}': {}", alias, t),
                    ));
                }
            }
            (None, None) => {}
            _ => violations.push(FieldViolation::new(
                alias,
                format!("{} and {} must both be set or both be null", p.type_field, p.id_field),
            )),
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(violations))
    }
}

fn check_type(schema: &ResourceSchema, input: &ResourceInput) -> Result<(), AppError> {
    if input.type_name != schema.type_name {
        return Err(AppError::BadRequest(format!(
            "body type '{}' does not match '{}'",
            input.type_name, schema.type_name
        )));
    }
    Ok(())
}

fn same_value(stored: Option<&Value>, new: &Value) -> bool {
    match (stored, new) {
        (None, _) => false,
        (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Some(a), b) => a == b,
    }
}

fn without(current: Vec<Value>, keep: &[Value]) -> Vec<Value> {
    let keep: HashSet<String> = keep.iter().map(value_key).collect();
    current.into_iter().filter(|v| !keep.contains(&value_key(v))).collect()
}

/// Commits on success, rolls back on failure. The original error wins over a failed rollback.
async fn finish<T>(tx: Box<dyn StorageTx>, result: Result<T, AppError>, ctx: &OperationContext) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            tx.commit().await.context(ctx)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(context = %ctx, error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}
