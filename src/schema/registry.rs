//! Process-scoped schema registry: append-only registration, explicit finalize.

use crate::error::AppError;
use crate::pipeline::order::{execution_order, Pass};
use crate::schema::types::*;
use crate::store::TableRef;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: Vec<ResourceSchema>,
    by_type: HashMap<String, usize>,
    finalized: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Registers a schema. Checks that only need this schema run here; references to other
    /// resources are checked by `finalize`.
    pub fn register(&mut self, schema: ResourceSchema) -> Result<(), AppError> {
        if self.by_type.contains_key(&schema.type_name) {
            return Err(AppError::DuplicateResource(schema.type_name.clone()));
        }
        check_local(&schema)?;
        tracing::debug!(resource = %schema.type_name, table = %schema.table, "registered resource");
        self.by_type.insert(schema.type_name.clone(), self.schemas.len());
        self.schemas.push(schema);
        self.finalized = false;
        Ok(())
    }

    /// Validates cross-resource references once every schema is known.
    pub fn finalize(&mut self) -> Result<(), AppError> {
        for schema in &self.schemas {
            self.check_references(schema)?;
        }
        self.finalized = true;
        tracing::info!(resources = self.schemas.len(), "schema registry finalized");
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn resolve(&self, type_name: &str) -> Result<&ResourceSchema, AppError> {
        self.by_type
            .get(type_name)
            .map(|&i| &self.schemas[i])
            .ok_or_else(|| AppError::UnknownResource(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.by_type.contains_key(type_name)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &ResourceSchema> {
        self.schemas.iter()
    }

    /// Type of a column, following belongsTo foreign keys to the target's identity.
    pub fn column_type(&self, schema: &ResourceSchema, column: &str) -> Option<SemanticType> {
        match schema.field(column)? {
            FieldDefinition::BelongsTo(b) => {
                let target = self.resolve(&b.target).ok()?;
                target.column_type(&target.id_property)
            }
            _ => schema.column_type(column),
        }
    }

    /// Physical table description with every stored column typed, foreign keys included.
    pub fn table_ref(&self, schema: &ResourceSchema) -> TableRef {
        let columns = schema
            .stored_columns()
            .into_iter()
            .map(|c| (c.to_string(), self.column_type(schema, c)))
            .collect();
        TableRef::new(schema.table.clone(), columns)
    }

    fn referenced(&self, resource: &str, name: &str) -> Result<&ResourceSchema, AppError> {
        self.resolve(name)
            .map_err(|_| AppError::invalid_schema(resource, format!("references unregistered resource '{}'", name)))
    }

    fn check_references(&self, schema: &ResourceSchema) -> Result<(), AppError> {
        let resource = schema.type_name.as_str();
        for (column, b) in schema.belongs_to_fields() {
            self.referenced(resource, &b.target).map_err(|_| {
                AppError::invalid_schema(
                    resource,
                    format!("belongsTo field '{}' targets unregistered resource '{}'", column, b.target),
                )
            })?;
        }

        let mut aliases = HashSet::new();
        for alias in schema.relationship_aliases() {
            if !aliases.insert(alias) {
                return Err(AppError::invalid_schema(resource, format!("duplicate relationship alias '{}'", alias)));
            }
        }

        for (alias, rel) in &schema.relationships {
            match rel {
                RelationshipDefinition::BelongsTo(r) => {
                    self.referenced(resource, &r.target)?;
                    if !schema.is_stored(&r.foreign_key) {
                        return Err(AppError::invalid_schema(
                            resource,
                            format!("relationship '{}' foreign key '{}' is not a column", alias, r.foreign_key),
                        ));
                    }
                }
                RelationshipDefinition::HasMany(r) | RelationshipDefinition::HasOne(r) => {
                    let related = self.referenced(resource, &r.target)?;
                    let fk = r.resolved_foreign_key(resource);
                    match &r.through {
                        Some(pivot_name) => {
                            let pivot = self.referenced(resource, pivot_name)?;
                            let ok = r.resolved_other_key();
                            for key in [&fk, &ok] {
                                if !pivot.is_stored(key) {
                                    return Err(AppError::invalid_schema(
                                        resource,
                                        format!(
                                            "relationship '{}' pivot '{}' has no column '{}'",
                                            alias, pivot_name, key
                                        ),
                                    ));
                                }
                            }
                        }
                        None => {
                            if !related.is_stored(&fk) {
                                return Err(AppError::invalid_schema(
                                    resource,
                                    format!("relationship '{}' target '{}' has no column '{}'", alias, r.target, fk),
                                ));
                            }
                        }
                    }
                }
                RelationshipDefinition::BelongsToPolymorphic(p) => {
                    if p.targets.is_empty() {
                        return Err(AppError::invalid_schema(
                            resource,
                            format!("polymorphic relationship '{}' allows no types", alias),
                        ));
                    }
                    for t in &p.targets {
                        self.referenced(resource, t)?;
                    }
                    for column in [&p.type_field, &p.id_field] {
                        if !schema.is_stored(column) {
                            return Err(AppError::invalid_schema(
                                resource,
                                format!("polymorphic relationship '{}' column '{}' is not declared", alias, column),
                            ));
                        }
                    }
                }
                RelationshipDefinition::HasManyVia(v) => {
                    let related = self.referenced(resource, &v.target)?;
                    match related.relationship(&v.via) {
                        Some(RelationshipDefinition::BelongsToPolymorphic(p)) if p.allows(resource) => {}
                        _ => {
                            return Err(AppError::invalid_schema(
                                resource,
                                format!(
                                    "relationship '{}' expects '{}' to have a polymorphic relationship '{}' allowing '{}'",
                                    alias, v.target, v.via, resource
                                ),
                            ))
                        }
                    }
                }
            }
        }

        for search in &schema.search {
            match &search.target {
                SearchTarget::Columns(columns) => {
                    for c in columns {
                        if !schema.is_stored(c) {
                            return Err(AppError::invalid_schema(
                                resource,
                                format!("search field '{}' names unknown column '{}'", search.name, c),
                            ));
                        }
                    }
                }
                SearchTarget::Polymorphic { relationship, columns } => {
                    let Some(RelationshipDefinition::BelongsToPolymorphic(p)) = schema.relationship(relationship) else {
                        return Err(AppError::invalid_schema(
                            resource,
                            format!("search field '{}' needs polymorphic relationship '{}'", search.name, relationship),
                        ));
                    };
                    for (type_name, column) in columns {
                        if !p.allows(type_name) || !self.referenced(resource, type_name)?.is_stored(column) {
                            return Err(AppError::invalid_schema(
                                resource,
                                format!("search field '{}' cannot search {}.{}", search.name, type_name, column),
                            ));
                        }
                    }
                }
            }
        }

        for field in &schema.sortable {
            if !schema.is_stored(field) {
                return Err(AppError::invalid_schema(resource, format!("sortable field '{}' is not a column", field)));
            }
        }
        Ok(())
    }
}

fn check_local(schema: &ResourceSchema) -> Result<(), AppError> {
    let resource = schema.type_name.as_str();
    let mut seen = HashSet::new();
    for f in &schema.fields {
        if !seen.insert(f.name.as_str()) {
            let reason = if f.name == schema.id_property {
                format!("identity property '{}' is declared by more than one field", f.name)
            } else {
                format!("field '{}' is declared twice", f.name)
            };
            return Err(AppError::invalid_schema(resource, reason));
        }
    }
    match schema.field(&schema.id_property) {
        Some(FieldDefinition::Column(_)) => {}
        _ => {
            return Err(AppError::invalid_schema(
                resource,
                format!("identity property '{}' must be a column", schema.id_property),
            ))
        }
    }
    for f in &schema.fields {
        if let FieldDefinition::Computed(c) = &f.definition {
            for dep in &c.dependencies {
                if !schema.is_stored(dep) {
                    return Err(AppError::invalid_schema(
                        resource,
                        format!("computed field '{}' depends on unknown column '{}'", f.name, dep),
                    ));
                }
            }
        }
        for dep in f.definition.run_after() {
            if !schema.has_field(dep) {
                return Err(AppError::invalid_schema(
                    resource,
                    format!("field '{}' runs after unknown field '{}'", f.name, dep),
                ));
            }
        }
    }
    execution_order(schema, Pass::Write)?;
    Ok(())
}
