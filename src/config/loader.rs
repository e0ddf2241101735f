//! Load resource configs from JSON files or a database table and resolve them into a
//! finalized `SchemaRegistry`.

use crate::config::types::*;
use crate::config::validator::validate;
use crate::error::{AppError, ConfigError};
use crate::schema::{
    BelongsToDef, ColumnDef, ComputedDef, FieldDefinition, HasRelation, PolymorphicRelation, RelationshipDefinition,
    ResourceSchema, SchemaRegistry, SearchField, ViaRelation, VirtualDef,
};
use crate::transform::{ComputeFn, Transform};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Named getters/setters and compute functions that configs refer to.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Transform>,
    computes: HashMap<String, ComputeFn>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        TransformRegistry::default()
    }

    pub fn with_transform(mut self, name: impl Into<String>, transform: Transform) -> Self {
        self.transforms.insert(name.into(), transform);
        self
    }

    pub fn with_compute(mut self, name: impl Into<String>, compute: ComputeFn) -> Self {
        self.computes.insert(name.into(), compute);
        self
    }

    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    pub fn has_compute(&self, name: &str) -> bool {
        self.computes.contains_key(name)
    }

    fn transform(&self, name: &str) -> Result<Transform, ConfigError> {
        self.transforms
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "transform",
                id: name.to_string(),
            })
    }

    fn compute(&self, name: &str) -> Result<ComputeFn, ConfigError> {
        self.computes
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "compute function",
                id: name.to_string(),
            })
    }

    fn optional(&self, name: Option<&String>) -> Result<Option<Transform>, ConfigError> {
        name.map(|n| self.transform(n)).transpose()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut transforms: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        let mut computes: Vec<&str> = self.computes.keys().map(String::as_str).collect();
        transforms.sort_unstable();
        computes.sort_unstable();
        f.debug_struct("TransformRegistry")
            .field("transforms", &transforms)
            .field("computes", &computes)
            .finish()
    }
}

/// Builds one schema from its config. Cross-resource checks happen at finalize.
pub fn build_schema(config: &ResourceConfig, transforms: &TransformRegistry) -> Result<ResourceSchema, ConfigError> {
    let mut builder = ResourceSchema::builder(&config.type_name);
    if let Some(table) = &config.table {
        builder = builder.table(table);
    }
    if let Some(identity) = &config.identity {
        builder = builder.identity(identity);
    }

    for field in &config.fields {
        let definition = match &field.kind {
            FieldKindConfig::Column {
                ty,
                nullable,
                validation,
                getter,
                setter,
                run_after,
                visibility,
            } => {
                let mut column = ColumnDef::new(*ty).validation(validation.clone());
                column.nullable = *nullable && !validation.is_required();
                column.getter = transforms.optional(getter.as_ref())?;
                column.setter = transforms.optional(setter.as_ref())?;
                column.run_after = run_after.clone();
                column.visibility = *visibility;
                FieldDefinition::Column(column)
            }
            FieldKindConfig::BelongsTo { target, alias, nullable } => FieldDefinition::BelongsTo(BelongsToDef {
                target: target.clone(),
                alias: alias.clone(),
                nullable: *nullable,
            }),
            FieldKindConfig::Computed {
                dependencies,
                compute,
                visibility,
            } => FieldDefinition::Computed(ComputedDef {
                dependencies: dependencies.clone(),
                compute: transforms.compute(compute)?,
                visibility: *visibility,
            }),
            FieldKindConfig::Virtual {
                ty,
                validation,
                setter,
                run_after,
            } => {
                let mut def = VirtualDef::new(*ty).validation(validation.clone());
                def.setter = transforms.optional(setter.as_ref())?;
                def.run_after = run_after.clone();
                FieldDefinition::Virtual(def)
            }
        };
        builder = builder.field(&field.name, definition);
    }

    for relationship in &config.relationships {
        let definition = match &relationship.kind {
            RelationshipKindConfig::HasMany {
                target,
                foreign_key,
                through,
                other_key,
            } => RelationshipDefinition::HasMany(has_relation(target, foreign_key, through, other_key)),
            RelationshipKindConfig::HasOne {
                target,
                foreign_key,
                through,
                other_key,
            } => RelationshipDefinition::HasOne(has_relation(target, foreign_key, through, other_key)),
            RelationshipKindConfig::Polymorphic {
                targets,
                type_field,
                id_field,
            } => RelationshipDefinition::BelongsToPolymorphic(PolymorphicRelation::new(
                targets.iter().cloned(),
                type_field,
                id_field,
            )),
            RelationshipKindConfig::HasManyVia { target, via } => RelationshipDefinition::HasManyVia(ViaRelation {
                target: target.clone(),
                via: via.clone(),
            }),
        };
        builder = builder.relationship(&relationship.alias, definition);
    }

    for search in &config.search {
        builder = builder.search(match &search.target {
            SearchTargetConfig::Columns { columns } => SearchField::columns(&search.name, columns.iter().cloned()),
            SearchTargetConfig::Polymorphic { relationship, columns } => {
                SearchField::polymorphic(&search.name, relationship, columns.clone())
            }
        });
    }

    Ok(builder.sortable(config.sortable.iter().cloned()).build())
}

fn has_relation(
    target: &str,
    foreign_key: &Option<String>,
    through: &Option<String>,
    other_key: &Option<String>,
) -> HasRelation {
    HasRelation {
        target: target.to_string(),
        foreign_key: foreign_key.clone(),
        through: through.clone(),
        other_key: other_key.clone(),
    }
}

/// Validates, builds and registers every config, then finalizes the registry.
pub fn resolve(configs: &[ResourceConfig], transforms: &TransformRegistry) -> Result<SchemaRegistry, AppError> {
    validate(configs, transforms)?;
    let mut registry = SchemaRegistry::new();
    for config in configs {
        registry.register(build_schema(config, transforms)?)?;
    }
    registry.finalize()?;
    Ok(registry)
}

/// Reads every `*.json` file of `dir` in file-name order. A file holds one resource config
/// or an array of them.
pub async fn load_from_dir(dir: impl AsRef<Path>) -> Result<Vec<ResourceConfig>, ConfigError> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", dir.display(), e)))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", dir.display(), e)))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();

    let mut out = Vec::new();
    for path in files {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let file: ConfigFile =
            serde_json::from_str(&text).map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let resources = file.into_resources();
        tracing::debug!(file = %path.display(), resources = resources.len(), "loaded resource config");
        out.extend(resources);
    }
    Ok(out)
}

/// Loads configs stored as JSON payloads in `table` (columns `id`, `payload`).
pub async fn load_from_pool(pool: &PgPool, table: &str) -> Result<Vec<ResourceConfig>, ConfigError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return Err(ConfigError::InvalidSetting {
            name: "config table",
            reason: format!("'{}' is not a plain table name", table),
        });
    }
    let sql = format!("SELECT payload FROM {} ORDER BY id", table);
    tracing::debug!(sql = %sql, "query");
    let rows = sqlx::query_scalar::<_, serde_json::Value>(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let file: ConfigFile = serde_json::from_value(row).map_err(|e| ConfigError::Load(e.to_string()))?;
        out.extend(file.into_resources());
    }
    Ok(out)
}
