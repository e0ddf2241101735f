//! PostgreSQL DDL for registered schemas: one table per resource, identity column, typed
//! columns, unique constraints and foreign keys for belongsTo fields.
//! Order: sequences, tables, then foreign keys once every table exists.

use crate::schema::{FieldDefinition, ResourceSchema, SchemaRegistry, SemanticType};
use crate::sql::{pg_type, qualified_table, quoted};
use crate::store::StorageError;
use sqlx::PgPool;

/// Duplicate object (constraint or sequence already present).
const DUPLICATE_OBJECT: &str = "42710";

fn sequence_name(schema: &ResourceSchema) -> String {
    format!("{}_{}_seq", schema.table.replace('.', "_"), schema.id_property)
}

/// Numeric identities draw from a sequence; string identities default to a random uuid.
fn identity_default(schema: &ResourceSchema) -> Option<String> {
    match schema.column_type(&schema.id_property)? {
        SemanticType::Number => Some(format!("nextval('{}')", sequence_name(schema).replace('\'', "''"))),
        SemanticType::String => Some("gen_random_uuid()::text".into()),
        _ => None,
    }
}

pub fn create_table_sql(registry: &SchemaRegistry, schema: &ResourceSchema) -> String {
    let mut defs = Vec::new();
    for field in &schema.fields {
        if !field.definition.is_stored() {
            continue;
        }
        let ty = registry
            .column_type(schema, &field.name)
            .map(pg_type)
            .unwrap_or("text");
        let mut def = format!("{} {}", quoted(&field.name), ty);
        if field.name == schema.id_property {
            def.push_str(" PRIMARY KEY");
            if let Some(default) = identity_default(schema) {
                def.push_str(" DEFAULT ");
                def.push_str(&default);
            }
        } else {
            if !schema.is_nullable(&field.name) {
                def.push_str(" NOT NULL");
            }
            if let FieldDefinition::Column(c) = &field.definition {
                if c.validation.is_unique() {
                    def.push_str(" UNIQUE");
                }
            }
        }
        defs.push(def);
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        qualified_table(&schema.table),
        defs.join(",\n  ")
    )
}

pub fn foreign_key_sql(registry: &SchemaRegistry, schema: &ResourceSchema) -> Vec<String> {
    schema
        .belongs_to_fields()
        .filter_map(|(column, b)| {
            let target = registry.resolve(&b.target).ok()?;
            let on_delete = if b.nullable { "SET NULL" } else { "RESTRICT" };
            Some(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
                qualified_table(&schema.table),
                quoted(&format!("fk_{}_{}", schema.table.replace('.', "_"), column)),
                quoted(column),
                qualified_table(&target.table),
                quoted(&target.id_property),
                on_delete
            ))
        })
        .collect()
}

/// Every statement needed for `registry`, in execution order.
pub fn migration_sql(registry: &SchemaRegistry) -> Vec<String> {
    let mut out = Vec::new();
    for schema in registry.schemas() {
        if schema.column_type(&schema.id_property) == Some(SemanticType::Number) {
            out.push(format!("CREATE SEQUENCE IF NOT EXISTS {}", quoted(&sequence_name(schema))));
        }
    }
    out.extend(registry.schemas().map(|s| create_table_sql(registry, s)));
    for schema in registry.schemas() {
        out.extend(foreign_key_sql(registry, schema));
    }
    out
}

/// Applies `migration_sql`. Tables and sequences are created if missing; foreign keys that
/// already exist are skipped.
pub async fn apply_migrations(pool: &PgPool, registry: &SchemaRegistry) -> Result<(), StorageError> {
    for sql in migration_sql(registry) {
        tracing::debug!(sql = %sql, "migration");
        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(DUPLICATE_OBJECT) => {
                tracing::debug!(error = %e, "already applied");
            }
            Err(e) => return Err(e.into()),
        }
    }
    tracing::info!(resources = registry.schemas().count(), "migrations applied");
    Ok(())
}
