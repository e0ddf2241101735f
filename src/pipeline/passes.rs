//! Write pass (setters) and read pass (getters + computed fields).

use crate::error::AppError;
use crate::pipeline::columns::ColumnPlan;
use crate::pipeline::order::{execution_order, Pass};
use crate::schema::{FieldDefinition, ResourceSchema, Visibility};
use serde_json::{Map, Value};

/// Runs setters in dependency order and returns the column values to persist.
///
/// Each setter receives the raw input value of its field and the attribute map in which
/// every field earlier in the order already holds its transformed value. Virtual fields
/// take part in ordering and are dropped from the result. The order is computed before any
/// setter runs, so a `run_after` cycle fails without side effects.
pub async fn write_pass(schema: &ResourceSchema, input: &Map<String, Value>) -> Result<Map<String, Value>, AppError> {
    let order = execution_order(schema, Pass::Write)?;
    let mut attributes = input.clone();
    for name in order {
        let Some(raw) = input.get(name) else { continue };
        let Some(setter) = schema.field(name).and_then(FieldDefinition::setter) else {
            continue;
        };
        let value = setter
            .apply(raw.clone(), &attributes)
            .await
            .map_err(|source| AppError::Setter {
                field: name.to_string(),
                source,
            })?;
        attributes.insert(name.to_string(), value);
    }
    attributes.retain(|name, _| schema.is_stored(name));
    Ok(attributes)
}

/// Turns a fetched row into output attributes.
///
/// Getters run in dependency order, each seeing earlier getter outputs. Computed fields in
/// the output allowlist are then evaluated from the post-getter values when all their
/// dependencies were fetched. Only allowlisted names survive, `Hidden` fields never do and
/// `NormallyHidden` ones only when named explicitly.
pub async fn read_pass(
    schema: &ResourceSchema,
    row: &Map<String, Value>,
    plan: &ColumnPlan,
) -> Result<Map<String, Value>, AppError> {
    let order = execution_order(schema, Pass::Read)?;
    let mut attributes = row.clone();
    for name in order {
        let Some(current) = attributes.get(name).cloned() else { continue };
        let Some(getter) = schema.field(name).and_then(FieldDefinition::getter) else {
            continue;
        };
        let value = getter
            .apply(current, &attributes)
            .await
            .map_err(|source| AppError::Getter {
                field: name.to_string(),
                source,
            })?;
        attributes.insert(name.to_string(), value);
    }

    for field in &schema.fields {
        let FieldDefinition::Computed(computed) = &field.definition else { continue };
        if !plan.output.contains(&field.name) {
            continue;
        }
        if !computed.dependencies.iter().all(|d| attributes.contains_key(d)) {
            continue;
        }
        let value = computed.compute.call(&attributes).map_err(|source| AppError::Getter {
            field: field.name.clone(),
            source,
        })?;
        attributes.insert(field.name.clone(), value);
    }

    let mut out = Map::new();
    for field in &schema.fields {
        let name = field.name.as_str();
        if !plan.output.contains(name) || plan.hidden_dependencies.contains(name) {
            continue;
        }
        let visible = match field.definition.visibility() {
            Visibility::Visible => true,
            Visibility::NormallyHidden => plan.is_requested(name),
            Visibility::Hidden => false,
        };
        if !visible {
            continue;
        }
        if let Some(v) = attributes.remove(name) {
            out.insert(name.to_string(), v);
        }
    }
    Ok(out)
}
