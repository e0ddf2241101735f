//! Filter compilation: search fields to storage conditions, with value coercion.

use crate::error::AppError;
use crate::query::params::{FilterOp, FilterParam};
use crate::schema::{RelationshipDefinition, ResourceSchema, SchemaRegistry, SearchTarget, SemanticType};
use crate::store::{ColumnRef, CompareOp, Condition, Join, JoinCondition};
use serde_json::Value;

/// Converts a query-string value into the column's semantic type.
pub fn coerce(field: &str, raw: &str, ty: Option<SemanticType>) -> Result<Value, AppError> {
    let invalid = |expected: &str| AppError::validation(field, format!("'{}' is not a valid {}", raw, expected));
    match ty {
        None | Some(SemanticType::String) => Ok(Value::String(raw.to_string())),
        Some(SemanticType::Number) => {
            if let Ok(i) = raw.parse::<i64>() {
                return Ok(Value::from(i));
            }
            raw.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid("number"))
        }
        Some(SemanticType::Boolean) => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid("boolean")),
        },
        Some(SemanticType::Date) => chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(|_| Value::String(raw.to_string()))
            .map_err(|_| invalid("date")),
        Some(SemanticType::Datetime) => chrono::DateTime::parse_from_rfc3339(raw)
            .map(|_| Value::String(raw.to_string()))
            .map_err(|_| invalid("datetime")),
        Some(SemanticType::Object) => Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))),
    }
}

/// Condition for one filter on one column.
fn column_condition(
    field: &str,
    column: ColumnRef,
    ty: Option<SemanticType>,
    op: FilterOp,
    raw: &str,
) -> Result<Condition, AppError> {
    let compare = |cmp: CompareOp| -> Result<Condition, AppError> {
        Ok(Condition::Compare {
            column: column.clone(),
            op: cmp,
            value: coerce(field, raw, ty)?,
        })
    };
    match op {
        FilterOp::Eq => compare(CompareOp::Eq),
        FilterOp::Ne => compare(CompareOp::Ne),
        FilterOp::Lt => compare(CompareOp::Lt),
        FilterOp::Lte => compare(CompareOp::Lte),
        FilterOp::Gt => compare(CompareOp::Gt),
        FilterOp::Gte => compare(CompareOp::Gte),
        FilterOp::Like => Ok(Condition::Compare {
            column,
            op: CompareOp::Contains,
            value: Value::String(raw.to_string()),
        }),
        FilterOp::In => {
            let values = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| coerce(field, s, ty))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Condition::In { column, values })
        }
        FilterOp::Null => match raw {
            "true" | "1" => Ok(Condition::IsNull { column, negated: false }),
            "false" | "0" => Ok(Condition::IsNull { column, negated: true }),
            _ => Err(AppError::validation(field, "null filter expects true or false")),
        },
    }
}

/// Alias of the join used to search `type_name` through polymorphic `relationship`.
pub fn search_alias(relationship: &str, type_name: &str) -> String {
    format!("{}__{}", relationship, type_name)
}

/// Compiled filters: one condition per filter parameter and the joins they need.
#[derive(Debug, Default)]
pub struct CompiledFilters {
    pub conditions: Vec<Condition>,
    pub joins: Vec<Join>,
}

/// ORs the columns a value could be coerced for. Fails only when no column accepts it.
fn any_coercible(parts: Vec<Result<Condition, AppError>>) -> Result<Condition, AppError> {
    let mut conditions = Vec::with_capacity(parts.len());
    let mut first_error = None;
    for part in parts {
        match part {
            Ok(condition) => conditions.push(condition),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) if conditions.is_empty() => Err(err),
        _ => Ok(Condition::any(conditions)),
    }
}

/// Validates filters against the search schema and compiles them.
pub fn compile_filters(
    registry: &SchemaRegistry,
    schema: &ResourceSchema,
    filters: &[FilterParam],
) -> Result<CompiledFilters, AppError> {
    let search = schema.search_fields();
    let mut out = CompiledFilters::default();
    for filter in filters {
        let Some(field) = search.iter().find(|s| s.name == filter.field) else {
            return Err(AppError::UnknownField {
                resource: schema.type_name.clone(),
                field: filter.field.clone(),
            });
        };
        match &field.target {
            SearchTarget::Columns(columns) => {
                let parts = columns
                    .iter()
                    .map(|c| {
                        column_condition(
                            &filter.field,
                            ColumnRef::new(c.as_str()),
                            registry.column_type(schema, c),
                            filter.op,
                            &filter.value,
                        )
                    })
                    .collect();
                out.conditions.push(any_coercible(parts)?);
            }
            SearchTarget::Polymorphic { relationship, columns } => {
                let Some(RelationshipDefinition::BelongsToPolymorphic(p)) = schema.relationship(relationship) else {
                    return Err(AppError::invalid_schema(
                        &schema.type_name,
                        format!("search field '{}' needs polymorphic relationship '{}'", field.name, relationship),
                    ));
                };
                let mut parts = Vec::new();
                for (type_name, column) in columns {
                    let target = registry.resolve(type_name)?;
                    let alias = search_alias(relationship, type_name);
                    if !out.joins.iter().any(|j| j.alias == alias) {
                        out.joins.push(Join {
                            alias: alias.clone(),
                            table: registry.table_ref(target),
                            on: vec![
                                JoinCondition::Literal {
                                    column: ColumnRef::new(p.type_field.as_str()),
                                    value: Value::String(type_name.clone()),
                                },
                                JoinCondition::Columns {
                                    left: ColumnRef::new(p.id_field.as_str()),
                                    right: ColumnRef::on(alias.as_str(), target.id_property.as_str()),
                                },
                            ],
                        });
                    }
                    parts.push(column_condition(
                        &filter.field,
                        ColumnRef::on(alias.as_str(), column.as_str()),
                        registry.column_type(target, column),
                        filter.op,
                        &filter.value,
                    ));
                }
                out.conditions.push(any_coercible(parts)?);
            }
        }
    }
    Ok(out)
}
