//! Column planning: which columns to fetch for an output projection.

use crate::error::AppError;
use crate::schema::{FieldDefinition, ResourceSchema, Visibility};
use std::collections::HashSet;

/// Result of `plan_columns`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnPlan {
    /// Columns to select, in declaration order.
    pub columns: Vec<String>,
    /// Attribute names allowed in the output.
    pub output: HashSet<String>,
    /// Columns fetched only to feed computed fields or ordered getters.
    pub hidden_dependencies: HashSet<String>,
    /// Names the client asked for explicitly; `None` when no sparse fieldset was given.
    pub requested: Option<HashSet<String>>,
}

impl ColumnPlan {
    pub fn is_requested(&self, name: &str) -> bool {
        self.requested.as_ref().map(|r| r.contains(name)).unwrap_or(false)
    }
}

/// Plans the fetch for `schema` given an optional sparse fieldset. The identity column,
/// every belongsTo foreign key and every polymorphic type/id pair are always fetched.
pub fn plan_columns(schema: &ResourceSchema, requested: Option<&[String]>) -> Result<ColumnPlan, AppError> {
    let linkage: HashSet<&str> = schema.linkage_columns().into_iter().collect();
    let attribute_candidate =
        |name: &str| name != schema.id_property && !linkage.contains(name);

    let Some(requested) = requested else {
        let output = schema
            .fields
            .iter()
            .filter(|f| attribute_candidate(&f.name))
            .filter(|f| match &f.definition {
                FieldDefinition::Column(_) | FieldDefinition::Computed(_) => {
                    f.definition.visibility() == Visibility::Visible
                }
                _ => false,
            })
            .map(|f| f.name.clone())
            .collect();
        return Ok(ColumnPlan {
            columns: schema.stored_columns().into_iter().map(String::from).collect(),
            output,
            hidden_dependencies: HashSet::new(),
            requested: None,
        });
    };

    let aliases: HashSet<&str> = schema.relationship_aliases().into_iter().collect();
    let mut needed: HashSet<&str> = HashSet::new();
    let mut output = HashSet::new();
    needed.insert(schema.id_property.as_str());
    needed.extend(linkage.iter().copied());

    for name in requested {
        let name = name.as_str();
        if aliases.contains(name) {
            continue;
        }
        let Some(def) = schema.field(name) else {
            return Err(AppError::UnknownField {
                resource: schema.type_name.clone(),
                field: name.to_string(),
            });
        };
        match def {
            FieldDefinition::Column(_) => {
                if attribute_candidate(name) {
                    output.insert(name.to_string());
                }
                collect_stored_dependencies(schema, name, &mut needed);
            }
            FieldDefinition::Computed(c) => {
                output.insert(name.to_string());
                for dep in &c.dependencies {
                    collect_stored_dependencies(schema, dep, &mut needed);
                }
            }
            FieldDefinition::BelongsTo(_) | FieldDefinition::Virtual(_) => {}
        }
    }

    let columns: Vec<String> = schema
        .stored_columns()
        .into_iter()
        .filter(|c| needed.contains(c))
        .map(String::from)
        .collect();
    let hidden_dependencies = columns
        .iter()
        .filter(|c| attribute_candidate(c) && !output.contains(c.as_str()))
        .cloned()
        .collect();
    Ok(ColumnPlan {
        columns,
        output,
        hidden_dependencies,
        requested: Some(requested.iter().cloned().collect()),
    })
}

/// Adds `name` and, transitively, the stored fields its getter runs after.
fn collect_stored_dependencies<'a>(schema: &'a ResourceSchema, name: &'a str, needed: &mut HashSet<&'a str>) {
    let Some(def) = schema.field(name) else { return };
    if !def.is_stored() || !needed.insert(name) {
        return;
    }
    for dep in def.run_after() {
        collect_stored_dependencies(schema, dep, needed);
    }
}
