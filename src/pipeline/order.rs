//! Topological ordering of field transforms over `run_after` declarations.

use crate::error::AppError;
use crate::schema::{FieldDefinition, ResourceSchema};
use std::collections::HashMap;

/// Which transforms are being sequenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// Setters: columns, foreign keys and virtual fields.
    Write,
    /// Getters: columns only.
    Read,
}

impl Pass {
    fn participates(&self, def: &FieldDefinition) -> bool {
        match self {
            Pass::Write => !matches!(def, FieldDefinition::Computed(_)),
            Pass::Read => matches!(def, FieldDefinition::Column(_)),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Field names in execution order. Fields without constraints keep declaration order;
/// a field always comes after every field it names in `run_after`. Cycles fail with
/// `CyclicDependencyError` listing the cycle.
pub fn execution_order(schema: &ResourceSchema, pass: Pass) -> Result<Vec<&str>, AppError> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut order = Vec::new();
    let mut stack = Vec::new();
    for field in &schema.fields {
        if pass.participates(&field.definition) {
            visit(schema, pass, field.name.as_str(), &mut marks, &mut stack, &mut order)?;
        }
    }
    Ok(order)
}

fn visit<'a>(
    schema: &'a ResourceSchema,
    pass: Pass,
    name: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    order: &mut Vec<&'a str>,
) -> Result<(), AppError> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| *n == name).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(name.to_string());
            return Err(AppError::CyclicDependency {
                resource: schema.type_name.clone(),
                cycle,
            });
        }
        None => {}
    }
    let Some(def) = schema.field(name) else {
        return Err(AppError::UnknownField {
            resource: schema.type_name.clone(),
            field: name.to_string(),
        });
    };
    marks.insert(name, Mark::Visiting);
    stack.push(name);
    for dep in def.run_after() {
        let Some(dep_def) = schema.field(dep) else {
            return Err(AppError::UnknownField {
                resource: schema.type_name.clone(),
                field: dep.clone(),
            });
        };
        if pass.participates(dep_def) {
            visit(schema, pass, dep.as_str(), marks, stack, order)?;
        }
    }
    stack.pop();
    marks.insert(name, Mark::Done);
    order.push(name);
    Ok(())
}
