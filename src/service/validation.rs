//! Request validation from schema rules.

use crate::error::{AppError, FieldViolation};
use crate::schema::{FieldDefinition, ResourceSchema, SemanticType, ValidationRule};
use regex::Regex;
use serde_json::{Map, Value};

pub struct RequestValidator;

impl RequestValidator {
    /// Validates write input against the schema. With `full` (create) every required or
    /// non-nullable field must be present; otherwise only the fields present are checked. All violations
    /// are reported together.
    pub fn validate(schema: &ResourceSchema, attributes: &Map<String, Value>, full: bool) -> Result<(), AppError> {
        let mut violations = Vec::new();
        for name in attributes.keys() {
            match schema.field(name) {
                None => {
                    return Err(AppError::UnknownField {
                        resource: schema.type_name.clone(),
                        field: name.clone(),
                    })
                }
                Some(FieldDefinition::Computed(_)) => {
                    violations.push(FieldViolation::new(name, "is computed and cannot be written"));
                }
                Some(_) if *name == schema.id_property => {
                    violations.push(FieldViolation::new(name, "is the identity and cannot be written as an attribute"));
                }
                Some(_) => {}
            }
        }

        for field in &schema.fields {
            if field.name == schema.id_property {
                continue;
            }
            let (rule, ty, nullable) = match &field.definition {
                FieldDefinition::Column(c) => (Some(&c.validation), Some(c.ty), c.nullable),
                FieldDefinition::BelongsTo(b) => (None, None, b.nullable),
                FieldDefinition::Virtual(v) => (Some(&v.validation), Some(v.ty), true),
                FieldDefinition::Computed(_) => continue,
            };
            let name = field.name.as_str();
            match attributes.get(name) {
                None => {
                    if full && (rule.map(ValidationRule::is_required).unwrap_or(false) || !nullable) {
                        violations.push(FieldViolation::new(name, "is required"));
                    }
                }
                Some(Value::Null) => {
                    if rule.map(ValidationRule::is_required).unwrap_or(false) {
                        violations.push(FieldViolation::new(name, "is required"));
                    } else if !nullable {
                        violations.push(FieldViolation::new(name, "must not be null"));
                    }
                }
                Some(value) => {
                    if let Some(ty) = ty {
                        if let Some(message) = type_mismatch(value, ty) {
                            violations.push(FieldViolation::new(name, message));
                            continue;
                        }
                    }
                    if let Some(rule) = rule {
                        validate_field(name, value, rule, &mut violations);
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(violations))
        }
    }
}

fn type_mismatch(v: &Value, ty: SemanticType) -> Option<String> {
    let ok = match ty {
        SemanticType::String => v.is_string(),
        SemanticType::Number => v.is_number(),
        SemanticType::Boolean => v.is_boolean(),
        SemanticType::Date => v
            .as_str()
            .map(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
            .unwrap_or(false),
        SemanticType::Datetime => v
            .as_str()
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        SemanticType::Object => true,
    };
    (!ok).then(|| format!("must be a {}", ty.as_str()))
}

fn validate_field(col: &str, v: &Value, rule: &ValidationRule, out: &mut Vec<FieldViolation>) {
    if let Some(format) = &rule.format {
        if let Some(message) = format_violation(v, format) {
            out.push(FieldViolation::new(col, message));
        }
    }
    if let Some(s) = v.as_str() {
        let len = s.chars().count();
        if let Some(max) = rule.max_length {
            if len > max as usize {
                out.push(FieldViolation::new(col, format!("must be at most {} characters", max)));
            }
        }
        if let Some(min) = rule.min_length {
            if len < min as usize {
                out.push(FieldViolation::new(col, format!("must be at least {} characters", min)));
            }
        }
        if let Some(pattern) = &rule.pattern {
            match Regex::new(pattern) {
                Ok(re) if !re.is_match(s) => out.push(FieldViolation::new(col, "does not match required pattern")),
                Ok(_) => {}
                Err(_) => out.push(FieldViolation::new(col, "has an invalid pattern rule")),
            }
        }
    }
    if let Some(allowed) = &rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            out.push(FieldViolation::new(
                col,
                format!("must be one of: {:?}", allowed.iter().take(5).collect::<Vec<_>>()),
            ));
        }
    }
    if let Some(n) = v.as_f64() {
        if let Some(min) = rule.minimum {
            if n < min {
                out.push(FieldViolation::new(col, format!("must be at least {}", min)));
            }
        }
        if let Some(max) = rule.maximum {
            if n > max {
                out.push(FieldViolation::new(col, format!("must be at most {}", max)));
            }
        }
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn format_violation(v: &Value, format: &str) -> Option<&'static str> {
    let s = v.as_str()?;
    match format.to_lowercase().as_str() {
        "email" if !s.contains('@') || s.len() < 3 => Some("must be a valid email"),
        "uuid" if uuid::Uuid::parse_str(s).is_err() => Some("must be a valid UUID"),
        _ => None,
    }
}
