//! Config validation: naming, duplicates and transform references.
//! References between resources are left to `SchemaRegistry::finalize`.

use crate::config::loader::TransformRegistry;
use crate::config::types::{FieldKindConfig, ResourceConfig};
use crate::error::ConfigError;
use std::collections::HashSet;

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn validate(configs: &[ResourceConfig], transforms: &TransformRegistry) -> Result<(), ConfigError> {
    let mut types = HashSet::new();
    for config in configs {
        if !valid_name(&config.type_name) {
            return Err(ConfigError::Validation(format!(
                "invalid resource type name '{}'",
                config.type_name
            )));
        }
        if !types.insert(config.type_name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "resource type '{}' declared twice",
                config.type_name
            )));
        }

        let mut names = HashSet::new();
        for field in &config.fields {
            if !valid_name(&field.name) {
                return Err(ConfigError::Validation(format!(
                    "{}: invalid field name '{}'",
                    config.type_name, field.name
                )));
            }
            if !names.insert(field.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "{}: field '{}' declared twice",
                    config.type_name, field.name
                )));
            }
            for name in field.kind.transform_names() {
                if !transforms.has_transform(name) {
                    return Err(ConfigError::MissingReference {
                        kind: "transform",
                        id: name.to_string(),
                    });
                }
            }
            if let FieldKindConfig::Computed { compute, .. } = &field.kind {
                if !transforms.has_compute(compute) {
                    return Err(ConfigError::MissingReference {
                        kind: "compute function",
                        id: compute.clone(),
                    });
                }
            }
        }

        let mut aliases: HashSet<&str> = config
            .fields
            .iter()
            .filter_map(|f| match &f.kind {
                FieldKindConfig::BelongsTo { alias, .. } => Some(alias.as_str()),
                _ => None,
            })
            .collect();
        for relationship in &config.relationships {
            if !aliases.insert(relationship.alias.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "{}: relationship alias '{}' declared twice",
                    config.type_name, relationship.alias
                )));
            }
        }

        let mut search = HashSet::new();
        for field in &config.search {
            if !search.insert(field.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "{}: search field '{}' declared twice",
                    config.type_name, field.name
                )));
            }
        }
    }
    Ok(())
}
