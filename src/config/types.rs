//! Declarative resource configuration as read from JSON files.
//!
//! One `ResourceConfig` describes one resource type. Transforms and compute functions are
//! referenced by name and bound through a `TransformRegistry` when the config is resolved.

use crate::schema::{SemanticType, ValidationRule, Visibility};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    /// Physical table; defaults to the type name.
    #[serde(default)]
    pub table: Option<String>,
    /// Identity property; defaults to `id`.
    #[serde(default)]
    pub identity: Option<String>,
    /// Declaration order is kept.
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
    #[serde(default)]
    pub search: Vec<SearchConfig>,
    #[serde(default)]
    pub sortable: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKindConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKindConfig {
    Column {
        #[serde(rename = "type")]
        ty: SemanticType,
        #[serde(default = "default_true")]
        nullable: bool,
        #[serde(default)]
        validation: ValidationRule,
        #[serde(default)]
        getter: Option<String>,
        #[serde(default)]
        setter: Option<String>,
        #[serde(default)]
        run_after: Vec<String>,
        #[serde(default)]
        visibility: Visibility,
    },
    BelongsTo {
        target: String,
        alias: String,
        #[serde(default = "default_true")]
        nullable: bool,
    },
    Computed {
        dependencies: Vec<String>,
        compute: String,
        #[serde(default)]
        visibility: Visibility,
    },
    Virtual {
        #[serde(rename = "type")]
        ty: SemanticType,
        #[serde(default)]
        validation: ValidationRule,
        #[serde(default)]
        setter: Option<String>,
        #[serde(default)]
        run_after: Vec<String>,
    },
}

impl FieldKindConfig {
    /// Transform names this field refers to.
    pub fn transform_names(&self) -> Vec<&str> {
        match self {
            FieldKindConfig::Column { getter, setter, .. } => {
                getter.iter().chain(setter.iter()).map(String::as_str).collect()
            }
            FieldKindConfig::Virtual { setter, .. } => setter.iter().map(String::as_str).collect(),
            FieldKindConfig::BelongsTo { .. } | FieldKindConfig::Computed { .. } => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub alias: String,
    #[serde(flatten)]
    pub kind: RelationshipKindConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationshipKindConfig {
    HasMany {
        target: String,
        #[serde(default)]
        foreign_key: Option<String>,
        #[serde(default)]
        through: Option<String>,
        #[serde(default)]
        other_key: Option<String>,
    },
    HasOne {
        target: String,
        #[serde(default)]
        foreign_key: Option<String>,
        #[serde(default)]
        through: Option<String>,
        #[serde(default)]
        other_key: Option<String>,
    },
    Polymorphic {
        targets: Vec<String>,
        type_field: String,
        id_field: String,
    },
    HasManyVia {
        target: String,
        via: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub name: String,
    #[serde(flatten)]
    pub target: SearchTargetConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchTargetConfig {
    /// `{"relationship": "subject", "columns": {"articles": "title"}}`
    Polymorphic {
        relationship: String,
        columns: BTreeMap<String, String>,
    },
    /// `{"columns": ["title", "body"]}`
    Columns { columns: Vec<String> },
}

/// A config file holds one resource or a list of them.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ConfigFile {
    Many(Vec<ResourceConfig>),
    One(Box<ResourceConfig>),
}

impl ConfigFile {
    pub fn into_resources(self) -> Vec<ResourceConfig> {
        match self {
            ConfigFile::Many(all) => all,
            ConfigFile::One(one) => vec![*one],
        }
    }
}
