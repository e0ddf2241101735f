//! Relationship resolution: how each alias joins, and batched loading of related rows.

mod loader;

use crate::error::AppError;
use crate::schema::{RelationshipDefinition, ResourceSchema, SchemaRegistry};
use crate::store::Row;
use std::collections::HashMap;

/// Join strategy of one relationship, with every schema it touches resolved.
#[derive(Clone, Debug)]
pub enum JoinStrategy<'r> {
    /// Foreign key on the owner row.
    BelongsTo {
        target: &'r ResourceSchema,
        foreign_key: String,
    },
    /// Foreign key on the target rows.
    Direct {
        target: &'r ResourceSchema,
        foreign_key: String,
        single: bool,
    },
    /// Pivot resource carrying `foreign_key` (owner) and `other_key` (target).
    Through {
        target: &'r ResourceSchema,
        pivot: &'r ResourceSchema,
        foreign_key: String,
        other_key: String,
        single: bool,
    },
    /// Discriminator and id columns on the owner row.
    Polymorphic {
        targets: Vec<&'r ResourceSchema>,
        type_field: String,
        id_field: String,
    },
    /// Target rows whose polymorphic pair points at the owner.
    Via {
        target: &'r ResourceSchema,
        type_field: String,
        id_field: String,
    },
}

impl JoinStrategy<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            JoinStrategy::BelongsTo { .. } => "belongsTo",
            JoinStrategy::Direct { single: true, .. } => "hasOne",
            JoinStrategy::Direct { single: false, .. } => "hasMany",
            JoinStrategy::Through { .. } => "through",
            JoinStrategy::Polymorphic { .. } => "polymorphic",
            JoinStrategy::Via { .. } => "via",
        }
    }
}

/// One related record as loaded for a parent.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedChild {
    pub type_name: String,
    pub row: Row,
    /// Extra pivot attributes for many-to-many linkage, when the pivot has any.
    pub pivot: Option<Row>,
}

/// Columns to fetch per target type. Types without an entry fetch every column.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub columns: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct RelationshipPlan<'r> {
    pub alias: String,
    pub owner: &'r ResourceSchema,
    pub definition: RelationshipDefinition,
    pub strategy: JoinStrategy<'r>,
    registry: &'r SchemaRegistry,
}

impl<'r> RelationshipPlan<'r> {
    pub fn is_to_one(&self) -> bool {
        self.definition.is_to_one()
    }

    /// Resource types this relationship can yield.
    pub fn target_schemas(&self) -> Vec<&'r ResourceSchema> {
        match &self.strategy {
            JoinStrategy::BelongsTo { target, .. }
            | JoinStrategy::Direct { target, .. }
            | JoinStrategy::Through { target, .. }
            | JoinStrategy::Via { target, .. } => vec![*target],
            JoinStrategy::Polymorphic { targets, .. } => targets.clone(),
        }
    }
}

/// Resolves `alias` on `owner` into a plan.
pub fn resolve<'r>(
    registry: &'r SchemaRegistry,
    owner: &'r ResourceSchema,
    alias: &str,
) -> Result<RelationshipPlan<'r>, AppError> {
    let definition = owner.relationship(alias).ok_or_else(|| AppError::RelationshipNotFound {
        resource: owner.type_name.clone(),
        alias: alias.to_string(),
    })?;
    let strategy = match &definition {
        RelationshipDefinition::BelongsTo(r) => JoinStrategy::BelongsTo {
            target: registry.resolve(&r.target)?,
            foreign_key: r.foreign_key.clone(),
        },
        RelationshipDefinition::HasMany(r) | RelationshipDefinition::HasOne(r) => {
            let single = matches!(definition, RelationshipDefinition::HasOne(_));
            let target = registry.resolve(&r.target)?;
            let foreign_key = r.resolved_foreign_key(&owner.type_name);
            match &r.through {
                Some(pivot) => JoinStrategy::Through {
                    target,
                    pivot: registry.resolve(pivot)?,
                    foreign_key,
                    other_key: r.resolved_other_key(),
                    single,
                },
                None => JoinStrategy::Direct {
                    target,
                    foreign_key,
                    single,
                },
            }
        }
        RelationshipDefinition::BelongsToPolymorphic(p) => JoinStrategy::Polymorphic {
            targets: p
                .targets
                .iter()
                .map(|t| registry.resolve(t))
                .collect::<Result<Vec<_>, _>>()?,
            type_field: p.type_field.clone(),
            id_field: p.id_field.clone(),
        },
        RelationshipDefinition::HasManyVia(v) => {
            let target = registry.resolve(&v.target)?;
            let Some(RelationshipDefinition::BelongsToPolymorphic(p)) = target.relationship(&v.via) else {
                return Err(AppError::invalid_schema(
                    &owner.type_name,
                    format!("'{}' has no polymorphic relationship '{}'", v.target, v.via),
                ));
            };
            JoinStrategy::Via {
                target,
                type_field: p.type_field,
                id_field: p.id_field,
            }
        }
    };
    Ok(RelationshipPlan {
        alias: alias.to_string(),
        owner,
        definition,
        strategy,
        registry,
    })
}
