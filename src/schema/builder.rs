//! Fluent construction of `ResourceSchema`.

use crate::schema::types::*;
use crate::transform::ComputeFn;
use std::collections::HashMap;

pub struct ResourceSchemaBuilder {
    type_name: String,
    table: Option<String>,
    id_property: String,
    fields: Vec<Field>,
    relationships: Vec<(String, RelationshipDefinition)>,
    search: Vec<SearchField>,
    sortable: Vec<String>,
}

impl ResourceSchema {
    pub fn builder(type_name: impl Into<String>) -> ResourceSchemaBuilder {
        ResourceSchemaBuilder {
            type_name: type_name.into(),
            table: None,
            id_property: "id".into(),
            fields: Vec::new(),
            relationships: Vec::new(),
            search: Vec::new(),
            sortable: Vec::new(),
        }
    }
}

impl ResourceSchemaBuilder {
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Name of the identity property (default `id`).
    pub fn identity(mut self, column: impl Into<String>) -> Self {
        self.id_property = column.into();
        self
    }

    pub fn field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        self.fields.push(Field {
            name: name.into(),
            definition,
        });
        self
    }

    pub fn column(self, name: impl Into<String>, def: ColumnDef) -> Self {
        self.field(name, FieldDefinition::Column(def))
    }

    /// Foreign key column `column` pointing at `target`, exposed as relationship `alias`.
    pub fn belongs_to(self, column: impl Into<String>, target: impl Into<String>, alias: impl Into<String>) -> Self {
        self.field(
            column,
            FieldDefinition::BelongsTo(BelongsToDef {
                target: target.into(),
                alias: alias.into(),
                nullable: true,
            }),
        )
    }

    pub fn belongs_to_required(
        self,
        column: impl Into<String>,
        target: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.field(
            column,
            FieldDefinition::BelongsTo(BelongsToDef {
                target: target.into(),
                alias: alias.into(),
                nullable: false,
            }),
        )
    }

    pub fn computed<I, S>(self, name: impl Into<String>, dependencies: I, compute: ComputeFn) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field(
            name,
            FieldDefinition::Computed(ComputedDef {
                dependencies: dependencies.into_iter().map(Into::into).collect(),
                compute,
                visibility: Visibility::Visible,
            }),
        )
    }

    pub fn virtual_field(self, name: impl Into<String>, def: VirtualDef) -> Self {
        self.field(name, FieldDefinition::Virtual(def))
    }

    pub fn relationship(mut self, alias: impl Into<String>, def: RelationshipDefinition) -> Self {
        self.relationships.push((alias.into(), def));
        self
    }

    pub fn has_many(self, alias: impl Into<String>, rel: HasRelation) -> Self {
        self.relationship(alias, RelationshipDefinition::HasMany(rel))
    }

    pub fn has_one(self, alias: impl Into<String>, rel: HasRelation) -> Self {
        self.relationship(alias, RelationshipDefinition::HasOne(rel))
    }

    pub fn polymorphic(self, alias: impl Into<String>, rel: PolymorphicRelation) -> Self {
        self.relationship(alias, RelationshipDefinition::BelongsToPolymorphic(rel))
    }

    /// Reverse side of the polymorphic relationship `via` declared on `target`.
    pub fn has_many_via(self, alias: impl Into<String>, target: impl Into<String>, via: impl Into<String>) -> Self {
        self.relationship(
            alias,
            RelationshipDefinition::HasManyVia(ViaRelation {
                target: target.into(),
                via: via.into(),
            }),
        )
    }

    pub fn search(mut self, field: SearchField) -> Self {
        self.search.push(field);
        self
    }

    pub fn sortable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sortable.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Builds the schema. An undeclared identity column is added as a non-null number, and
    /// undeclared polymorphic type/id columns as nullable string/number columns.
    /// Cross-resource checks happen at registry finalize.
    pub fn build(mut self) -> ResourceSchema {
        if !self.fields.iter().any(|f| f.name == self.id_property) {
            self.fields.insert(
                0,
                Field {
                    name: self.id_property.clone(),
                    definition: FieldDefinition::Column(ColumnDef::number().not_null()),
                },
            );
        }
        let poly_columns: Vec<(String, String)> = self
            .relationships
            .iter()
            .filter_map(|(_, r)| match r {
                RelationshipDefinition::BelongsToPolymorphic(p) => Some((p.type_field.clone(), p.id_field.clone())),
                _ => None,
            })
            .collect();
        for (type_field, id_field) in poly_columns {
            if !self.fields.iter().any(|f| f.name == type_field) {
                self.fields.push(Field {
                    name: type_field,
                    definition: FieldDefinition::Column(ColumnDef::string()),
                });
            }
            if !self.fields.iter().any(|f| f.name == id_field) {
                self.fields.push(Field {
                    name: id_field,
                    definition: FieldDefinition::Column(ColumnDef::number()),
                });
            }
        }
        // First occurrence wins in the index; duplicates are reported by the registry.
        let mut field_index = HashMap::new();
        for (i, f) in self.fields.iter().enumerate() {
            field_index.entry(f.name.clone()).or_insert(i);
        }
        ResourceSchema {
            table: self.table.unwrap_or_else(|| self.type_name.clone()),
            type_name: self.type_name,
            id_property: self.id_property,
            fields: self.fields,
            relationships: self.relationships,
            search: self.search,
            sortable: self.sortable,
            field_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_adds_identity_and_polymorphic_columns() {
        let schema = ResourceSchema::builder("comments")
            .column("body", ColumnDef::string())
            .polymorphic(
                "commentable",
                PolymorphicRelation::new(["articles", "videos"], "commentable_type", "commentable_id"),
            )
            .build();
        assert_eq!(schema.table, "comments");
        assert_eq!(schema.fields[0].name, "id");
        assert!(schema.column("commentable_type").is_some());
        assert!(schema.column("commentable_id").is_some());
        assert_eq!(schema.linkage_columns(), vec!["commentable_type", "commentable_id"]);
    }

    #[test]
    fn belongs_to_is_mirrored_as_relationship() {
        let schema = ResourceSchema::builder("articles")
            .belongs_to("author_id", "people", "author")
            .build();
        match schema.relationship("author") {
            Some(RelationshipDefinition::BelongsTo(r)) => {
                assert_eq!(r.target, "people");
                assert_eq!(r.foreign_key, "author_id");
            }
            other => panic!("unexpected relationship {:?}", other),
        }
        assert_eq!(schema.relationship_aliases(), vec!["author"]);
    }
}
