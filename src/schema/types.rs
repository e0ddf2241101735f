//! Resource schema model: fields, relationships, search and sort declarations.

use crate::transform::{ComputeFn, Transform};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Semantic type of a stored or virtual field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    String,
    Number,
    Boolean,
    Date,
    #[serde(alias = "date_time")]
    Datetime,
    Object,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::String => "string",
            SemanticType::Number => "number",
            SemanticType::Boolean => "boolean",
            SemanticType::Date => "date",
            SemanticType::Datetime => "datetime",
            SemanticType::Object => "object",
        }
    }
}

/// Output visibility of a field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Visible,
    /// Never returned.
    Hidden,
    /// Returned only when named in a sparse fieldset.
    NormallyHidden,
}

/// Per-field constraints checked on write.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub unique: Option<bool>,
}

impl ValidationRule {
    pub fn is_required(&self) -> bool {
        self.required == Some(true)
    }

    pub fn is_unique(&self) -> bool {
        self.unique == Some(true)
    }
}

#[derive(Clone, Debug)]
pub struct ColumnDef {
    pub ty: SemanticType,
    pub nullable: bool,
    pub validation: ValidationRule,
    pub getter: Option<Transform>,
    pub setter: Option<Transform>,
    pub run_after: Vec<String>,
    pub visibility: Visibility,
}

impl ColumnDef {
    pub fn new(ty: SemanticType) -> Self {
        ColumnDef {
            ty,
            nullable: true,
            validation: ValidationRule::default(),
            getter: None,
            setter: None,
            run_after: Vec::new(),
            visibility: Visibility::Visible,
        }
    }

    pub fn string() -> Self {
        Self::new(SemanticType::String)
    }

    pub fn number() -> Self {
        Self::new(SemanticType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(SemanticType::Boolean)
    }

    pub fn date() -> Self {
        Self::new(SemanticType::Date)
    }

    pub fn datetime() -> Self {
        Self::new(SemanticType::Datetime)
    }

    pub fn object() -> Self {
        Self::new(SemanticType::Object)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self.validation.required = Some(true);
        self
    }

    pub fn unique(mut self) -> Self {
        self.validation.unique = Some(true);
        self
    }

    pub fn min_length(mut self, n: u32) -> Self {
        self.validation.min_length = Some(n);
        self
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.validation.max_length = Some(n);
        self
    }

    pub fn minimum(mut self, n: f64) -> Self {
        self.validation.minimum = Some(n);
        self
    }

    pub fn maximum(mut self, n: f64) -> Self {
        self.validation.maximum = Some(n);
        self
    }

    pub fn validation(mut self, rule: ValidationRule) -> Self {
        self.validation = rule;
        self
    }

    pub fn getter(mut self, t: Transform) -> Self {
        self.getter = Some(t);
        self
    }

    pub fn setter(mut self, t: Transform) -> Self {
        self.setter = Some(t);
        self
    }

    pub fn run_after<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_after = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visibility = Visibility::Hidden;
        self
    }

    pub fn normally_hidden(mut self) -> Self {
        self.visibility = Visibility::NormallyHidden;
        self
    }
}

/// Foreign key held on this record. The field name is the column name.
#[derive(Clone, Debug)]
pub struct BelongsToDef {
    pub target: String,
    pub alias: String,
    pub nullable: bool,
}

#[derive(Clone, Debug)]
pub struct ComputedDef {
    pub dependencies: Vec<String>,
    pub compute: ComputeFn,
    pub visibility: Visibility,
}

/// Write-only input; never persisted or returned.
#[derive(Clone, Debug)]
pub struct VirtualDef {
    pub ty: SemanticType,
    pub validation: ValidationRule,
    pub setter: Option<Transform>,
    pub run_after: Vec<String>,
}

impl VirtualDef {
    pub fn new(ty: SemanticType) -> Self {
        VirtualDef {
            ty,
            validation: ValidationRule::default(),
            setter: None,
            run_after: Vec::new(),
        }
    }

    pub fn validation(mut self, rule: ValidationRule) -> Self {
        self.validation = rule;
        self
    }

    pub fn setter(mut self, t: Transform) -> Self {
        self.setter = Some(t);
        self
    }

    pub fn run_after<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_after = fields.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Debug)]
pub enum FieldDefinition {
    Column(ColumnDef),
    BelongsTo(BelongsToDef),
    Computed(ComputedDef),
    Virtual(VirtualDef),
}

impl FieldDefinition {
    /// Stored in the resource's table.
    pub fn is_stored(&self) -> bool {
        matches!(self, FieldDefinition::Column(_) | FieldDefinition::BelongsTo(_))
    }

    pub fn run_after(&self) -> &[String] {
        match self {
            FieldDefinition::Column(c) => &c.run_after,
            FieldDefinition::Virtual(v) => &v.run_after,
            FieldDefinition::BelongsTo(_) | FieldDefinition::Computed(_) => &[],
        }
    }

    pub fn setter(&self) -> Option<&Transform> {
        match self {
            FieldDefinition::Column(c) => c.setter.as_ref(),
            FieldDefinition::Virtual(v) => v.setter.as_ref(),
            FieldDefinition::BelongsTo(_) | FieldDefinition::Computed(_) => None,
        }
    }

    pub fn getter(&self) -> Option<&Transform> {
        match self {
            FieldDefinition::Column(c) => c.getter.as_ref(),
            _ => None,
        }
    }

    pub fn visibility(&self) -> Visibility {
        match self {
            FieldDefinition::Column(c) => c.visibility,
            FieldDefinition::Computed(c) => c.visibility,
            FieldDefinition::BelongsTo(_) | FieldDefinition::Virtual(_) => Visibility::Hidden,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub definition: FieldDefinition,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BelongsToRelation {
    pub target: String,
    pub foreign_key: String,
    pub nullable: bool,
}

/// hasMany / hasOne: FK in the target table, or a pivot resource when `through` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HasRelation {
    pub target: String,
    pub foreign_key: Option<String>,
    pub through: Option<String>,
    pub other_key: Option<String>,
}

impl HasRelation {
    pub fn direct(target: impl Into<String>) -> Self {
        HasRelation {
            target: target.into(),
            foreign_key: None,
            through: None,
            other_key: None,
        }
    }

    pub fn through(target: impl Into<String>, pivot: impl Into<String>) -> Self {
        HasRelation {
            target: target.into(),
            foreign_key: None,
            through: Some(pivot.into()),
            other_key: None,
        }
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    pub fn other_key(mut self, column: impl Into<String>) -> Self {
        self.other_key = Some(column.into());
        self
    }

    /// Foreign key column, explicit or `<singular owner>_id`.
    pub fn resolved_foreign_key(&self, owner_type: &str) -> String {
        self.foreign_key
            .clone()
            .unwrap_or_else(|| format!("{}_id", singularize(owner_type)))
    }

    /// Pivot column pointing at the target, explicit or `<singular target>_id`.
    pub fn resolved_other_key(&self) -> String {
        self.other_key
            .clone()
            .unwrap_or_else(|| format!("{}_id", singularize(&self.target)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolymorphicRelation {
    pub targets: Vec<String>,
    pub type_field: String,
    pub id_field: String,
}

impl PolymorphicRelation {
    pub fn new<I, S>(targets: I, type_field: impl Into<String>, id_field: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PolymorphicRelation {
            targets: targets.into_iter().map(Into::into).collect(),
            type_field: type_field.into(),
            id_field: id_field.into(),
        }
    }

    pub fn allows(&self, type_name: &str) -> bool {
        self.targets.iter().any(|t| t == type_name)
    }
}

/// Reverse of a polymorphic belongsTo declared on `target` under alias `via`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViaRelation {
    pub target: String,
    pub via: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationshipDefinition {
    BelongsTo(BelongsToRelation),
    HasMany(HasRelation),
    HasOne(HasRelation),
    BelongsToPolymorphic(PolymorphicRelation),
    HasManyVia(ViaRelation),
}

impl RelationshipDefinition {
    /// to-one relationships render `data` as a single identifier (or null).
    pub fn is_to_one(&self) -> bool {
        matches!(
            self,
            RelationshipDefinition::BelongsTo(_)
                | RelationshipDefinition::HasOne(_)
                | RelationshipDefinition::BelongsToPolymorphic(_)
        )
    }

    /// Always rendered, whether or not included.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            RelationshipDefinition::BelongsTo(_) | RelationshipDefinition::BelongsToPolymorphic(_)
        )
    }

    /// Possible target types.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            RelationshipDefinition::BelongsTo(r) => vec![r.target.as_str()],
            RelationshipDefinition::HasMany(r) | RelationshipDefinition::HasOne(r) => vec![r.target.as_str()],
            RelationshipDefinition::BelongsToPolymorphic(r) => r.targets.iter().map(String::as_str).collect(),
            RelationshipDefinition::HasManyVia(r) => vec![r.target.as_str()],
        }
    }
}

/// Where a search field looks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchTarget {
    /// Matches when any of the columns matches.
    Columns(Vec<String>),
    /// Searches the record a polymorphic relationship points at; `columns` maps each allowed
    /// target type to the column searched on that type.
    Polymorphic {
        relationship: String,
        columns: BTreeMap<String, String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchField {
    pub name: String,
    pub target: SearchTarget,
}

impl SearchField {
    pub fn columns<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SearchField {
            name: name.into(),
            target: SearchTarget::Columns(columns.into_iter().map(Into::into).collect()),
        }
    }

    pub fn polymorphic<I, K, V>(name: impl Into<String>, relationship: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        SearchField {
            name: name.into(),
            target: SearchTarget::Polymorphic {
                relationship: relationship.into(),
                columns: columns.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResourceSchema {
    pub type_name: String,
    pub table: String,
    pub id_property: String,
    pub fields: Vec<Field>,
    pub relationships: Vec<(String, RelationshipDefinition)>,
    pub search: Vec<SearchField>,
    pub sortable: Vec<String>,
    pub(crate) field_index: HashMap<String, usize>,
}

impl ResourceSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.field_index.get(name).map(|&i| &self.fields[i].definition)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        match self.field(name) {
            Some(FieldDefinition::Column(c)) => Some(c),
            _ => None,
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_index.contains_key(name)
    }

    pub fn is_stored(&self, name: &str) -> bool {
        self.field(name).map(FieldDefinition::is_stored).unwrap_or(false)
    }

    /// All columns of the table, in declaration order.
    pub fn stored_columns(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.definition.is_stored())
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Semantic type of a column or virtual field. Foreign keys are typed by their
    /// target's identity, which only the registry knows.
    pub fn column_type(&self, name: &str) -> Option<SemanticType> {
        match self.field(name)? {
            FieldDefinition::Column(c) => Some(c.ty),
            FieldDefinition::BelongsTo(_) => None,
            FieldDefinition::Virtual(v) => Some(v.ty),
            FieldDefinition::Computed(_) => None,
        }
    }

    pub fn is_nullable(&self, name: &str) -> bool {
        match self.field(name) {
            Some(FieldDefinition::Column(c)) => c.nullable,
            Some(FieldDefinition::BelongsTo(b)) => b.nullable,
            _ => true,
        }
    }

    pub fn belongs_to_fields(&self) -> impl Iterator<Item = (&str, &BelongsToDef)> {
        self.fields.iter().filter_map(|f| match &f.definition {
            FieldDefinition::BelongsTo(b) => Some((f.name.as_str(), b)),
            _ => None,
        })
    }

    pub fn polymorphic_relations(&self) -> impl Iterator<Item = (&str, &PolymorphicRelation)> {
        self.relationships.iter().filter_map(|(alias, r)| match r {
            RelationshipDefinition::BelongsToPolymorphic(p) => Some((alias.as_str(), p)),
            _ => None,
        })
    }

    /// Columns that carry relationship linkage rather than attributes: belongsTo foreign
    /// keys and polymorphic type/id pairs.
    pub fn linkage_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.belongs_to_fields().map(|(name, _)| name).collect();
        for (_, p) in self.polymorphic_relations() {
            out.push(p.type_field.as_str());
            out.push(p.id_field.as_str());
        }
        out
    }

    pub fn is_linkage_column(&self, name: &str) -> bool {
        self.linkage_columns().contains(&name)
    }

    /// Relationship by alias, including the belongsTo relationships mirrored from fields.
    pub fn relationship(&self, alias: &str) -> Option<RelationshipDefinition> {
        if let Some((_, r)) = self.relationships.iter().find(|(a, _)| a == alias) {
            return Some(r.clone());
        }
        self.belongs_to_fields()
            .find(|(_, b)| b.alias == alias)
            .map(|(column, b)| {
                RelationshipDefinition::BelongsTo(BelongsToRelation {
                    target: b.target.clone(),
                    foreign_key: column.to_string(),
                    nullable: b.nullable,
                })
            })
    }

    /// Every relationship alias: mirrored belongsTo first, then declared ones.
    pub fn relationship_aliases(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.belongs_to_fields().map(|(_, b)| b.alias.as_str()).collect();
        out.extend(self.relationships.iter().map(|(a, _)| a.as_str()));
        out
    }

    /// Declared sortable fields, or every plain column when none were declared.
    pub fn sortable_fields(&self) -> Vec<&str> {
        if !self.sortable.is_empty() {
            return self.sortable.iter().map(String::as_str).collect();
        }
        self.fields
            .iter()
            .filter(|f| matches!(f.definition, FieldDefinition::Column(_)))
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Declared search fields, or one exact-column search per plain column.
    pub fn search_fields(&self) -> Vec<SearchField> {
        if !self.search.is_empty() {
            return self.search.clone();
        }
        self.fields
            .iter()
            .filter(|f| f.definition.is_stored())
            .map(|f| SearchField::columns(f.name.clone(), [f.name.clone()]))
            .collect()
    }
}

/// Naive English singular used for key naming conventions.
pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{}y", stem);
    }
    for suffix in ["sses", "xes", "ches", "shes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with('s') && !word.ends_with("ss") {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}
