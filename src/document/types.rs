//! JSON:API wire types, both directions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: String,
    /// Extra pivot attributes of a many-to-many link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl ResourceIdentifier {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        ResourceIdentifier {
            type_name: type_name.into(),
            id: id.into(),
            meta: None,
        }
    }
}

/// Relationship `data`: `null`, one identifier, or an ordered list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    One(Option<ResourceIdentifier>),
    Many(Vec<ResourceIdentifier>),
}

impl Linkage {
    pub fn identifiers(&self) -> Vec<&ResourceIdentifier> {
        match self {
            Linkage::One(one) => one.iter().collect(),
            Linkage::Many(many) => many.iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    pub related: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub data: Linkage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<RelationshipLinks>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceLinks {
    #[serde(rename = "self")]
    pub self_link: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: String,
    pub attributes: Map<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Relationship>,
    pub links: ResourceLinks,
}

impl ResourceObject {
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::new(self.type_name.clone(), self.id.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Null,
    One(Box<ResourceObject>),
    Many(Vec<ResourceObject>),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DocumentLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DocumentMeta {
    pub pagination: PaginationMeta,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Document {
    pub data: PrimaryData,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceObject>,
    pub links: DocumentLinks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DocumentMeta>,
}

/// Response of the `relationships/{alias}` endpoints.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RelationshipDocument {
    pub data: Linkage,
    pub links: RelationshipLinks,
}

/// Body of POST / PATCH / PUT on a resource.
#[derive(Clone, Debug, Deserialize)]
pub struct ResourceDocument {
    pub data: ResourceInput,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResourceInput {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
}

/// Body of the relationship mutation endpoints.
#[derive(Clone, Debug, Deserialize)]
pub struct LinkageDocument {
    pub data: Linkage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn linkage_accepts_null_object_and_array() {
        let null: LinkageDocument = serde_json::from_value(json!({"data": null})).unwrap();
        assert_eq!(null.data, Linkage::One(None));
        let one: LinkageDocument = serde_json::from_value(json!({"data": {"type": "people", "id": "9"}})).unwrap();
        assert_eq!(one.data, Linkage::One(Some(ResourceIdentifier::new("people", "9"))));
        let many: LinkageDocument = serde_json::from_value(json!({"data": [{"type": "tags", "id": "1"}]})).unwrap();
        assert_eq!(many.data.identifiers().len(), 1);
    }

    #[test]
    fn null_primary_data_serializes_as_null() {
        let doc = Document {
            data: PrimaryData::Null,
            included: Vec::new(),
            links: DocumentLinks {
                self_link: "/articles/1".into(),
                ..Default::default()
            },
            meta: None,
        };
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"data": null, "links": {"self": "/articles/1"}})
        );
    }
}
