//! Shared fixture: a small library catalogue on the memory driver.
#![allow(dead_code)]

use architect_jsonapi::config::ApiSettings;
use architect_jsonapi::document::ResourceDocument;
use architect_jsonapi::query::QueryParams;
use architect_jsonapi::schema::{ColumnDef, HasRelation, PolymorphicRelation, ResourceSchema, SchemaRegistry};
use architect_jsonapi::store::{Insert, MemoryStorage, Row, Storage};
use architect_jsonapi::ResourceService;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    let schemas = vec![
        ResourceSchema::builder("publishers")
            .column("name", ColumnDef::string().required())
            .has_many("books", HasRelation::direct("books"))
            .has_one("flagship", HasRelation::direct("books"))
            .build(),
        ResourceSchema::builder("authors")
            .column("name", ColumnDef::string().required())
            .has_many("books", HasRelation::through("books", "book_authors"))
            .has_one("first_book", HasRelation::through("books", "book_authors"))
            .build(),
        ResourceSchema::builder("books")
            .column("title", ColumnDef::string().required())
            .column("year", ColumnDef::number().not_null())
            .column("isbn", ColumnDef::string().unique())
            .belongs_to("publisher_id", "publishers", "publisher")
            .has_many("authors", HasRelation::through("authors", "book_authors"))
            .has_many("credits", HasRelation::direct("book_authors"))
            .has_many_via("comments", "comments", "commentable")
            .sortable(["title", "year", "isbn"])
            .build(),
        ResourceSchema::builder("book_authors")
            .belongs_to_required("book_id", "books", "book")
            .belongs_to_required("author_id", "authors", "author")
            .column("role", ColumnDef::string())
            .build(),
        ResourceSchema::builder("articles")
            .column("headline", ColumnDef::string().required())
            .has_many_via("comments", "comments", "commentable")
            .build(),
        ResourceSchema::builder("comments")
            .column("body", ColumnDef::string().required())
            .polymorphic(
                "commentable",
                PolymorphicRelation::new(["articles", "books"], "commentable_type", "commentable_id"),
            )
            .build(),
    ];
    for schema in schemas {
        registry.register(schema).expect("register");
    }
    registry.finalize().expect("finalize");
    registry
}

pub struct Fixture {
    pub service: ResourceService,
    pub storage: MemoryStorage,
}

/// Logs go through the test writer; set `RUST_LOG=architect_jsonapi=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fixture_with(settings: ApiSettings) -> Fixture {
    init_tracing();
    let registry = Arc::new(registry());
    let storage = MemoryStorage::for_registry(&registry).expect("memory storage");
    let service = ResourceService::new(registry, settings, Arc::new(storage.clone())).expect("service");
    Fixture { service, storage }
}

pub fn fixture() -> Fixture {
    fixture_with(ApiSettings::default())
}

pub fn params(pairs: &[(&str, &str)]) -> QueryParams {
    QueryParams::from_pairs(pairs.iter().copied()).expect("query params")
}

pub fn resource_body(type_name: &str, attributes: Value, relationships: Value) -> ResourceDocument {
    serde_json::from_value(json!({
        "data": {"type": type_name, "attributes": attributes, "relationships": relationships}
    }))
    .expect("resource document")
}

impl Fixture {
    /// Creates a record through the service and returns its id.
    pub async fn create(&self, type_name: &str, attributes: Value, relationships: Value) -> String {
        let document = self
            .service
            .create(type_name, &resource_body(type_name, attributes, relationships), &QueryParams::default())
            .await
            .expect("create");
        to_json(&document)["data"]["id"].as_str().expect("id").to_string()
    }

    /// Writes a row straight to storage, skipping validation.
    pub async fn insert_raw(&self, type_name: &str, values: Value) -> Row {
        let registry = self.service.registry();
        let schema = registry.resolve(type_name).expect("schema");
        let mut tx = self.storage.begin().await.expect("begin");
        let row = tx
            .insert(&Insert {
                table: registry.table_ref(schema),
                values: values.as_object().cloned().expect("object"),
                identity_column: schema.id_property.clone(),
            })
            .await
            .expect("insert");
        tx.commit().await.expect("commit");
        row
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.storage.rows(table).expect("rows")
    }
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("serialize")
}

pub fn identifier(type_name: &str, id: &str) -> Value {
    json!({"type": type_name, "id": id})
}

/// `(type, id)` pairs of a linkage or resource array.
pub fn pairs(list: &Value) -> Vec<(String, String)> {
    list.as_array()
        .map(|items| {
            items
                .iter()
                .map(|i| {
                    (
                        i["type"].as_str().unwrap_or_default().to_string(),
                        i["id"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Two publishers, three authors, three books:
/// book 1 by authors 1 and 2, book 2 by author 2, book 3 by author 3.
pub async fn seed_catalogue(f: &Fixture) {
    let penguin = f.create("publishers", json!({"name": "Penguin"}), json!({})).await;
    f.create("publishers", json!({"name": "Tor"}), json!({})).await;
    let a1 = f.create("authors", json!({"name": "Le Guin"}), json!({})).await;
    let a2 = f.create("authors", json!({"name": "Herbert"}), json!({})).await;
    let a3 = f.create("authors", json!({"name": "Butler"}), json!({})).await;
    let books = [
        ("Earthsea", 1968, vec![a1.clone(), a2.clone()]),
        ("Dune", 1965, vec![a2.clone()]),
        ("Kindred", 1979, vec![a3.clone()]),
    ];
    for (title, year, authors) in books {
        let linkage: Vec<Value> = authors.iter().map(|a| identifier("authors", a)).collect();
        f.create(
            "books",
            json!({"title": title, "year": year}),
            json!({
                "publisher": {"data": identifier("publishers", &penguin)},
                "authors": {"data": linkage}
            }),
        )
        .await;
    }
}
