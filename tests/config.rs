use architect_jsonapi::config::{load_from_dir, resolve, ApiSettings, ResourceConfig, TransformRegistry};
use architect_jsonapi::query::QueryParams;
use architect_jsonapi::store::MemoryStorage;
use architect_jsonapi::{AppError, ComputeFn, ConfigError, ResourceService, Transform};
use serde_json::{json, Value};
use std::sync::Arc;

mod common;
use common::{params, resource_body, to_json};

const RESOURCES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/example_consumer/resources");

fn transforms() -> TransformRegistry {
    TransformRegistry::new()
        .with_transform("trim", Transform::pure(|v, _| Ok(json!(v.as_str().unwrap_or_default().trim()))))
        .with_transform(
            "lowercase",
            Transform::pure(|v, _| Ok(json!(v.as_str().unwrap_or_default().to_lowercase()))),
        )
        .with_compute(
            "display_name",
            ComputeFn::new(|attrs| {
                let part = |k: &str| attrs.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
                Ok(json!(format!("{} {}", part("first_name"), part("last_name")).trim()))
            }),
        )
}

async fn blog() -> ResourceService {
    let configs = load_from_dir(RESOURCES).await.unwrap();
    let registry = Arc::new(resolve(&configs, &transforms()).unwrap());
    let storage = MemoryStorage::for_registry(&registry).unwrap();
    ResourceService::new(registry, ApiSettings::default(), Arc::new(storage)).unwrap()
}

#[tokio::test]
async fn bundled_resources_resolve() {
    let service = blog().await;
    let mut types: Vec<&str> = service.registry().schemas().map(|s| s.type_name.as_str()).collect();
    types.sort_unstable();
    assert_eq!(types, vec!["article_tags", "articles", "comments", "people", "tags"]);
}

#[tokio::test]
async fn configured_transforms_and_visibility_apply() {
    let service = blog().await;
    let body = resource_body(
        "people",
        json!({"first_name": "  Ada ", "last_name": "Lovelace", "email": "ADA@Example.org"}),
        json!({}),
    );
    let doc = to_json(&service.create("people", &body, &QueryParams::default()).await.unwrap());
    let attributes = &doc["data"]["attributes"];
    assert_eq!(attributes["first_name"], json!("Ada"));
    assert_eq!(attributes["display_name"], json!("Ada Lovelace"));
    assert!(attributes.get("email").is_none());

    let doc = to_json(
        &service
            .get("people", "1", &params(&[("fields[people]", "email")]))
            .await
            .unwrap(),
    );
    assert_eq!(doc["data"]["attributes"], json!({"email": "ada@example.org"}));

    let found = to_json(&service.query("people", &params(&[("filter[name][like]", "love")])).await.unwrap());
    assert_eq!(found["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_transform_is_reported_by_name() {
    let configs = load_from_dir(RESOURCES).await.unwrap();
    let err = resolve(&configs, &TransformRegistry::new()).unwrap_err();
    assert!(
        matches!(err, AppError::Config(ConfigError::MissingReference { kind: "transform", ref id }) if id == "trim"),
        "{err}"
    );
}

#[tokio::test]
async fn unknown_target_fails_resolution() {
    let configs: Vec<ResourceConfig> = serde_json::from_value(json!([{
        "type": "comments",
        "fields": [{"name": "text", "kind": "column", "type": "string"}],
        "relationships": [{"alias": "subject", "kind": "polymorphic", "targets": ["ghosts"],
                           "type_field": "subject_type", "id_field": "subject_id"}]
    }]))
    .unwrap();
    let err = resolve(&configs, &TransformRegistry::new()).unwrap_err();
    assert!(matches!(err, AppError::InvalidSchema { .. } | AppError::UnknownResource(_)), "{err}");
}

#[tokio::test]
async fn missing_directory_is_a_load_error() {
    let err = load_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/no-such-dir")).await.unwrap_err();
    assert!(matches!(err, ConfigError::Load(_)));
}
