use architect_jsonapi::config::ApiSettings;
use architect_jsonapi::pipeline::write_pass;
use architect_jsonapi::query::QueryParams;
use architect_jsonapi::schema::{ColumnDef, ResourceSchema, SchemaRegistry};
use architect_jsonapi::store::MemoryStorage;
use architect_jsonapi::transform::{ComputeFn, Transform, TransformError};
use architect_jsonapi::{AppError, ResourceService};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mod common;
use common::{resource_body, to_json};

fn service_for(schema: ResourceSchema) -> ResourceService {
    let mut registry = SchemaRegistry::new();
    registry.register(schema).unwrap();
    registry.finalize().unwrap();
    let storage = MemoryStorage::for_registry(&registry).unwrap();
    ResourceService::new(Arc::new(registry), ApiSettings::default(), Arc::new(storage)).unwrap()
}

fn lowercase() -> Transform {
    Transform::pure(|v, _| Ok(Value::String(v.as_str().unwrap_or_default().trim().to_lowercase())))
}

#[tokio::test]
async fn setter_sees_transformed_sibling() {
    // "handle" is declared first but runs after "email".
    let schema = ResourceSchema::builder("users")
        .column(
            "handle",
            ColumnDef::string().run_after(["email"]).setter(Transform::pure(|v, attrs| {
                let email = attrs.get("email").and_then(Value::as_str).unwrap_or_default();
                let domain = email.split('@').nth(1).unwrap_or_default();
                Ok(json!(format!("{}@{}", v.as_str().unwrap_or_default(), domain)))
            })),
        )
        .column("email", ColumnDef::string().setter(lowercase()))
        .build();
    let service = service_for(schema);

    let body = resource_body("users", json!({"handle": "ada", "email": "  Ada@Example.ORG "}), json!({}));
    let doc = to_json(&service.create("users", &body, &QueryParams::default()).await.unwrap());
    assert_eq!(doc["data"]["attributes"]["email"], json!("ada@example.org"));
    assert_eq!(doc["data"]["attributes"]["handle"], json!("ada@example.org"));
}

#[tokio::test]
async fn setter_only_runs_for_present_fields() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let schema = ResourceSchema::builder("users")
        .column("email", ColumnDef::string())
        .column(
            "nickname",
            ColumnDef::string().setter(Transform::pure(move |v, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            })),
        )
        .build();
    let service = service_for(schema);
    let body = resource_body("users", json!({"email": "a@b.c"}), json!({}));
    service.create("users", &body, &QueryParams::default()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cycle_fails_before_any_setter_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counting = |calls: &Arc<AtomicUsize>| {
        let calls = calls.clone();
        Transform::pure(move |v, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(v)
        })
    };
    let schema = ResourceSchema::builder("users")
        .column("a", ColumnDef::string().run_after(["b"]).setter(counting(&calls)))
        .column("b", ColumnDef::string().run_after(["a"]).setter(counting(&calls)))
        .build();

    let input = json!({"a": "x", "b": "y"}).as_object().cloned().unwrap();
    let err = write_pass(&schema, &input).await.unwrap_err();
    assert!(matches!(err, AppError::CyclicDependency { ref cycle, .. } if cycle.len() >= 2), "{err}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The registry refuses the schema up front.
    let err = SchemaRegistry::new().register(schema).unwrap_err();
    assert!(matches!(err, AppError::CyclicDependency { .. }), "{err}");
}

#[tokio::test]
async fn failing_setter_names_the_field_and_writes_nothing() {
    let schema = ResourceSchema::builder("users")
        .column(
            "age",
            ColumnDef::number().setter(Transform::pure(|v, _| match v.as_f64() {
                Some(n) if n >= 0.0 => Ok(v),
                _ => Err(TransformError::new("must not be negative")),
            })),
        )
        .build();
    let registry = {
        let mut r = SchemaRegistry::new();
        r.register(schema).unwrap();
        r.finalize().unwrap();
        Arc::new(r)
    };
    let storage = MemoryStorage::for_registry(&registry).unwrap();
    let service = ResourceService::new(registry, ApiSettings::default(), Arc::new(storage.clone())).unwrap();

    let body = resource_body("users", json!({"age": -3}), json!({}));
    let err = service.create("users", &body, &QueryParams::default()).await.unwrap_err();
    assert!(matches!(err, AppError::Setter { ref field, .. } if field == "age"));
    assert!(storage.rows("users").unwrap().is_empty());
}

#[tokio::test]
async fn reads_are_repeatable() {
    let schema = ResourceSchema::builder("people")
        .column(
            "name",
            ColumnDef::string().getter(Transform::pure(|v, _| {
                Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
            })),
        )
        .column("secret", ColumnDef::string().hidden())
        .computed(
            "greeting",
            ["name"],
            ComputeFn::new(|attrs| {
                Ok(json!(format!("hello {}", attrs.get("name").and_then(Value::as_str).unwrap_or_default())))
            }),
        )
        .build();
    let service = service_for(schema);
    let body = resource_body("people", json!({"name": "grace", "secret": "s3"}), json!({}));
    service.create("people", &body, &QueryParams::default()).await.unwrap();

    let first = to_json(&service.get("people", "1", &QueryParams::default()).await.unwrap());
    let second = to_json(&service.get("people", "1", &QueryParams::default()).await.unwrap());
    assert_eq!(first, second);
    let attributes = &first["data"]["attributes"];
    assert_eq!(attributes["name"], json!("GRACE"));
    assert_eq!(attributes["greeting"], json!("hello GRACE"));
    assert!(attributes.get("secret").is_none());
}
