use architect_jsonapi::config::ApiSettings;
use architect_jsonapi::document::{Linkage, ResourceIdentifier};
use architect_jsonapi::hooks::{from_fn, Denied, HookChain, PermissionContext};
use architect_jsonapi::query::QueryParams;
use architect_jsonapi::schema::{ColumnDef, ResourceSchema, SchemaRegistry};
use architect_jsonapi::store::MemoryStorage;
use architect_jsonapi::{AppError, ResourceService, UpdateMode};
use serde_json::{json, Value};
use std::sync::Arc;

mod common;
use common::{fixture, identifier, pairs, params, resource_body, seed_catalogue, to_json, Fixture};

fn authors(ids: &[&str]) -> Linkage {
    Linkage::Many(ids.iter().map(|id| ResourceIdentifier::new("authors", *id)).collect())
}

fn books(ids: &[&str]) -> Linkage {
    Linkage::Many(ids.iter().map(|id| ResourceIdentifier::new("books", *id)).collect())
}

/// `books.publisher_id` in identity order.
fn publisher_ids(f: &Fixture) -> Vec<Value> {
    f.rows("books").iter().map(|r| r["publisher_id"].clone()).collect()
}

fn pivot_pairs(rows: &[serde_json::Map<String, Value>]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r["book_id"].to_string(), r["author_id"].to_string()))
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn removing_members_keeps_other_pivots_and_endpoints() {
    let f = fixture();
    seed_catalogue(&f).await;
    f.service
        .add_relationship("books", "1", "authors", &authors(&["3"]))
        .await
        .unwrap();

    let doc = f
        .service
        .delete_relationship("books", "1", "authors", &authors(&["1", "3"]))
        .await
        .unwrap();
    assert_eq!(pairs(&to_json(&doc)["data"]), vec![("authors".to_string(), "2".to_string())]);

    let expected: Vec<(String, String)> = [("1", "2"), ("2", "2"), ("3", "3")]
        .iter()
        .map(|(b, a)| (b.to_string(), a.to_string()))
        .collect();
    assert_eq!(pivot_pairs(&f.rows("book_authors")), expected);
    assert_eq!(f.rows("authors").len(), 3);
    assert_eq!(f.rows("books").len(), 3);
}

#[tokio::test]
async fn replace_members_sets_exact_membership() {
    let f = fixture();
    seed_catalogue(&f).await;
    let doc = f
        .service
        .replace_relationship("books", "2", "authors", &authors(&["1", "3"]))
        .await
        .unwrap();
    let mut linked = pairs(&to_json(&doc)["data"]);
    linked.sort();
    assert_eq!(
        linked,
        vec![("authors".to_string(), "1".to_string()), ("authors".to_string(), "3".to_string())]
    );
    // Book 1 still has its two authors.
    let rows = f.rows("book_authors");
    assert_eq!(rows.iter().filter(|r| r["book_id"] == json!(1)).count(), 2);
}

#[tokio::test]
async fn adding_an_existing_member_is_a_no_op() {
    let f = fixture();
    seed_catalogue(&f).await;
    let before = f.rows("book_authors").len();
    f.service
        .add_relationship("books", "1", "authors", &authors(&["1"]))
        .await
        .unwrap();
    assert_eq!(f.rows("book_authors").len(), before);
}

#[tokio::test]
async fn failed_write_rolls_back_everything() {
    let f = fixture();
    seed_catalogue(&f).await;
    let pivots = f.rows("book_authors").len();

    // Author 99 does not exist: the book must not be inserted either.
    let body = resource_body(
        "books",
        json!({"title": "Parable", "year": 1993}),
        json!({"authors": {"data": [identifier("authors", "3"), identifier("authors", "99")]}}),
    );
    let err = f.service.create("books", &body, &QueryParams::default()).await.unwrap_err();
    match err {
        AppError::Validation(violations) => {
            assert_eq!(violations[0].field, "authors");
            assert!(violations[0].message.contains("99"), "{}", violations[0].message);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.rows("books").len(), 3);
    assert_eq!(f.rows("book_authors").len(), pivots);
}

#[tokio::test]
async fn unique_columns_are_enforced() {
    let f = fixture();
    f.create("books", json!({"title": "A", "year": 1, "isbn": "111"}), json!({})).await;
    let second = f.create("books", json!({"title": "B", "year": 2, "isbn": "222"}), json!({})).await;

    let body = resource_body("books", json!({"title": "C", "year": 3, "isbn": "111"}), json!({}));
    let err = f.service.create("books", &body, &QueryParams::default()).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(ref v) if v[0].field == "isbn"), "{err}");

    let mut update = resource_body("books", json!({"isbn": "111"}), json!({}));
    update.data.id = Some(second.clone());
    let err = f
        .service
        .update("books", &second, &update, UpdateMode::Patch, &QueryParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err}");

    // Re-saving its own value is fine.
    let same = resource_body("books", json!({"isbn": "222", "title": "B2"}), json!({}));
    f.service
        .update("books", &second, &same, UpdateMode::Patch, &QueryParams::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn put_resets_absent_columns_and_patch_keeps_them() {
    let f = fixture();
    let id = f
        .create("books", json!({"title": "Dune", "year": 1965, "isbn": "0441"}), json!({}))
        .await;

    let patch = resource_body("books", json!({"title": "Dune Messiah"}), json!({}));
    let doc = to_json(
        &f.service
            .update("books", &id, &patch, UpdateMode::Patch, &QueryParams::default())
            .await
            .unwrap(),
    );
    assert_eq!(doc["data"]["attributes"]["isbn"], json!("0441"));

    let put = resource_body("books", json!({"title": "Children of Dune", "year": 1976}), json!({}));
    let doc = to_json(
        &f.service
            .update("books", &id, &put, UpdateMode::Put, &QueryParams::default())
            .await
            .unwrap(),
    );
    assert_eq!(doc["data"]["attributes"]["isbn"], json!(null));
    assert_eq!(doc["data"]["attributes"]["year"], json!(1976));

    // Omitting a non-nullable column under PUT is a validation failure.
    let put = resource_body("books", json!({"title": "God Emperor"}), json!({}));
    let err = f
        .service
        .update("books", &id, &put, UpdateMode::Put, &QueryParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(ref v) if v.iter().any(|v| v.field == "year")), "{err}");
}

#[tokio::test]
async fn delete_removes_pivots_but_not_targets() {
    let f = fixture();
    seed_catalogue(&f).await;
    f.service.delete("books", "1").await.unwrap();
    assert_eq!(f.rows("books").len(), 2);
    assert!(f.rows("book_authors").iter().all(|r| r["book_id"] != json!(1)));
    assert_eq!(f.rows("authors").len(), 3);

    let err = f.service.get("books", "1", &QueryParams::default()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn to_one_relationship_rejects_member_operations() {
    let f = fixture();
    seed_catalogue(&f).await;
    let linkage = Linkage::Many(vec![ResourceIdentifier::new("publishers", "2")]);
    let err = f
        .service
        .add_relationship("books", "1", "publisher", &linkage)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "{err}");

    let doc = f
        .service
        .replace_relationship("books", "1", "publisher", &Linkage::One(Some(ResourceIdentifier::new("publishers", "2"))))
        .await
        .unwrap();
    assert_eq!(to_json(&doc)["data"], json!({"type": "publishers", "id": "2"}));
}

#[tokio::test]
async fn mismatched_body_type_is_a_bad_request() {
    let f = fixture();
    let body = resource_body("authors", json!({"title": "x", "year": 1}), json!({}));
    let err = f.service.create("books", &body, &QueryParams::default()).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "{err}");
}

#[tokio::test]
async fn hooks_veto_before_any_write() {
    let f = fixture();
    let service = f.service.clone().with_hooks(HookChain::new().with(
        "read-only-books",
        from_fn(|ctx: &PermissionContext<'_>| {
            if ctx.resource_type == "books" && ctx.method.is_write() {
                Err(Denied("books are read-only".into()))
            } else {
                Ok(())
            }
        }),
    ));
    let body = resource_body("books", json!({"title": "x", "year": 1}), json!({}));
    let err = service.create("books", &body, &QueryParams::default()).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden { ref hook, .. } if hook == "read-only-books"));
    assert!(f.rows("books").is_empty());

    // Reads pass the same chain.
    service.query("books", &QueryParams::default()).await.unwrap();
}

#[tokio::test]
async fn bad_read_back_parameters_fail_before_the_write() {
    let f = fixture();
    let body = resource_body("books", json!({"title": "Dune", "year": 1965}), json!({}));
    let err = f
        .service
        .create("books", &body, &params(&[("include", "bogus")]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInclude { ref segment, .. } if segment == "bogus"), "{err}");
    assert!(f.rows("books").is_empty());

    let id = f.create("books", json!({"title": "Dune", "year": 1965}), json!({})).await;
    let mut patch = resource_body("books", json!({"title": "Children of Dune"}), json!({}));
    patch.data.id = Some(id.clone());
    let err = f
        .service
        .update("books", &id, &patch, UpdateMode::Patch, &params(&[("sort", "publisher_id")]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidSortField { .. }), "{err}");
    assert_eq!(f.rows("books")[0]["title"], json!("Dune"));
}

#[tokio::test]
async fn deleting_a_parent_clears_nullable_references() {
    let f = fixture();
    seed_catalogue(&f).await;
    f.service.delete("publishers", "1").await.unwrap();
    assert_eq!(publisher_ids(&f), vec![Value::Null, Value::Null, Value::Null]);

    let doc = to_json(&f.service.get("books", "1", &params(&[("include", "publisher")])).await.unwrap());
    assert_eq!(doc["data"]["relationships"]["publisher"]["data"], Value::Null);
    assert!(doc.get("included").map_or(true, |i| i.as_array().is_some_and(|i| i.is_empty())));
}

#[tokio::test]
async fn required_references_block_the_delete() {
    let mut registry = SchemaRegistry::new();
    registry
        .register(ResourceSchema::builder("shelves").column("label", ColumnDef::string().required()).build())
        .unwrap();
    registry
        .register(
            ResourceSchema::builder("slots")
                .column("code", ColumnDef::string().required())
                .belongs_to_required("shelf_id", "shelves", "shelf")
                .build(),
        )
        .unwrap();
    registry.finalize().unwrap();
    let registry = Arc::new(registry);
    let storage = MemoryStorage::for_registry(&registry).unwrap();
    let service = ResourceService::new(registry, ApiSettings::default(), Arc::new(storage.clone())).unwrap();

    let create = |type_name: &str, attributes: Value, relationships: Value| {
        let body = resource_body(type_name, attributes, relationships);
        let service = service.clone();
        let type_name = type_name.to_string();
        async move { service.create(&type_name, &body, &QueryParams::default()).await.unwrap() }
    };
    create("shelves", json!({"label": "fiction"}), json!({})).await;
    create("shelves", json!({"label": "empty"}), json!({})).await;
    create("slots", json!({"code": "A1"}), json!({"shelf": {"data": identifier("shelves", "1")}})).await;

    let err = service.delete("shelves", "1").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(ref v) if v[0].field == "slots.shelf_id"), "{err}");
    assert_eq!(storage.rows("shelves").unwrap().len(), 2);
    assert_eq!(storage.rows("slots").unwrap().len(), 1);

    service.delete("shelves", "2").await.unwrap();
    assert_eq!(storage.rows("shelves").unwrap().len(), 1);
}

#[tokio::test]
async fn create_with_direct_members_claims_the_children() {
    let f = fixture();
    seed_catalogue(&f).await;
    let id = f
        .create(
            "publishers",
            json!({"name": "Gollancz"}),
            json!({"books": {"data": [identifier("books", "2"), identifier("books", "3")]}}),
        )
        .await;
    assert_eq!(id, "3");
    assert_eq!(publisher_ids(&f), vec![json!(1), json!(3), json!(3)]);
}

#[tokio::test]
async fn removing_direct_members_nulls_their_key() {
    let f = fixture();
    seed_catalogue(&f).await;
    let doc = f
        .service
        .delete_relationship("publishers", "1", "books", &books(&["1"]))
        .await
        .unwrap();
    let mut linked = pairs(&to_json(&doc)["data"]);
    linked.sort();
    assert_eq!(
        linked,
        vec![("books".to_string(), "2".to_string()), ("books".to_string(), "3".to_string())]
    );
    assert_eq!(publisher_ids(&f), vec![Value::Null, json!(1), json!(1)]);
    assert_eq!(f.rows("books").len(), 3);
}

#[tokio::test]
async fn replacing_direct_members_detaches_stale_children() {
    let f = fixture();
    seed_catalogue(&f).await;
    let doc = f
        .service
        .replace_relationship("publishers", "2", "books", &books(&["3"]))
        .await
        .unwrap();
    assert_eq!(pairs(&to_json(&doc)["data"]), vec![("books".to_string(), "3".to_string())]);
    assert_eq!(publisher_ids(&f), vec![json!(1), json!(1), json!(2)]);

    f.service
        .replace_relationship("publishers", "1", "books", &books(&["2"]))
        .await
        .unwrap();
    assert_eq!(publisher_ids(&f), vec![Value::Null, json!(1), json!(2)]);
}

#[tokio::test]
async fn detaching_children_with_a_required_key_is_refused() {
    let f = fixture();
    seed_catalogue(&f).await;
    let credits = Linkage::Many(vec![ResourceIdentifier::new("book_authors", "1")]);
    let err = f
        .service
        .delete_relationship("books", "1", "credits", &credits)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(ref v) if v[0].field == "credits"), "{err}");
    assert_eq!(f.rows("book_authors").len(), 4);
}

#[tokio::test]
async fn foreign_keys_in_attributes_must_reference_existing_records() {
    let f = fixture();
    seed_catalogue(&f).await;
    let body = resource_body("books", json!({"title": "Parable", "year": 1993, "publisher_id": 99}), json!({}));
    let err = f
        .service
        .create("books", &body, &QueryParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(ref v) if v[0].field == "publisher_id"), "{err}");
    assert_eq!(f.rows("books").len(), 3);

    let mut patch = resource_body("books", json!({"publisher_id": 2}), json!({}));
    patch.data.id = Some("1".into());
    f.service
        .update("books", "1", &patch, UpdateMode::Patch, &QueryParams::default())
        .await
        .unwrap();
    assert_eq!(publisher_ids(&f)[0], json!(2));
}
