use architect_jsonapi::AppError;
use serde_json::json;

mod common;
use common::{fixture, identifier, pairs, params, to_json};

#[tokio::test]
async fn polymorphic_target_resolves_in_included() {
    let f = fixture();
    let article = f.create("articles", json!({"headline": "Launch"}), json!({})).await;
    let comment = f
        .create(
            "comments",
            json!({"body": "first!"}),
            json!({"commentable": {"data": identifier("articles", &article)}}),
        )
        .await;

    let doc = to_json(&f.service.get("comments", &comment, &params(&[("include", "commentable")])).await.unwrap());
    assert_eq!(doc["data"]["relationships"]["commentable"]["data"], json!({"type": "articles", "id": article}));
    assert_eq!(pairs(&doc["included"]), vec![("articles".to_string(), article.clone())]);
    assert_eq!(doc["included"][0]["attributes"]["headline"], json!("Launch"));
    // Linkage columns are not attributes.
    assert!(doc["data"]["attributes"].get("commentable_type").is_none());
}

#[tokio::test]
async fn mixed_targets_load_per_type() {
    let f = fixture();
    let article = f.create("articles", json!({"headline": "Launch"}), json!({})).await;
    let book = f.create("books", json!({"title": "Dune", "year": 1965}), json!({})).await;
    for (ty, id) in [("articles", &article), ("books", &book)] {
        f.create("comments", json!({"body": "hi"}), json!({"commentable": {"data": identifier(ty, id)}}))
            .await;
    }
    let doc = to_json(&f.service.query("comments", &params(&[("include", "commentable")])).await.unwrap());
    let mut included = pairs(&doc["included"]);
    included.sort();
    assert_eq!(
        included,
        vec![("articles".to_string(), article), ("books".to_string(), book.clone())]
    );

    let reverse = to_json(&f.service.get("books", &book, &params(&[("include", "comments")])).await.unwrap());
    assert_eq!(pairs(&reverse["data"]["relationships"]["comments"]["data"]).len(), 1);
}

#[tokio::test]
async fn partial_pair_reads_as_null() {
    let f = fixture();
    f.create("articles", json!({"headline": "Launch"}), json!({})).await;
    let row = f.insert_raw("comments", json!({"body": "orphan", "commentable_type": "articles"})).await;
    let id = row["id"].to_string();

    let doc = to_json(&f.service.get("comments", &id, &params(&[("include", "commentable")])).await.unwrap());
    assert_eq!(doc["data"]["relationships"]["commentable"]["data"], json!(null));
    assert!(doc.get("included").is_none());

    let related = to_json(&f.service.get_related("comments", &id, "commentable", &params(&[])).await.unwrap());
    assert_eq!(related["data"], json!(null));
}

#[tokio::test]
async fn partial_pair_is_rejected_on_write() {
    let f = fixture();
    let body = common::resource_body("comments", json!({"body": "x", "commentable_type": "articles"}), json!({}));
    let err = f
        .service
        .create("comments", &body, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err}");
    assert!(f.rows("comments").is_empty());
}

#[tokio::test]
async fn disallowed_target_type_is_rejected() {
    let f = fixture();
    let author = f.create("authors", json!({"name": "Le Guin"}), json!({})).await;
    let body = common::resource_body(
        "comments",
        json!({"body": "x"}),
        json!({"commentable": {"data": identifier("authors", &author)}}),
    );
    let err = f
        .service
        .create("comments", &body, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{err}");
}
