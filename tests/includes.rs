use architect_jsonapi::config::ApiSettings;
use architect_jsonapi::AppError;
use serde_json::json;

mod common;
use common::{fixture, fixture_with, pairs, params, seed_catalogue, to_json};

#[tokio::test]
async fn many_to_many_include_lists_every_author_once() {
    let f = fixture();
    seed_catalogue(&f).await;

    let doc = to_json(&f.service.query("books", &params(&[("include", "authors")])).await.unwrap());
    let books = doc["data"].as_array().unwrap();
    assert_eq!(books.len(), 3);
    assert_eq!(
        pairs(&books[0]["relationships"]["authors"]["data"]),
        vec![("authors".to_string(), "1".to_string()), ("authors".to_string(), "2".to_string())]
    );
    assert_eq!(pairs(&books[1]["relationships"]["authors"]["data"]), vec![("authors".to_string(), "2".to_string())]);

    // Herbert is linked from two books but included once.
    let mut included = pairs(&doc["included"]);
    included.sort();
    assert_eq!(
        included,
        vec![
            ("authors".to_string(), "1".to_string()),
            ("authors".to_string(), "2".to_string()),
            ("authors".to_string(), "3".to_string()),
        ]
    );
}

#[tokio::test]
async fn single_book_includes_its_two_authors() {
    let f = fixture();
    seed_catalogue(&f).await;
    let doc = to_json(&f.service.get("books", "1", &params(&[("include", "authors")])).await.unwrap());
    let linked = pairs(&doc["data"]["relationships"]["authors"]["data"]);
    assert_eq!(linked.len(), 2);
    let mut included = pairs(&doc["included"]);
    included.sort();
    assert_eq!(included, linked);
}

#[tokio::test]
async fn pivot_extras_appear_under_meta() {
    let f = fixture();
    let book = f.create("books", json!({"title": "Good Omens", "year": 1990}), json!({})).await;
    let author = f.create("authors", json!({"name": "Pratchett"}), json!({})).await;
    f.insert_raw(
        "book_authors",
        json!({"book_id": book.parse::<i64>().unwrap(), "author_id": author.parse::<i64>().unwrap(), "role": "co-author"}),
    )
    .await;

    let doc = to_json(&f.service.get("books", &book, &params(&[("include", "authors")])).await.unwrap());
    let linkage = &doc["data"]["relationships"]["authors"]["data"][0];
    assert_eq!(linkage["id"], json!(author));
    assert_eq!(linkage["meta"]["pivot"]["role"], json!("co-author"));
}

#[tokio::test]
async fn nested_include_and_to_one_linkage() {
    let f = fixture();
    seed_catalogue(&f).await;

    let doc = to_json(
        &f.service
            .get("publishers", "1", &params(&[("include", "books.authors")]))
            .await
            .unwrap(),
    );
    let included = pairs(&doc["included"]);
    assert!(included.contains(&("books".to_string(), "3".to_string())));
    assert!(included.contains(&("authors".to_string(), "3".to_string())));

    let book = doc["included"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["type"] == "books")
        .unwrap();
    assert_eq!(book["relationships"]["publisher"]["data"], json!({"type": "publishers", "id": "1"}));
    // The publisher is primary data and is never repeated in `included`.
    assert!(!included.contains(&("publishers".to_string(), "1".to_string())));
}

#[tokio::test]
async fn include_depth_is_enforced_per_path() {
    let f = fixture_with(ApiSettings {
        max_include_depth: 2,
        ..ApiSettings::default()
    });
    seed_catalogue(&f).await;

    f.service
        .get("publishers", "1", &params(&[("include", "books.authors")]))
        .await
        .unwrap();
    let err = f
        .service
        .get("publishers", "1", &params(&[("include", "books.authors.books")]))
        .await
        .unwrap_err();
    match err {
        AppError::IncludeDepthExceeded { segment, max, .. } => {
            assert_eq!(segment, "books");
            assert_eq!(max, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unknown_include_segment_is_rejected() {
    let f = fixture();
    seed_catalogue(&f).await;
    let err = f
        .service
        .query("books", &params(&[("include", "publisher.owner")]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInclude { ref segment, .. } if segment == "owner"));
}

#[tokio::test]
async fn sparse_fieldsets_apply_to_included_types() {
    let f = fixture();
    seed_catalogue(&f).await;
    let doc = to_json(
        &f.service
            .query("books", &params(&[("include", "publisher"), ("fields[books]", "title"), ("fields[publishers]", "name")]))
            .await
            .unwrap(),
    );
    let attributes = doc["data"][0]["attributes"].as_object().unwrap();
    assert_eq!(attributes.keys().collect::<Vec<_>>(), vec!["title"]);
    assert_eq!(doc["included"][0]["attributes"], json!({"name": "Penguin"}));
}

#[tokio::test]
async fn has_one_keeps_the_first_of_several_matches() {
    let f = fixture();
    seed_catalogue(&f).await;

    // Penguin publishes all three books.
    let doc = to_json(&f.service.get("publishers", "1", &params(&[("include", "flagship")])).await.unwrap());
    assert_eq!(doc["data"]["relationships"]["flagship"]["data"], json!({"type": "books", "id": "1"}));
    assert_eq!(pairs(&doc["included"]), vec![("books".to_string(), "1".to_string())]);

    // Herbert is credited on Earthsea and Dune.
    let doc = to_json(&f.service.get_relationship("authors", "2", "first_book").await.unwrap());
    assert_eq!((&doc["data"]["type"], &doc["data"]["id"]), (&json!("books"), &json!("1")));

    let doc = to_json(&f.service.get_related("authors", "2", "first_book", &params(&[])).await.unwrap());
    assert_eq!(doc["data"]["id"], json!("1"));
    assert_eq!(doc["data"]["attributes"]["title"], json!("Earthsea"));
}

#[tokio::test]
async fn has_one_without_a_match_is_null() {
    let f = fixture();
    seed_catalogue(&f).await;
    let doc = to_json(&f.service.get_relationship("publishers", "2", "flagship").await.unwrap());
    assert_eq!(doc["data"], serde_json::Value::Null);
}
