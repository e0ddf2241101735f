use architect_jsonapi::response::JSON_API_MEDIA_TYPE;
use architect_jsonapi::routes::{common_routes_with_ready, resource_routes, resource_routes_with_limit};
use architect_jsonapi::AppState;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

mod common;
use common::{fixture, seed_catalogue};

fn app(state: AppState) -> Router {
    common_routes_with_ready(state.clone()).merge(resource_routes(state))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Option<String>, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            let text = value.to_string();
            request = request
                .header(header::CONTENT_TYPE, JSON_API_MEDIA_TYPE)
                .header(header::CONTENT_LENGTH, text.len());
            Body::from(text)
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, content_type, json)
}

#[tokio::test]
async fn crud_round_trip_over_http() {
    let f = fixture();
    let app = app(AppState::new(f.service.clone()));

    let (status, content_type, doc) = send(
        &app,
        Method::POST,
        "/publishers",
        Some(json!({"data": {"type": "publishers", "attributes": {"name": "Gollancz"}}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(content_type.as_deref(), Some(JSON_API_MEDIA_TYPE));
    let id = doc["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(doc["data"]["links"]["self"], json!(format!("/publishers/{id}")));

    let (status, _, doc) = send(
        &app,
        Method::PATCH,
        &format!("/publishers/{id}"),
        Some(json!({"data": {"type": "publishers", "id": id, "attributes": {"name": "Orion"}}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["data"]["attributes"]["name"], json!("Orion"));

    let (status, _, _) = send(&app, Method::DELETE, &format!("/publishers/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, doc) = send(&app, Method::GET, &format!("/publishers/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(doc["errors"][0]["status"], json!("404"));
}

#[tokio::test]
async fn relationship_and_related_endpoints() {
    let f = fixture();
    seed_catalogue(&f).await;
    let app = app(AppState::new(f.service.clone()));

    let (status, _, doc) = send(&app, Method::GET, "/books/1/relationships/authors", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["data"].as_array().unwrap().len(), 2);
    assert_eq!(doc["links"]["related"], json!("/books/1/authors"));

    let (status, _, doc) = send(&app, Method::GET, "/books/1/authors?sort=name", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["data"][0]["attributes"]["name"], json!("Herbert"));

    let (status, _, doc) = send(&app, Method::GET, "/books/1/publisher", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["data"]["id"], json!("1"));

    let (status, _, doc) = send(
        &app,
        Method::POST,
        "/books/2/relationships/authors",
        Some(json!({"data": [{"type": "authors", "id": "1"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn error_statuses() {
    let f = fixture();
    seed_catalogue(&f).await;
    let app = app(AppState::new(f.service.clone()));

    let (status, _, _) = send(&app, Method::GET, "/dragons", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, doc) = send(&app, Method::GET, "/books?include=nope", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(doc["errors"][0]["code"], json!("invalid_include"));

    let (status, _, doc) = send(
        &app,
        Method::POST,
        "/books",
        Some(json!({"data": {"type": "books", "attributes": {"year": "soon"}}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let pointers: Vec<&str> = doc["errors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["source"]["pointer"].as_str())
        .collect();
    assert!(pointers.contains(&"/data/attributes/title"), "{pointers:?}");
    assert!(pointers.contains(&"/data/attributes/year"), "{pointers:?}");

    let (status, _, _) = send(&app, Method::POST, "/books", Some(json!({"nope": true}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, Method::GET, "/books/1/relationships/nothing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_bodies_are_refused() {
    let f = fixture();
    let app = resource_routes_with_limit(AppState::new(f.service.clone()), 64);
    let big = "x".repeat(1024);
    let (status, _, _) = send(
        &app,
        Method::POST,
        "/publishers",
        Some(json!({"data": {"type": "publishers", "attributes": {"name": big}}})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(f.rows("publishers").is_empty());
}

#[tokio::test]
async fn health_and_ready() {
    let f = fixture();
    let app = app(AppState::new(f.service.clone()));
    let (status, _, doc) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["status"], json!("ok"));

    let (status, _, doc) = send(&app, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["resources"], json!(6));
}
