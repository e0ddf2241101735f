//! Resource handlers: collection, single resource, related resources and relationship linkage.

use crate::document::{LinkageDocument, ResourceDocument};
use crate::error::AppError;
use crate::query::QueryParams;
use crate::response;
use crate::state::AppState;
use crate::write::UpdateMode;
use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

type Pairs = Query<Vec<(String, String)>>;

fn params(Query(pairs): Pairs) -> Result<QueryParams, AppError> {
    QueryParams::from_pairs(pairs)
}

fn body<T: DeserializeOwned>(value: Value) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("malformed document: {}", e)))
}

pub async fn list(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
    query: Pairs,
) -> Result<Response, AppError> {
    let document = state.service.query(&type_name, &params(query)?).await?;
    Ok(response::ok(document))
}

pub async fn create(
    State(state): State<AppState>,
    Path(type_name): Path<String>,
    query: Pairs,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    let input: ResourceDocument = body(payload)?;
    let document = state.service.create(&type_name, &input, &params(query)?).await?;
    Ok(response::created(document))
}

pub async fn read(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, String)>,
    query: Pairs,
) -> Result<Response, AppError> {
    let document = state.service.get(&type_name, &id, &params(query)?).await?;
    Ok(response::ok(document))
}

async fn write(state: AppState, type_name: String, id: String, query: Pairs, payload: Value, mode: UpdateMode) -> Result<Response, AppError> {
    let input: ResourceDocument = body(payload)?;
    let document = state
        .service
        .update(&type_name, &id, &input, mode, &params(query)?)
        .await?;
    Ok(response::ok(document))
}

pub async fn patch(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, String)>,
    query: Pairs,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    write(state, type_name, id, query, payload, UpdateMode::Patch).await
}

pub async fn put(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, String)>,
    query: Pairs,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    write(state, type_name, id, query, payload, UpdateMode::Put).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path((type_name, id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    state.service.delete(&type_name, &id).await?;
    Ok(response::no_content())
}

pub async fn related(
    State(state): State<AppState>,
    Path((type_name, id, alias)): Path<(String, String, String)>,
    query: Pairs,
) -> Result<Response, AppError> {
    let document = state
        .service
        .get_related(&type_name, &id, &alias, &params(query)?)
        .await?;
    Ok(response::ok(document))
}

pub async fn relationship(
    State(state): State<AppState>,
    Path((type_name, id, alias)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let document = state.service.get_relationship(&type_name, &id, &alias).await?;
    Ok(response::ok(document))
}

pub async fn add_members(
    State(state): State<AppState>,
    Path((type_name, id, alias)): Path<(String, String, String)>,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    let input: LinkageDocument = body(payload)?;
    let document = state
        .service
        .add_relationship(&type_name, &id, &alias, &input.data)
        .await?;
    Ok(response::ok(document))
}

pub async fn replace_members(
    State(state): State<AppState>,
    Path((type_name, id, alias)): Path<(String, String, String)>,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    let input: LinkageDocument = body(payload)?;
    let document = state
        .service
        .replace_relationship(&type_name, &id, &alias, &input.data)
        .await?;
    Ok(response::ok(document))
}

pub async fn remove_members(
    State(state): State<AppState>,
    Path((type_name, id, alias)): Path<(String, String, String)>,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    let input: LinkageDocument = body(payload)?;
    let document = state
        .service
        .delete_relationship(&type_name, &id, &alias, &input.data)
        .await?;
    Ok(response::ok(document))
}
