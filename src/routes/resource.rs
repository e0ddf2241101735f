//! JSON:API routes. Handlers resolve the resource type from the first path segment.

use crate::handlers::resource::{
    add_members, create, delete as delete_handler, list, patch, put, read, related, relationship, remove_members,
    replace_members,
};
use crate::state::AppState;
use axum::{routing::get, Router};
use tower_http::limit::RequestBodyLimitLayer;

/// Default cap on request bodies.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

pub fn resource_routes(state: AppState) -> Router {
    resource_routes_with_limit(state, DEFAULT_BODY_LIMIT)
}

pub fn resource_routes_with_limit(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/:type_name", get(list).post(create))
        .route(
            "/:type_name/:id",
            get(read).patch(patch).put(put).delete(delete_handler),
        )
        .route(
            "/:type_name/:id/relationships/:alias",
            get(relationship)
                .post(add_members)
                .patch(replace_members)
                .delete(remove_members),
        )
        .route("/:type_name/:id/:alias", get(related))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}
