//! Shared application state for all routes.

use crate::service::ResourceService;

#[derive(Clone)]
pub struct AppState {
    pub service: ResourceService,
}

impl AppState {
    pub fn new(service: ResourceService) -> Self {
        AppState { service }
    }
}
