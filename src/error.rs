//! Typed errors and HTTP mapping.

use crate::hooks::Method;
use crate::store::StorageError;
use crate::transform::TransformError;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// One offending field of a `ValidationError`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldViolation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Method, resource type and id of the operation a storage failure happened in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationContext {
    pub method: Method,
    pub resource_type: String,
    pub id: Option<String>,
}

impl OperationContext {
    pub fn new(method: Method, resource_type: impl Into<String>, id: Option<String>) -> Self {
        OperationContext {
            method,
            resource_type: resource_type.into(),
            id,
        }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} {}/{}", self.method, self.resource_type, id),
            None => write!(f, "{} {}", self.method, self.resource_type),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown resource type: {0}")]
    UnknownResource(String),
    #[error("resource type already registered: {0}")]
    DuplicateResource(String),
    #[error("invalid schema for {resource}: {reason}")]
    InvalidSchema { resource: String, reason: String },
    #[error("unknown field '{field}' on {resource}")]
    UnknownField { resource: String, field: String },
    #[error("cyclic field dependency on {resource}: {}", .cycle.join(" -> "))]
    CyclicDependency { resource: String, cycle: Vec<String> },
    #[error("setter for '{field}' failed: {source}")]
    Setter {
        field: String,
        #[source]
        source: TransformError,
    },
    #[error("getter for '{field}' failed: {source}")]
    Getter {
        field: String,
        #[source]
        source: TransformError,
    },
    #[error("invalid sort field '{field}' for {resource}")]
    InvalidSortField { resource: String, field: String },
    #[error("invalid include '{path}': unknown relationship '{segment}'")]
    InvalidInclude { path: String, segment: String },
    #[error("include '{path}' exceeds maximum depth {max} at '{segment}'")]
    IncludeDepthExceeded { path: String, segment: String, max: usize },
    #[error("relationship '{alias}' not found on {resource}")]
    RelationshipNotFound { resource: String, alias: String },
    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },
    #[error("validation: {}", summarize(.0))]
    Validation(Vec<FieldViolation>),
    #[error("forbidden by {hook}: {message}")]
    Forbidden { hook: String, message: String },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("storage error during {context}: {source}")]
    Storage {
        context: OperationContext,
        #[source]
        source: StorageError,
    },
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation(vec![FieldViolation::new(field, message)])
    }

    pub fn invalid_schema(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::InvalidSchema {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        AppError::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Stable taxonomy code handed to the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::UnknownResource(_) => "unknown_resource",
            AppError::DuplicateResource(_) => "duplicate_resource",
            AppError::InvalidSchema { .. } => "invalid_schema",
            AppError::UnknownField { .. } => "unknown_field",
            AppError::CyclicDependency { .. } => "cyclic_dependency",
            AppError::Setter { .. } => "setter_error",
            AppError::Getter { .. } => "getter_error",
            AppError::InvalidSortField { .. } => "invalid_sort_field",
            AppError::InvalidInclude { .. } => "invalid_include",
            AppError::IncludeDepthExceeded { .. } => "include_depth_exceeded",
            AppError::RelationshipNotFound { .. } => "relationship_not_found",
            AppError::NotFound { .. } => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::Forbidden { .. } => "forbidden",
            AppError::BadRequest(_) => "bad_request",
            AppError::Storage { .. } => "storage_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::UnknownResource(_)
            | AppError::NotFound { .. }
            | AppError::RelationshipNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::UnknownField { .. }
            | AppError::InvalidSortField { .. }
            | AppError::InvalidInclude { .. }
            | AppError::IncludeDepthExceeded { .. }
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) | AppError::Setter { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::Storage { source, .. } if source.is_conflict() => StatusCode::CONFLICT,
            AppError::Config(_)
            | AppError::DuplicateResource(_)
            | AppError::InvalidSchema { .. }
            | AppError::CyclicDependency { .. }
            | AppError::Getter { .. }
            | AppError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Attaches operation context to storage results.
pub trait StorageResultExt<T> {
    fn context(self, ctx: &OperationContext) -> Result<T, AppError>;
}

impl<T> StorageResultExt<T> for Result<T, StorageError> {
    fn context(self, ctx: &OperationContext) -> Result<T, AppError> {
        self.map_err(|source| AppError::Storage {
            context: ctx.clone(),
            source,
        })
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub errors: Vec<ErrorDetail>,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub status: String,
    pub code: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
}

#[derive(Serialize)]
pub struct ErrorSource {
    pub pointer: String,
}

impl AppError {
    pub fn to_body(&self) -> ErrorBody {
        let status = self.status().as_u16().to_string();
        let errors = match self {
            AppError::Validation(violations) => violations
                .iter()
                .map(|v| ErrorDetail {
                    status: status.clone(),
                    code: self.code().to_string(),
                    title: format!("{} {}", v.field, v.message),
                    source: Some(ErrorSource {
                        pointer: format!("/data/attributes/{}", v.field),
                    }),
                })
                .collect(),
            other => vec![ErrorDetail {
                status,
                code: other.code().to_string(),
                title: other.to_string(),
                source: None,
            }],
        };
        ErrorBody { errors }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }
        let body = self.to_body();
        (
            status,
            [(header::CONTENT_TYPE, crate::response::JSON_API_MEDIA_TYPE)],
            Json(body),
        )
            .into_response()
    }
}
