//! Field transforms: getters, setters and compute functions bound to schema fields.
//!
//! A transform receives the field's current value and the record's attribute map as it
//! stands at that point of the pipeline (earlier fields already transformed).

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by user transform code. Wrapped into `SetterError`/`GetterError` with
/// the field name by the pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        TransformError(message.into())
    }
}

#[async_trait]
pub trait FieldTransform: Send + Sync {
    async fn apply(&self, value: Value, attributes: &Map<String, Value>) -> Result<Value, TransformError>;
}

/// Synchronous transform.
pub struct PureTransform<F>(pub F);

#[async_trait]
impl<F> FieldTransform for PureTransform<F>
where
    F: Fn(Value, &Map<String, Value>) -> Result<Value, TransformError> + Send + Sync,
{
    async fn apply(&self, value: Value, attributes: &Map<String, Value>) -> Result<Value, TransformError> {
        (self.0)(value, attributes)
    }
}

/// Asynchronous transform. The closure gets an owned snapshot of the attributes.
pub struct AsyncTransform<F>(pub F);

#[async_trait]
impl<F> FieldTransform for AsyncTransform<F>
where
    F: Fn(Value, Map<String, Value>) -> BoxFuture<'static, Result<Value, TransformError>> + Send + Sync,
{
    async fn apply(&self, value: Value, attributes: &Map<String, Value>) -> Result<Value, TransformError> {
        (self.0)(value, attributes.clone()).await
    }
}

/// Shared handle to a transform; cheap to clone into schemas.
#[derive(Clone)]
pub struct Transform(Arc<dyn FieldTransform>);

impl Transform {
    pub fn pure<F>(f: F) -> Self
    where
        F: Fn(Value, &Map<String, Value>) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        Transform(Arc::new(PureTransform(f)))
    }

    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(Value, Map<String, Value>) -> BoxFuture<'static, Result<Value, TransformError>> + Send + Sync + 'static,
    {
        Transform(Arc::new(AsyncTransform(f)))
    }

    pub fn from_arc(inner: Arc<dyn FieldTransform>) -> Self {
        Transform(inner)
    }

    pub async fn apply(&self, value: Value, attributes: &Map<String, Value>) -> Result<Value, TransformError> {
        self.0.apply(value, attributes).await
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform")
    }
}

/// Pure derivation of a computed field from the post-getter attribute set.
#[derive(Clone)]
pub struct ComputeFn(Arc<dyn Fn(&Map<String, Value>) -> Result<Value, TransformError> + Send + Sync>);

impl ComputeFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        ComputeFn(Arc::new(f))
    }

    pub fn call(&self, attributes: &Map<String, Value>) -> Result<Value, TransformError> {
        (self.0)(attributes)
    }
}

impl fmt::Debug for ComputeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ComputeFn")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[tokio::test]
    async fn pure_and_async_transforms_apply() {
        let upper = Transform::pure(|v, _| Ok(Value::String(v.as_str().unwrap_or_default().to_uppercase())));
        let attrs = Map::new();
        assert_eq!(upper.apply(json!("abc"), &attrs).await.unwrap(), json!("ABC"));

        let suffix = Transform::asynchronous(|v, attrs| {
            async move {
                let tail = attrs.get("tail").and_then(Value::as_str).unwrap_or("").to_string();
                Ok(Value::String(format!("{}{}", v.as_str().unwrap_or(""), tail)))
            }
            .boxed()
        });
        let mut attrs = Map::new();
        attrs.insert("tail".into(), json!("!"));
        assert_eq!(suffix.apply(json!("hi"), &attrs).await.unwrap(), json!("hi!"));
    }
}
