//! Permission hooks: an ordered chain of named checks run before each operation.

use crate::error::AppError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Query,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    DeleteRelationship,
    AddRelationship,
    ReplaceRelationship,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Query => "query",
            Method::Get => "get",
            Method::Post => "post",
            Method::Put => "put",
            Method::Patch => "patch",
            Method::Delete => "delete",
            Method::DeleteRelationship => "deleteRelationship",
            Method::AddRelationship => "addRelationship",
            Method::ReplaceRelationship => "replaceRelationship",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Method::Query | Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook gets to look at.
#[derive(Clone, Debug)]
pub struct PermissionContext<'a> {
    pub method: Method,
    pub resource_type: &'a str,
    pub id: Option<&'a str>,
    pub attributes: Option<&'a Map<String, Value>>,
}

/// Veto returned by a hook; the chain turns it into `AppError::Forbidden`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denied(pub String);

#[async_trait]
pub trait PermissionHook: Send + Sync {
    async fn check(&self, ctx: &PermissionContext<'_>) -> Result<(), Denied>;
}

/// Hook backed by a synchronous closure.
pub struct FnHook<F>(F);

/// Wraps a closure as a hook.
pub fn from_fn<F>(f: F) -> FnHook<F>
where
    F: Fn(&PermissionContext<'_>) -> Result<(), Denied> + Send + Sync,
{
    FnHook(f)
}

#[async_trait]
impl<F> PermissionHook for FnHook<F>
where
    F: Fn(&PermissionContext<'_>) -> Result<(), Denied> + Send + Sync,
{
    async fn check(&self, ctx: &PermissionContext<'_>) -> Result<(), Denied> {
        (self.0)(ctx)
    }
}

#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<(String, Arc<dyn PermissionHook>)>,
}

impl HookChain {
    pub fn new() -> Self {
        HookChain::default()
    }

    /// Appends a hook; hooks run in registration order.
    pub fn with(mut self, name: impl Into<String>, hook: impl PermissionHook + 'static) -> Self {
        self.hooks.push((name.into(), Arc::new(hook)));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Runs every hook in order; the first veto wins.
    pub async fn check(&self, ctx: &PermissionContext<'_>) -> Result<(), AppError> {
        for (name, hook) in &self.hooks {
            if let Err(Denied(message)) = hook.check(ctx).await {
                tracing::debug!(hook = %name, method = %ctx.method, resource = ctx.resource_type, "permission denied");
                return Err(AppError::Forbidden {
                    hook: name.clone(),
                    message,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn first_veto_stops_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let chain = HookChain::new()
            .with(
                "read-only",
                from_fn(|ctx| {
                    if ctx.method.is_write() {
                        Err(Denied("writes are disabled".into()))
                    } else {
                        Ok(())
                    }
                }),
            )
            .with(
                "counter",
                from_fn(move |_| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );

        let read = PermissionContext {
            method: Method::Get,
            resource_type: "articles",
            id: Some("1"),
            attributes: None,
        };
        chain.check(&read).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let write = PermissionContext {
            method: Method::Patch,
            ..read
        };
        let err = chain.check(&write).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden { ref hook, .. } if hook == "read-only"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.names(), vec!["read-only", "counter"]);
    }
}
