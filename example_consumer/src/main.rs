//! Example consumer: serves the resources declared under `resources/` as a JSON:API.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! With `DATABASE_URL` set the resources live in PostgreSQL (tables are created on start);
//! otherwise an in-memory store is used.

use architect_jsonapi::{
    apply_migrations, common_routes_with_ready, from_fn, load_from_dir, resolve, resource_routes, ApiSettings, AppState,
    ComputeFn, Denied, HookChain, Method, MemoryStorage, PgStorage, ResourceService, Storage, Transform,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;

fn transforms() -> architect_jsonapi::TransformRegistry {
    architect_jsonapi::TransformRegistry::new()
        .with_transform(
            "trim",
            Transform::pure(|v, _| {
                Ok(match v {
                    Value::String(s) => Value::String(s.trim().to_string()),
                    other => other,
                })
            }),
        )
        .with_transform(
            "lowercase",
            Transform::pure(|v, _| {
                Ok(match v {
                    Value::String(s) => Value::String(s.to_lowercase()),
                    other => other,
                })
            }),
        )
        .with_compute(
            "display_name",
            ComputeFn::new(|attrs| {
                let first = attrs.get("first_name").and_then(Value::as_str).unwrap_or_default();
                let last = attrs.get("last_name").and_then(Value::as_str).unwrap_or_default();
                Ok(Value::String(format!("{} {}", first, last).trim().to_string()))
            }),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("architect_jsonapi=info,example_consumer=info")),
        )
        .init();

    let settings = ApiSettings::from_env()?;
    let dir = std::env::var("ARCHITECT_RESOURCES_DIR").unwrap_or_else(|_| "example_consumer/resources".into());
    let configs = load_from_dir(&dir).await?;
    let registry = Arc::new(resolve(&configs, &transforms())?);

    let storage: Arc<dyn Storage> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            apply_migrations(&pool, &registry).await?;
            Arc::new(PgStorage::new(pool))
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using in-memory storage");
            Arc::new(MemoryStorage::for_registry(&registry)?)
        }
    };

    let hooks = HookChain::new().with(
        "keep-people",
        from_fn(|ctx| {
            if ctx.resource_type == "people" && ctx.method == Method::Delete {
                Err(Denied("people cannot be deleted".into()))
            } else {
                Ok(())
            }
        }),
    );
    let service = ResourceService::new(registry, settings, storage)?.with_hooks(hooks);
    let state = AppState::new(service);

    let app = common_routes_with_ready(state.clone()).merge(resource_routes(state));
    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Example consumer listening on http://127.0.0.1:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
