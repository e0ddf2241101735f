//! ResourceService: one entry point per JSON:API operation.

use crate::config::settings::ApiSettings;
use crate::document::{
    Document, DocumentAssembler, DocumentLinks, Linkage, PrimaryData, RelationshipDocument, ResourceDocument,
};
use crate::error::{AppError, ConfigError, OperationContext, StorageResultExt};
use crate::hooks::{HookChain, Method, PermissionContext};
use crate::pipeline::plan_columns;
use crate::query::{CompiledQuery, LoadedRelations, QueryCompiler, QueryParams};
use crate::resolver::{self, JoinStrategy, LoadOptions};
use crate::schema::{ResourceSchema, SchemaRegistry};
use crate::store::{value_key, Condition, Row, Select, Storage};
use crate::write::{identity_value, UpdateMode, WriteCoordinator};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct ResourceService {
    registry: Arc<SchemaRegistry>,
    settings: Arc<ApiSettings>,
    storage: Arc<dyn Storage>,
    hooks: Arc<HookChain>,
}

impl ResourceService {
    /// The registry must be finalized.
    pub fn new(registry: Arc<SchemaRegistry>, settings: ApiSettings, storage: Arc<dyn Storage>) -> Result<Self, AppError> {
        if !registry.is_finalized() {
            return Err(ConfigError::Validation("schema registry must be finalized before serving".into()).into());
        }
        Ok(ResourceService {
            registry,
            settings: Arc::new(settings),
            storage,
            hooks: Arc::new(HookChain::new()),
        })
    }

    pub fn with_hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    fn assembler(&self) -> DocumentAssembler<'_> {
        DocumentAssembler::new(&self.registry, &self.settings.base_url)
    }

    async fn authorize(
        &self,
        method: Method,
        resource_type: &str,
        id: Option<&str>,
        attributes: Option<&Map<String, Value>>,
    ) -> Result<(), AppError> {
        self.hooks
            .check(&PermissionContext {
                method,
                resource_type,
                id,
                attributes,
            })
            .await
    }

    /// `GET /{type}`.
    pub async fn query(&self, type_name: &str, params: &QueryParams) -> Result<Document, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::Query, type_name, None, None).await?;
        let ctx = OperationContext::new(Method::Query, type_name, None);
        let query = QueryCompiler::new(&self.registry, &self.settings).compile(type_name, params, None)?;
        let result = query.execute(self.storage.as_ref()).await.context(&ctx)?;
        let assembler = self.assembler();
        let path = assembler.links().collection(&schema.type_name);
        assembler.collection(&query, &result, &path).await
    }

    /// `GET /{type}/{id}`.
    pub async fn get(&self, type_name: &str, id: &str, params: &QueryParams) -> Result<Document, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::Get, type_name, Some(id), None).await?;
        self.fetch(schema, id, params, Method::Get).await
    }

    async fn fetch(&self, schema: &ResourceSchema, id: &str, params: &QueryParams, method: Method) -> Result<Document, AppError> {
        let owner = identity_value(&self.registry, schema, id)?;
        let query = self.read_back_plan(schema, params)?;
        self.fetch_compiled(query, owner, id, method).await
    }

    /// Single-record plan without its identity scope. Compiling up front means a bad
    /// `include`, `sort` or `fields` is rejected before anything touches storage.
    fn read_back_plan(&self, schema: &ResourceSchema, params: &QueryParams) -> Result<CompiledQuery<'_>, AppError> {
        let mut params = params.clone();
        params.page = Default::default();
        QueryCompiler::new(&self.registry, &self.settings).compile(&schema.type_name, &params, None)
    }

    async fn fetch_compiled(&self, query: CompiledQuery<'_>, owner: Value, id: &str, method: Method) -> Result<Document, AppError> {
        let schema = query.schema;
        let ctx = OperationContext::new(method, &schema.type_name, Some(id.to_string()));
        let query = query.scoped(Condition::eq(schema.id_property.as_str(), owner));
        let result = query.execute(self.storage.as_ref()).await.context(&ctx)?;
        if result.rows.is_empty() {
            return Err(AppError::not_found(&schema.type_name, id));
        }
        let assembler = self.assembler();
        let path = assembler.links().resource(&schema.type_name, id).self_link;
        assembler.single(&query, &result, &path).await
    }

    /// `GET /{type}/{id}/{alias}`: the related resource(s), with the usual query parameters
    /// applied to the target type.
    pub async fn get_related(&self, type_name: &str, id: &str, alias: &str, params: &QueryParams) -> Result<Document, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::Get, type_name, Some(id), None).await?;
        let ctx = OperationContext::new(Method::Get, type_name, Some(id.to_string()));
        let plan = resolver::resolve(&self.registry, schema, alias)?;

        // One plan per possible target type; a polymorphic alias only needs the
        // parameters to make sense for one of them.
        let mut params = params.clone();
        if plan.is_to_one() {
            params.page = Default::default();
        }
        let compiler = QueryCompiler::new(&self.registry, &self.settings);
        let mut compiled: Vec<(String, Result<CompiledQuery<'_>, AppError>)> = plan
            .target_schemas()
            .into_iter()
            .map(|target| (target.type_name.clone(), compiler.compile(&target.type_name, &params, None)))
            .collect();
        if compiled.iter().all(|(_, query)| query.is_err()) {
            let first = compiled.into_iter().find_map(|(_, query)| query.err());
            return Err(first.unwrap_or_else(|| AppError::RelationshipNotFound {
                resource: type_name.to_string(),
                alias: alias.to_string(),
            }));
        }

        let row = self.load_row(schema, id, &ctx).await?;
        let children = plan
            .load_batch(self.storage.as_ref(), std::slice::from_ref(&row), &LoadOptions::default())
            .await
            .context(&ctx)?
            .into_values()
            .next()
            .unwrap_or_default();

        let assembler = self.assembler();
        let path = assembler.links().relationship(type_name, id, alias).related;
        let target_type = match (&plan.strategy, children.first()) {
            (JoinStrategy::Polymorphic { .. }, Some(child)) => child.type_name.clone(),
            (JoinStrategy::Polymorphic { .. }, None) => {
                return Ok(Document {
                    data: PrimaryData::Null,
                    included: Vec::new(),
                    links: DocumentLinks {
                        self_link: path,
                        ..Default::default()
                    },
                    meta: None,
                })
            }
            _ => compiled[0].0.clone(),
        };
        let position = compiled
            .iter()
            .position(|(name, _)| *name == target_type)
            .ok_or_else(|| AppError::UnknownResource(target_type.clone()))?;
        let query = compiled.swap_remove(position).1?;
        let target = query.schema;
        let ids: Vec<Value> = children
            .iter()
            .filter_map(|c| c.row.get(&target.id_property).cloned())
            .collect();
        let query = query.scoped(Condition::is_in(target.id_property.as_str(), ids));
        let result = query.execute(self.storage.as_ref()).await.context(&ctx)?;
        if plan.is_to_one() {
            assembler.single(&query, &result, &path).await
        } else {
            assembler.collection(&query, &result, &path).await
        }
    }

    /// `GET /{type}/{id}/relationships/{alias}`.
    pub async fn get_relationship(&self, type_name: &str, id: &str, alias: &str) -> Result<RelationshipDocument, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::Get, type_name, Some(id), None).await?;
        self.linkage(schema, id, alias, Method::Get).await
    }

    async fn linkage(&self, schema: &ResourceSchema, id: &str, alias: &str, method: Method) -> Result<RelationshipDocument, AppError> {
        let ctx = OperationContext::new(method, &schema.type_name, Some(id.to_string()));
        let plan = resolver::resolve(&self.registry, schema, alias)?;
        let row = self.load_row(schema, id, &ctx).await?;
        let key = row.get(&schema.id_property).map(value_key).unwrap_or_default();
        let mut relations = LoadedRelations::default();
        if !plan.definition.is_local() {
            let children = plan
                .load_batch(self.storage.as_ref(), std::slice::from_ref(&row), &LoadOptions::default())
                .await
                .context(&ctx)?
                .remove(&key)
                .unwrap_or_default();
            relations.insert(&schema.type_name, key, alias, children);
        }
        let assembler = self.assembler();
        let mut resource = assembler
            .resource(schema, &row, &plan_columns(schema, None)?, &relations)
            .await?;
        let relationship = resource.relationships.remove(alias).ok_or_else(|| AppError::RelationshipNotFound {
            resource: schema.type_name.clone(),
            alias: alias.to_string(),
        })?;
        Ok(RelationshipDocument {
            data: relationship.data,
            links: assembler.links().relationship(&schema.type_name, id, alias),
        })
    }

    async fn load_row(&self, schema: &ResourceSchema, id: &str, ctx: &OperationContext) -> Result<Row, AppError> {
        let owner = identity_value(&self.registry, schema, id)?;
        let select = Select::from(self.registry.table_ref(schema))
            .filter(Condition::eq(schema.id_property.as_str(), owner))
            .limit(1);
        self.storage
            .select(&select)
            .await
            .context(ctx)?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::not_found(&schema.type_name, id))
    }

    /// `POST /{type}`. Returns the created resource as it reads back.
    pub async fn create(&self, type_name: &str, body: &ResourceDocument, params: &QueryParams) -> Result<Document, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::Post, type_name, body.data.id.as_deref(), Some(&body.data.attributes))
            .await?;
        let query = self.read_back_plan(schema, params)?;
        let id = WriteCoordinator::new(&self.registry, self.storage.as_ref())
            .create(schema, &body.data)
            .await?;
        let key = value_key(&id);
        self.fetch_compiled(query, id, &key, Method::Post).await
    }

    /// `PATCH` or `PUT /{type}/{id}`.
    pub async fn update(
        &self,
        type_name: &str,
        id: &str,
        body: &ResourceDocument,
        mode: UpdateMode,
        params: &QueryParams,
    ) -> Result<Document, AppError> {
        let schema = self.registry.resolve(type_name)?;
        let method = match mode {
            UpdateMode::Patch => Method::Patch,
            UpdateMode::Put => Method::Put,
        };
        self.authorize(method, type_name, Some(id), Some(&body.data.attributes)).await?;
        let owner = identity_value(&self.registry, schema, id)?;
        let query = self.read_back_plan(schema, params)?;
        WriteCoordinator::new(&self.registry, self.storage.as_ref())
            .update(schema, id, &body.data, mode)
            .await?;
        self.fetch_compiled(query, owner, id, method).await
    }

    /// `DELETE /{type}/{id}`.
    pub async fn delete(&self, type_name: &str, id: &str) -> Result<(), AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::Delete, type_name, Some(id), None).await?;
        WriteCoordinator::new(&self.registry, self.storage.as_ref())
            .delete(schema, id)
            .await
    }

    /// `POST /{type}/{id}/relationships/{alias}`.
    pub async fn add_relationship(&self, type_name: &str, id: &str, alias: &str, linkage: &Linkage) -> Result<RelationshipDocument, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::AddRelationship, type_name, Some(id), None).await?;
        WriteCoordinator::new(&self.registry, self.storage.as_ref())
            .add_relationship(schema, id, alias, linkage)
            .await?;
        self.linkage(schema, id, alias, Method::AddRelationship).await
    }

    /// `PATCH /{type}/{id}/relationships/{alias}`.
    pub async fn replace_relationship(
        &self,
        type_name: &str,
        id: &str,
        alias: &str,
        linkage: &Linkage,
    ) -> Result<RelationshipDocument, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::ReplaceRelationship, type_name, Some(id), None).await?;
        WriteCoordinator::new(&self.registry, self.storage.as_ref())
            .replace_relationship(schema, id, alias, linkage)
            .await?;
        self.linkage(schema, id, alias, Method::ReplaceRelationship).await
    }

    /// `DELETE /{type}/{id}/relationships/{alias}`.
    pub async fn delete_relationship(
        &self,
        type_name: &str,
        id: &str,
        alias: &str,
        linkage: &Linkage,
    ) -> Result<RelationshipDocument, AppError> {
        let schema = self.registry.resolve(type_name)?;
        self.authorize(Method::DeleteRelationship, type_name, Some(id), None).await?;
        WriteCoordinator::new(&self.registry, self.storage.as_ref())
            .delete_relationship(schema, id, alias, linkage)
            .await?;
        self.linkage(schema, id, alias, Method::DeleteRelationship).await
    }
}
