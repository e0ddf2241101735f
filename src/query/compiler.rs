//! Turns a request's parameters into a base select plus breadth-first include loads.

use crate::config::settings::ApiSettings;
use crate::error::AppError;
use crate::pipeline::{plan_columns, ColumnPlan};
use crate::query::filter::compile_filters;
use crate::query::params::{PageParams, QueryParams};
use crate::resolver::{self, LoadOptions, RelationshipPlan};
use crate::schema::{ResourceSchema, SchemaRegistry};
use crate::store::{CompareOp, Condition, OrderBy, Select};
use serde_json::Value;
use std::collections::HashMap;

/// Pagination window of a compiled query.
#[derive(Clone, Debug, PartialEq)]
pub enum Window {
    Offset { offset: u64, limit: u64 },
    /// Keyset pagination; `after` holds the sort values of the last row already seen.
    Cursor { after: Option<Vec<Value>>, limit: u64 },
}

impl Window {
    pub fn limit(&self) -> u64 {
        match self {
            Window::Offset { limit, .. } | Window::Cursor { limit, .. } => *limit,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

/// One edge of the include tree. A polymorphic parent yields one plan per owner type that
/// declares the alias.
#[derive(Debug)]
pub struct IncludeNode<'r> {
    pub path: String,
    pub alias: String,
    pub plans: Vec<RelationshipPlan<'r>>,
    pub children: Vec<IncludeNode<'r>>,
}

#[derive(Debug)]
pub struct CompiledQuery<'r> {
    pub schema: &'r ResourceSchema,
    pub params: QueryParams,
    pub base: Select,
    pub count: Option<Select>,
    pub window: Window,
    pub sort: Vec<SortKey>,
    pub includes: Vec<IncludeNode<'r>>,
    /// Column plan per resource type the document can contain.
    pub column_plans: HashMap<String, ColumnPlan>,
    pub load_options: LoadOptions,
}

impl CompiledQuery<'_> {
    pub fn column_plan(&self, type_name: &str) -> Option<&ColumnPlan> {
        self.column_plans.get(type_name)
    }

    /// ANDs `scope` into the base and count selects. Lets a caller validate the request
    /// before the scope (a fresh identity, a related id set) is known.
    pub fn scoped(mut self, scope: Condition) -> Self {
        self.count = self.count.map(|count| count.filter(scope.clone()));
        self.base = self.base.filter(scope);
        self
    }

    /// Human-readable list of the storage operations this plan issues, in order.
    pub fn operations(&self) -> Vec<String> {
        let mut ops = vec![format!(
            "select {} ({} columns, {} joins, limit {})",
            self.schema.type_name,
            self.base.output_columns().len(),
            self.base.joins.len(),
            self.base.limit.unwrap_or_default(),
        )];
        if self.count.is_some() {
            ops.push(format!("count {}", self.schema.type_name));
        }
        let mut level: Vec<&IncludeNode> = self.includes.iter().collect();
        while !level.is_empty() {
            for node in &level {
                for plan in &node.plans {
                    let targets: Vec<&str> = plan.target_schemas().iter().map(|t| t.type_name.as_str()).collect();
                    ops.push(format!(
                        "load {} from {} via {} -> {}",
                        node.path,
                        plan.owner.type_name,
                        plan.strategy.kind(),
                        targets.join("|")
                    ));
                }
            }
            level = level.iter().flat_map(|n| n.children.iter()).collect();
        }
        ops
    }
}

pub struct QueryCompiler<'r> {
    registry: &'r SchemaRegistry,
    settings: &'r ApiSettings,
}

impl<'r> QueryCompiler<'r> {
    pub fn new(registry: &'r SchemaRegistry, settings: &'r ApiSettings) -> Self {
        QueryCompiler { registry, settings }
    }

    /// Validates every parameter and builds the plan. `scope` is ANDed into the base filter
    /// (single-record reads pass their identity condition here). No query runs here.
    pub fn compile(
        &self,
        type_name: &str,
        params: &QueryParams,
        scope: Option<Condition>,
    ) -> Result<CompiledQuery<'r>, AppError> {
        let schema = self.registry.resolve(type_name)?;
        let includes = self.compile_includes(schema, &params.include)?;

        let mut column_plans = HashMap::new();
        let mut load_options = LoadOptions::default();
        let mut reached = vec![schema];
        collect_targets(&includes, &mut reached);
        for type_name in params.fields.keys() {
            if !self.registry.contains(type_name) {
                return Err(AppError::BadRequest(format!("fields[{}]: unknown resource type", type_name)));
            }
        }
        for target in reached {
            if column_plans.contains_key(&target.type_name) {
                continue;
            }
            let requested = params.fields.get(&target.type_name).map(Vec::as_slice);
            let plan = plan_columns(target, requested)?;
            if requested.is_some() {
                load_options.columns.insert(target.type_name.clone(), plan.columns.clone());
            }
            column_plans.insert(target.type_name.clone(), plan);
        }

        let sort = self.compile_sort(schema, params)?;
        let window = self.compile_window(&params.page)?;
        if let Window::Cursor { after, .. } = &window {
            for key in &sort {
                if schema.is_nullable(&key.column) {
                    return Err(AppError::validation(
                        &key.column,
                        "cursor pagination needs non-nullable sort columns",
                    ));
                }
            }
            if let Some(after) = after {
                if after.len() != sort.len() || after.iter().any(Value::is_null) {
                    return Err(AppError::BadRequest("page[cursor] does not match the sort order".into()));
                }
            }
        }

        let filters = compile_filters(self.registry, schema, &params.filters)?;
        let mut columns = column_plans
            .get(&schema.type_name)
            .map(|p| p.columns.clone())
            .unwrap_or_default();
        for key in &sort {
            if !columns.contains(&key.column) {
                columns.push(key.column.clone());
            }
        }

        let mut base = Select::from(self.registry.table_ref(schema)).columns(columns);
        for join in filters.joins {
            base = base.join(join);
        }
        for condition in filters.conditions {
            base = base.filter(condition);
        }
        if let Some(scope) = scope {
            base = base.filter(scope);
        }
        let count = match window {
            Window::Offset { .. } if self.settings.count_total => Some(base.clone()),
            _ => None,
        };
        if let Window::Cursor { after: Some(after), .. } = &window {
            base = base.filter(keyset(&sort, after));
        }
        for key in &sort {
            base = base.order_by(OrderBy {
                column: key.column.as_str().into(),
                descending: key.descending,
            });
        }
        base = base.limit(window.limit() + 1);
        if let Window::Offset { offset, .. } = window {
            if offset > 0 {
                base = base.offset(offset);
            }
        }

        let compiled = CompiledQuery {
            schema,
            params: params.clone(),
            base,
            count,
            window,
            sort,
            includes,
            column_plans,
            load_options,
        };
        tracing::debug!(
            resource = %schema.type_name,
            operations = ?compiled.operations(),
            "compiled query plan"
        );
        Ok(compiled)
    }

    fn compile_sort(&self, schema: &ResourceSchema, params: &QueryParams) -> Result<Vec<SortKey>, AppError> {
        let allowed = schema.sortable_fields();
        let mut keys: Vec<SortKey> = Vec::new();
        for s in &params.sort {
            if !allowed.contains(&s.field.as_str()) {
                return Err(AppError::InvalidSortField {
                    resource: schema.type_name.clone(),
                    field: s.field.clone(),
                });
            }
            if keys.iter().any(|k| k.column == s.field) {
                continue;
            }
            keys.push(SortKey {
                column: s.field.clone(),
                descending: s.descending,
            });
        }
        if !keys.iter().any(|k| k.column == schema.id_property) {
            keys.push(SortKey {
                column: schema.id_property.clone(),
                descending: false,
            });
        }
        Ok(keys)
    }

    fn compile_window(&self, page: &PageParams) -> Result<Window, AppError> {
        let clamp = |requested: Option<u64>| -> Result<u64, AppError> {
            let limit = requested.unwrap_or(self.settings.default_page_size);
            if limit == 0 {
                return Err(AppError::BadRequest("page size must be positive".into()));
            }
            Ok(limit.min(self.settings.max_page_size))
        };
        if let Some(cursor) = &page.cursor {
            let limit = clamp(page.size.or(page.limit))?;
            let after = if cursor.is_empty() {
                None
            } else {
                Some(decode_cursor(cursor)?)
            };
            return Ok(Window::Cursor { after, limit });
        }
        if page.number.is_some() || page.size.is_some() {
            let limit = clamp(page.size)?;
            let number = page.number.unwrap_or(1);
            if number == 0 {
                return Err(AppError::BadRequest("page[number] starts at 1".into()));
            }
            return Ok(Window::Offset {
                offset: (number - 1) * limit,
                limit,
            });
        }
        Ok(Window::Offset {
            offset: page.offset.unwrap_or(0),
            limit: clamp(page.limit)?,
        })
    }

    /// Validates every path segment, then the depth, then merges the paths into a tree.
    fn compile_includes(&self, schema: &'r ResourceSchema, paths: &[String]) -> Result<Vec<IncludeNode<'r>>, AppError> {
        let mut resolved: Vec<(&str, Vec<&str>, Vec<Vec<RelationshipPlan<'r>>>)> = Vec::new();
        for path in paths {
            let segments: Vec<&str> = path.split('.').collect();
            let mut owners: Vec<&'r ResourceSchema> = vec![schema];
            let mut levels = Vec::with_capacity(segments.len());
            for segment in &segments {
                let plans: Vec<RelationshipPlan<'r>> = owners
                    .iter()
                    .filter_map(|owner| resolver::resolve(self.registry, *owner, segment).ok())
                    .collect();
                if plans.is_empty() {
                    return Err(AppError::InvalidInclude {
                        path: path.clone(),
                        segment: segment.to_string(),
                    });
                }
                owners = Vec::new();
                for target in plans.iter().flat_map(|p| p.target_schemas()) {
                    if !owners.iter().any(|o| o.type_name == target.type_name) {
                        owners.push(target);
                    }
                }
                levels.push(plans);
            }
            resolved.push((path.as_str(), segments, levels));
        }

        let max = self.settings.max_include_depth;
        for (path, segments, _) in &resolved {
            if segments.len() > max {
                return Err(AppError::IncludeDepthExceeded {
                    path: path.to_string(),
                    segment: segments[max].to_string(),
                    max,
                });
            }
        }

        let mut roots: Vec<IncludeNode<'r>> = Vec::new();
        for (_, segments, levels) in resolved {
            let mut siblings = &mut roots;
            for (depth, (segment, plans)) in segments.iter().zip(levels).enumerate() {
                let index = match siblings.iter().position(|n| n.alias == *segment) {
                    Some(i) => i,
                    None => {
                        siblings.push(IncludeNode {
                            path: segments[..=depth].join("."),
                            alias: segment.to_string(),
                            plans,
                            children: Vec::new(),
                        });
                        siblings.len() - 1
                    }
                };
                siblings = &mut siblings[index].children;
            }
        }
        Ok(roots)
    }
}

fn collect_targets<'r>(nodes: &[IncludeNode<'r>], out: &mut Vec<&'r ResourceSchema>) {
    for node in nodes {
        for plan in &node.plans {
            out.extend(plan.target_schemas());
        }
        collect_targets(&node.children, out);
    }
}

/// Rows strictly after `after` in the order given by `sort`.
fn keyset(sort: &[SortKey], after: &[Value]) -> Condition {
    let branches = (0..sort.len())
        .map(|i| {
            let mut parts: Vec<Condition> = (0..i)
                .map(|j| Condition::eq(sort[j].column.as_str(), after[j].clone()))
                .collect();
            let op = if sort[i].descending { CompareOp::Lt } else { CompareOp::Gt };
            parts.push(Condition::compare(sort[i].column.as_str(), op, after[i].clone()));
            Condition::all(parts)
        })
        .collect();
    Condition::any(branches)
}

/// Cursor text is the JSON array of the last row's sort values.
pub fn encode_cursor(values: &[Value]) -> String {
    Value::Array(values.to_vec()).to_string()
}

pub fn decode_cursor(cursor: &str) -> Result<Vec<Value>, AppError> {
    serde_json::from_str::<Vec<Value>>(cursor).map_err(|_| AppError::BadRequest(format!("malformed page[cursor] '{}'", cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, HasRelation, ResourceSchema};
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut r = SchemaRegistry::new();
        r.register(
            ResourceSchema::builder("articles")
                .column("id", ColumnDef::number().not_null())
                .column("title", ColumnDef::string())
                .column("rating", ColumnDef::number().not_null())
                .belongs_to("author_id", "people", "author")
                .has_many("comments", HasRelation::direct("comments"))
                .sortable(["title", "rating"])
                .build(),
        )
        .unwrap();
        r.register(
            ResourceSchema::builder("people")
                .column("id", ColumnDef::number().not_null())
                .column("name", ColumnDef::string())
                .has_many("articles", HasRelation::direct("articles").foreign_key("author_id"))
                .build(),
        )
        .unwrap();
        r.register(
            ResourceSchema::builder("comments")
                .column("id", ColumnDef::number().not_null())
                .column("body", ColumnDef::string())
                .belongs_to("article_id", "articles", "article")
                .build(),
        )
        .unwrap();
        r.finalize().unwrap();
        r
    }

    fn params(pairs: &[(&str, &str)]) -> QueryParams {
        QueryParams::from_pairs(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn sort_gets_identity_tie_break() {
        let r = registry();
        let settings = ApiSettings::default();
        let q = QueryCompiler::new(&r, &settings)
            .compile("articles", &params(&[("sort", "-rating")]), None)
            .unwrap();
        assert_eq!(
            q.sort,
            vec![
                SortKey {
                    column: "rating".into(),
                    descending: true
                },
                SortKey {
                    column: "id".into(),
                    descending: false
                },
            ]
        );
        assert_eq!(q.base.limit, Some(settings.default_page_size + 1));
    }

    #[test]
    fn unsortable_field_is_rejected() {
        let r = registry();
        let settings = ApiSettings::default();
        let err = QueryCompiler::new(&r, &settings)
            .compile("articles", &params(&[("sort", "author_id")]), None)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidSortField { field, .. } if field == "author_id"));
    }

    #[test]
    fn include_tree_merges_shared_prefixes() {
        let r = registry();
        let settings = ApiSettings::default();
        let q = QueryCompiler::new(&r, &settings)
            .compile("articles", &params(&[("include", "comments,comments.article.author,author")]), None)
            .unwrap();
        assert_eq!(q.includes.len(), 2);
        assert_eq!(q.includes[0].children[0].path, "comments.article");
        assert_eq!(q.includes[0].children[0].children[0].path, "comments.article.author");
        assert!(q.column_plan("people").is_some());
        assert_eq!(q.operations().len(), 5);
    }

    #[test]
    fn invalid_segment_is_named() {
        let r = registry();
        let settings = ApiSettings::default();
        let err = QueryCompiler::new(&r, &settings)
            .compile("articles", &params(&[("include", "comments.nope")]), None)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInclude { segment, .. } if segment == "nope"));
    }

    #[test]
    fn page_number_maps_to_offset() {
        let r = registry();
        let settings = ApiSettings::default();
        let q = QueryCompiler::new(&r, &settings)
            .compile("articles", &params(&[("page[number]", "3"), ("page[size]", "2")]), None)
            .unwrap();
        assert_eq!(q.window, Window::Offset { offset: 4, limit: 2 });
        assert_eq!(q.base.offset, Some(4));
        assert_eq!(q.base.limit, Some(3));
    }

    #[test]
    fn cursor_builds_keyset_condition() {
        let r = registry();
        let settings = ApiSettings::default();
        let cursor = encode_cursor(&[json!(4), json!(7)]);
        let q = QueryCompiler::new(&r, &settings)
            .compile("articles", &params(&[("sort", "rating"), ("page[cursor]", &cursor)]), None)
            .unwrap();
        let expected = Condition::any(vec![
            Condition::compare("rating", CompareOp::Gt, json!(4)),
            Condition::all(vec![
                Condition::eq("rating", json!(4)),
                Condition::compare("id", CompareOp::Gt, json!(7)),
            ]),
        ]);
        assert_eq!(q.base.filter, Some(expected));

        let err = QueryCompiler::new(&r, &settings)
            .compile("articles", &params(&[("sort", "title"), ("page[cursor]", "")]), None)
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
