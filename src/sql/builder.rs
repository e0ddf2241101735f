//! Builds parameterized SELECT, COUNT, INSERT, UPDATE, DELETE from abstract storage operations.

use crate::schema::SemanticType;
use crate::store::{ColumnRef, CompareOp, Condition, Delete, Insert, Join, JoinCondition, Select, TableRef, Update};
use serde_json::Value;
use std::collections::HashMap;

/// Alias of the base table in every statement.
const MAIN_ALIAS: &str = "main";

/// Quote identifier for PostgreSQL (safe: only from schemas).
pub(crate) fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Table name, schema-qualified when it contains a dot.
pub(crate) fn qualified_table(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quoted(schema), quoted(name)),
        None => quoted(table),
    }
}

/// PostgreSQL type a semantic type is stored as.
pub fn pg_type(ty: SemanticType) -> &'static str {
    match ty {
        SemanticType::String => "text",
        SemanticType::Number => "numeric",
        SemanticType::Boolean => "boolean",
        SemanticType::Date => "date",
        SemanticType::Datetime => "timestamptz",
        SemanticType::Object => "jsonb",
    }
}

#[derive(Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf::default()
    }

    fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }

    /// Placeholder for `v` with an explicit cast when the column type is known.
    fn placeholder(&mut self, v: Value, ty: Option<SemanticType>) -> String {
        let n = self.push_param(v);
        match ty {
            Some(ty) => format!("${}::{}", n, pg_type(ty)),
            None => format!("${}", n),
        }
    }
}

/// Tables visible to a statement: the base table plus join aliases.
struct Sources<'a> {
    base: &'a TableRef,
    base_alias: Option<&'a str>,
    joins: HashMap<&'a str, &'a TableRef>,
}

impl<'a> Sources<'a> {
    fn new(base: &'a TableRef, base_alias: Option<&'a str>, joins: &'a [Join]) -> Self {
        Sources {
            base,
            base_alias,
            joins: joins.iter().map(|j| (j.alias.as_str(), &j.table)).collect(),
        }
    }

    fn column(&self, c: &ColumnRef) -> String {
        match (&c.source, self.base_alias) {
            (Some(alias), _) => format!("{}.{}", quoted(alias), quoted(&c.column)),
            (None, Some(alias)) => format!("{}.{}", quoted(alias), quoted(&c.column)),
            (None, None) => quoted(&c.column),
        }
    }

    fn column_type(&self, c: &ColumnRef) -> Option<SemanticType> {
        match &c.source {
            None => self.base.column_type(&c.column),
            Some(alias) => self.joins.get(alias.as_str()).and_then(|t| t.column_type(&c.column)),
        }
    }
}

/// SELECT list: numeric columns come back as text so no decimal decoding is needed; the
/// driver parses them back into numbers.
fn select_column_list(table: &TableRef, columns: &[String], alias: Option<&str>) -> String {
    columns
        .iter()
        .map(|c| {
            let q = quoted(c);
            let expr = match alias {
                Some(a) => format!("{}.{}", quoted(a), q),
                None => q.clone(),
            };
            match table.column_type(c) {
                Some(SemanticType::Number) => format!("{}::text AS {}", expr, q),
                _ if alias.is_some() => format!("{} AS {}", expr, q),
                _ => expr,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn condition_sql(q: &mut QueryBuf, sources: &Sources<'_>, cond: &Condition) -> String {
    match cond {
        Condition::Compare { column, op, value } => {
            let col = sources.column(column);
            if *op == CompareOp::Contains {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let n = q.push_param(Value::String(format!("%{}%", escape_like(&text))));
                return format!("{}::text ILIKE ${}", col, n);
            }
            let ph = q.placeholder(value.clone(), sources.column_type(column));
            let sym = match op {
                CompareOp::Eq => "=",
                CompareOp::Ne => "<>",
                CompareOp::Lt => "<",
                CompareOp::Lte => "<=",
                CompareOp::Gt => ">",
                CompareOp::Gte => ">=",
                CompareOp::Contains => "ILIKE",
            };
            format!("{} {} {}", col, sym, ph)
        }
        Condition::In { column, values } => {
            if values.is_empty() {
                return "FALSE".into();
            }
            let ty = sources.column_type(column);
            let placeholders: Vec<String> = values.iter().map(|v| q.placeholder(v.clone(), ty)).collect();
            format!("{} IN ({})", sources.column(column), placeholders.join(", "))
        }
        Condition::IsNull { column, negated } => {
            let not = if *negated { " NOT" } else { "" };
            format!("{} IS{} NULL", sources.column(column), not)
        }
        Condition::And(all) => group(q, sources, all, " AND ", "TRUE"),
        Condition::Or(any) => group(q, sources, any, " OR ", "FALSE"),
    }
}

fn group(q: &mut QueryBuf, sources: &Sources<'_>, parts: &[Condition], sep: &str, empty: &str) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = parts.iter().map(|c| condition_sql(q, sources, c)).collect();
    format!("({})", rendered.join(sep))
}

fn join_sql(q: &mut QueryBuf, sources: &Sources<'_>, join: &Join) -> String {
    let on: Vec<String> = join
        .on
        .iter()
        .map(|c| match c {
            JoinCondition::Literal { column, value } => {
                let ph = q.placeholder(value.clone(), sources.column_type(column));
                format!("{} = {}", sources.column(column), ph)
            }
            JoinCondition::Columns { left, right } => {
                format!("{} = {}", sources.column(left), sources.column(right))
            }
        })
        .collect();
    let on = if on.is_empty() { "TRUE".to_string() } else { on.join(" AND ") };
    format!(
        " LEFT JOIN {} {} ON {}",
        qualified_table(&join.table.name),
        quoted(&join.alias),
        on
    )
}

/// FROM, joins and WHERE shared by SELECT and COUNT.
fn from_where(q: &mut QueryBuf, select: &Select) -> String {
    let sources = Sources::new(&select.table, Some(MAIN_ALIAS), &select.joins);
    let mut sql = format!(" FROM {} {}", qualified_table(&select.table.name), quoted(MAIN_ALIAS));
    for join in &select.joins {
        sql.push_str(&join_sql(q, &sources, join));
    }
    if let Some(filter) = &select.filter {
        sql.push_str(" WHERE ");
        sql.push_str(&condition_sql(q, &sources, filter));
    }
    sql
}

/// SELECT columns of the base table with joins, filter, order and window.
pub fn select(select: &Select) -> QueryBuf {
    let mut q = QueryBuf::new();
    let columns = select.output_columns();
    let cols = select_column_list(&select.table, &columns, Some(MAIN_ALIAS));
    let from = from_where(&mut q, select);
    let sources = Sources::new(&select.table, Some(MAIN_ALIAS), &select.joins);
    let order_clause = if select.order.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = select
            .order
            .iter()
            .map(|o| format!("{} {}", sources.column(&o.column), if o.descending { "DESC" } else { "ASC" }))
            .collect();
        format!(" ORDER BY {}", parts.join(", "))
    };
    let limit_clause = select.limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default();
    let offset_clause = select.offset.map(|n| format!(" OFFSET {}", n)).unwrap_or_default();
    q.sql = format!("SELECT {}{}{}{}{}", cols, from, order_clause, limit_clause, offset_clause);
    q
}

/// COUNT(*) over the same FROM/WHERE as `select`, ignoring order and window.
pub fn count(select: &Select) -> QueryBuf {
    let mut q = QueryBuf::new();
    let from = from_where(&mut q, select);
    q.sql = format!("SELECT COUNT(*) AS \"count\"{}", from);
    q
}

/// INSERT: provided columns only, so a null or missing identity falls back to the column default.
pub fn insert(op: &Insert) -> QueryBuf {
    let mut q = QueryBuf::new();
    let table = qualified_table(&op.table.name);
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for name in &op.table.columns {
        let Some(val) = op.values.get(name) else { continue };
        if *name == op.identity_column && val.is_null() {
            continue;
        }
        placeholders.push(q.placeholder(val.clone(), op.table.column_type(name)));
        cols.push(quoted(name));
    }
    let returning = select_column_list(&op.table, &op.table.columns, None);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, returning)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    q
}

/// UPDATE every row matching the filter: SET only the given columns.
pub fn update(op: &Update) -> QueryBuf {
    let mut q = QueryBuf::new();
    let sources = Sources::new(&op.table, None, &[]);
    let mut sets = Vec::new();
    for (name, value) in &op.set {
        let rhs = q.placeholder(value.clone(), op.table.column_type(name));
        sets.push(format!("{} = {}", quoted(name), rhs));
    }
    let where_clause = condition_sql(&mut q, &sources, &op.filter);
    q.sql = format!(
        "UPDATE {} SET {} WHERE {}",
        qualified_table(&op.table.name),
        sets.join(", "),
        where_clause
    );
    q
}

pub fn delete(op: &Delete) -> QueryBuf {
    let mut q = QueryBuf::new();
    let sources = Sources::new(&op.table, None, &[]);
    let where_clause = condition_sql(&mut q, &sources, &op.filter);
    q.sql = format!("DELETE FROM {} WHERE {}", qualified_table(&op.table.name), where_clause);
    q
}
