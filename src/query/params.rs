//! Parsed JSON:API query parameters: `filter`, `sort`, `include`, `fields`, `page`.

use crate::error::AppError;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;

/// Characters left unescaped in generated query strings.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~').remove(b',');

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Case-insensitive substring.
    Like,
    /// Comma-separated list.
    In,
    /// `true` for IS NULL, `false` for IS NOT NULL.
    Null,
}

impl FilterOp {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => FilterOp::Eq,
            "ne" => FilterOp::Ne,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "like" => FilterOp::Like,
            "in" => FilterOp::In,
            "null" => FilterOp::Null,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Ne => "ne",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Like => "like",
            FilterOp::In => "in",
            FilterOp::Null => "null",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterParam {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortParam {
    pub field: String,
    pub descending: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageParams {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub number: Option<u64>,
    pub size: Option<u64>,
    /// Present (possibly empty) in cursor mode.
    pub cursor: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub filters: Vec<FilterParam>,
    pub sort: Vec<SortParam>,
    /// Dotted include paths, e.g. `author.posts`.
    pub include: Vec<String>,
    /// Sparse fieldsets by resource type.
    pub fields: BTreeMap<String, Vec<String>>,
    pub page: PageParams,
}

/// `filter[title][like]` → `("filter", ["title", "like"])`.
fn split_key(key: &str) -> Option<(&str, Vec<&str>)> {
    let Some(open) = key.find('[') else {
        return Some((key, Vec::new()));
    };
    let family = &key[..open];
    let mut parts = Vec::new();
    let mut rest = &key[open..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        parts.push(&inner[..close]);
        rest = &inner[close + 1..];
    }
    Some((family, parts))
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn page_number(key: &str, value: &str) -> Result<u64, AppError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| AppError::BadRequest(format!("page[{}] must be a non-negative integer, got '{}'", key, value)))
}

impl QueryParams {
    /// Parses decoded `(key, value)` pairs. Parameters outside the JSON:API families are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = QueryParams::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some((family, parts)) = split_key(key) else {
                return Err(AppError::BadRequest(format!("malformed query parameter '{}'", key)));
            };
            match (family, parts.as_slice()) {
                ("filter", [field]) => params.filters.push(FilterParam {
                    field: field.to_string(),
                    op: FilterOp::Eq,
                    value: value.to_string(),
                }),
                ("filter", [field, op]) => {
                    let op = FilterOp::parse(op)
                        .ok_or_else(|| AppError::BadRequest(format!("unknown filter operator '{}'", op)))?;
                    params.filters.push(FilterParam {
                        field: field.to_string(),
                        op,
                        value: value.to_string(),
                    });
                }
                ("sort", []) => {
                    for item in comma_list(value) {
                        let (field, descending) = match item.strip_prefix('-') {
                            Some(f) => (f.to_string(), true),
                            None => (item, false),
                        };
                        params.sort.push(SortParam { field, descending });
                    }
                }
                ("include", []) => params.include.extend(comma_list(value)),
                ("fields", [type_name]) => {
                    params.fields.insert(type_name.to_string(), comma_list(value));
                }
                ("page", [name]) => match *name {
                    "offset" => params.page.offset = Some(page_number(name, value)?),
                    "limit" => params.page.limit = Some(page_number(name, value)?),
                    "number" => params.page.number = Some(page_number(name, value)?),
                    "size" => params.page.size = Some(page_number(name, value)?),
                    "cursor" => params.page.cursor = Some(value.to_string()),
                    other => return Err(AppError::BadRequest(format!("unknown page parameter '{}'", other))),
                },
                ("filter" | "sort" | "include" | "fields" | "page", _) => {
                    return Err(AppError::BadRequest(format!("malformed query parameter '{}'", key)));
                }
                _ => {}
            }
        }
        Ok(params)
    }

    /// Renders the parameters back into a query string (without `?`), page parameters
    /// replaced by `page`.
    pub fn to_query_string(&self, page: &[(&str, String)]) -> String {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for f in &self.filters {
            let key = match f.op {
                FilterOp::Eq => format!("filter[{}]", f.field),
                op => format!("filter[{}][{}]", f.field, op.as_str()),
            };
            pairs.push((key, f.value.clone()));
        }
        if !self.sort.is_empty() {
            let sort: Vec<String> = self
                .sort
                .iter()
                .map(|s| if s.descending { format!("-{}", s.field) } else { s.field.clone() })
                .collect();
            pairs.push(("sort".into(), sort.join(",")));
        }
        if !self.include.is_empty() {
            pairs.push(("include".into(), self.include.join(",")));
        }
        for (type_name, fields) in &self.fields {
            pairs.push((format!("fields[{}]", type_name), fields.join(",")));
        }
        for (name, value) in page {
            pairs.push((format!("page[{}]", name), value.clone()));
        }
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", utf8_percent_encode(k, QUERY_VALUE), utf8_percent_encode(v, QUERY_VALUE)))
            .collect::<Vec<_>>()
            .join("&")
    }
}
