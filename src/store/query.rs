//! Abstract storage operations. Drivers translate these into their own dialect.

use crate::schema::SemanticType;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One record as column name → value.
pub type Row = Map<String, Value>;

/// A physical table and the semantic type of each of its columns.
#[derive(Clone, Debug, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub columns: Vec<String>,
    types: HashMap<String, SemanticType>,
}

impl TableRef {
    pub fn new(name: impl Into<String>, columns: Vec<(String, Option<SemanticType>)>) -> Self {
        let mut types = HashMap::new();
        let mut names = Vec::with_capacity(columns.len());
        for (column, ty) in columns {
            if let Some(ty) = ty {
                types.insert(column.clone(), ty);
            }
            names.push(column);
        }
        TableRef {
            name: name.into(),
            columns: names,
            types,
        }
    }

    pub fn column_type(&self, column: &str) -> Option<SemanticType> {
        self.types.get(column).copied()
    }
}

/// A column of the base table (`source: None`) or of a joined alias.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    pub source: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(column: impl Into<String>) -> Self {
        ColumnRef {
            source: None,
            column: column.into(),
        }
    }

    pub fn on(source: impl Into<String>, column: impl Into<String>) -> Self {
        ColumnRef {
            source: Some(source.into()),
            column: column.into(),
        }
    }
}

impl From<&str> for ColumnRef {
    fn from(column: &str) -> Self {
        ColumnRef::new(column)
    }
}

impl From<String> for ColumnRef {
    fn from(column: String) -> Self {
        ColumnRef::new(column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Case-insensitive substring match on the text form of the column.
    Contains,
}

/// Row predicate. Comparisons against null never match.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: Value,
    },
    In {
        column: ColumnRef,
        values: Vec<Value>,
    },
    IsNull {
        column: ColumnRef,
        negated: bool,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn compare(column: impl Into<ColumnRef>, op: CompareOp, value: Value) -> Self {
        Condition::Compare {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<ColumnRef>, value: Value) -> Self {
        Condition::compare(column, CompareOp::Eq, value)
    }

    pub fn is_in(column: impl Into<ColumnRef>, values: Vec<Value>) -> Self {
        Condition::In {
            column: column.into(),
            values,
        }
    }

    pub fn is_null(column: impl Into<ColumnRef>) -> Self {
        Condition::IsNull {
            column: column.into(),
            negated: false,
        }
    }

    pub fn not_null(column: impl Into<ColumnRef>) -> Self {
        Condition::IsNull {
            column: column.into(),
            negated: true,
        }
    }

    /// Conjunction, flattening the trivial cases.
    pub fn all(mut conditions: Vec<Condition>) -> Self {
        if conditions.len() == 1 {
            return conditions.remove(0);
        }
        Condition::And(conditions)
    }

    pub fn any(mut conditions: Vec<Condition>) -> Self {
        if conditions.len() == 1 {
            return conditions.remove(0);
        }
        Condition::Or(conditions)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JoinCondition {
    /// `alias.column = value`
    Literal { column: ColumnRef, value: Value },
    /// `left = right`
    Columns { left: ColumnRef, right: ColumnRef },
}

/// LEFT JOIN of `table` under `alias`. The join is expected to match at most one row.
#[derive(Clone, Debug, PartialEq)]
pub struct Join {
    pub alias: String,
    pub table: TableRef,
    pub on: Vec<JoinCondition>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<ColumnRef>) -> Self {
        OrderBy {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<ColumnRef>) -> Self {
        OrderBy {
            column: column.into(),
            descending: true,
        }
    }
}

/// Read of base-table columns. An empty column list selects every column of the table.
#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub joins: Vec<Join>,
    pub filter: Option<Condition>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn from(table: TableRef) -> Self {
        Select {
            table,
            columns: Vec::new(),
            joins: Vec::new(),
            filter: None,
            order: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Condition::And(vec![existing, condition]),
            None => condition,
        });
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Column names each returned row carries.
    pub fn output_columns(&self) -> Vec<String> {
        if self.columns.is_empty() {
            self.table.columns.clone()
        } else {
            self.columns.clone()
        }
    }
}

/// Insert one row. A missing or null identity is generated by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub table: TableRef,
    pub values: Row,
    pub identity_column: String,
}

/// Set columns on every row matching `filter`.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub table: TableRef,
    pub set: Row,
    pub filter: Condition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub table: TableRef,
    pub filter: Condition,
}
