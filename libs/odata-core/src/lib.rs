#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Transport- and storage-agnostic OData v4 query model.
//!
//! The `$filter` grammar is handled by the `odata-params` parser; this crate
//! converts its tree into [`ast::Expr`] and owns everything around it: the
//! remaining system query options, entity keys, limits and the JSON result
//! envelope.

pub mod key;
pub mod limits;
pub mod parse;
pub mod problem_mapping;
pub mod result;

pub use key::{EntityKey, format_key_value, parse_key};
pub use limits::ODataLimits;
pub use parse::{
    ParsedFilter, parse_expand, parse_filter_string, parse_orderby, parse_query, parse_select,
};
pub use result::{ODataResult, context_url};

pub mod ast {
    use bigdecimal::BigDecimal;
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
    use uuid::Uuid;

    #[derive(Clone, Debug, PartialEq)]
    pub enum Expr {
        And(Box<Expr>, Box<Expr>),
        Or(Box<Expr>, Box<Expr>),
        Not(Box<Expr>),
        Compare(Box<Expr>, CompareOperator, Box<Expr>),
        In(Box<Expr>, Vec<Expr>),
        Function(String, Vec<Expr>),
        Identifier(String),
        Value(Value),
    }

    impl Expr {
        #[must_use]
        pub fn and(self, other: Expr) -> Expr {
            Expr::And(Box::new(self), Box::new(other))
        }

        #[must_use]
        pub fn or(self, other: Expr) -> Expr {
            Expr::Or(Box::new(self), Box::new(other))
        }

        /// Number of nodes in the tree, used for the complexity budget.
        #[must_use]
        pub fn node_count(&self) -> usize {
            match self {
                Expr::Value(_) | Expr::Identifier(_) => 1,
                Expr::Not(x) => 1 + x.node_count(),
                Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
                    1 + a.node_count() + b.node_count()
                }
                Expr::In(a, list) => 1 + a.node_count() + list.iter().map(Expr::node_count).sum::<usize>(),
                Expr::Function(_, args) => 1 + args.iter().map(Expr::node_count).sum::<usize>(),
            }
        }
    }

    impl std::ops::Not for Expr {
        type Output = Expr;

        fn not(self) -> Self::Output {
            Expr::Not(Box::new(self))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum CompareOperator {
        Eq,
        Ne,
        Gt,
        Ge,
        Lt,
        Le,
    }

    impl CompareOperator {
        /// The operator that keeps the meaning when both operands swap sides.
        #[must_use]
        pub fn flipped(self) -> Self {
            match self {
                CompareOperator::Eq => CompareOperator::Eq,
                CompareOperator::Ne => CompareOperator::Ne,
                CompareOperator::Gt => CompareOperator::Lt,
                CompareOperator::Ge => CompareOperator::Le,
                CompareOperator::Lt => CompareOperator::Gt,
                CompareOperator::Le => CompareOperator::Ge,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub enum Value {
        Null,
        Bool(bool),
        Number(BigDecimal),
        Uuid(Uuid),
        DateTime(DateTime<Utc>),
        Date(NaiveDate),
        Time(NaiveTime),
        String(String),
    }

    impl Value {
        /// Short type name used in error messages.
        #[must_use]
        pub fn type_name(&self) -> &'static str {
            match self {
                Value::Null => "null",
                Value::Bool(_) => "bool",
                Value::Number(_) => "number",
                Value::Uuid(_) => "uuid",
                Value::DateTime(_) => "datetime",
                Value::Date(_) => "date",
                Value::Time(_) => "time",
                Value::String(_) => "string",
            }
        }
    }

    impl std::fmt::Display for Value {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.type_name())
        }
    }
}

mod convert_odata_params {
    use super::ast::{CompareOperator, Expr, Value};
    use odata_params::filters as od;

    impl From<od::CompareOperator> for CompareOperator {
        fn from(op: od::CompareOperator) -> Self {
            use od::CompareOperator::{
                Equal, GreaterOrEqual, GreaterThan, LessOrEqual, LessThan, NotEqual,
            };
            match op {
                Equal => CompareOperator::Eq,
                NotEqual => CompareOperator::Ne,
                GreaterThan => CompareOperator::Gt,
                GreaterOrEqual => CompareOperator::Ge,
                LessThan => CompareOperator::Lt,
                LessOrEqual => CompareOperator::Le,
            }
        }
    }

    impl From<od::Value> for Value {
        fn from(v: od::Value) -> Self {
            match v {
                od::Value::Null => Value::Null,
                od::Value::Bool(b) => Value::Bool(b),
                od::Value::Number(n) => Value::Number(n),
                od::Value::Uuid(u) => Value::Uuid(u),
                od::Value::DateTime(dt) => Value::DateTime(dt),
                od::Value::Date(d) => Value::Date(d),
                od::Value::Time(t) => Value::Time(t),
                od::Value::String(s) => Value::String(s),
            }
        }
    }

    impl From<od::Expr> for Expr {
        fn from(e: od::Expr) -> Self {
            match e {
                od::Expr::And(a, b) => Expr::And(Box::new((*a).into()), Box::new((*b).into())),
                od::Expr::Or(a, b) => Expr::Or(Box::new((*a).into()), Box::new((*b).into())),
                od::Expr::Not(x) => Expr::Not(Box::new((*x).into())),
                od::Expr::Compare(l, op, r) => {
                    Expr::Compare(Box::new((*l).into()), op.into(), Box::new((*r).into()))
                }
                od::Expr::In(l, list) => Expr::In(
                    Box::new((*l).into()),
                    list.into_iter().map(Into::into).collect(),
                ),
                od::Expr::Function(n, args) => {
                    Expr::Function(n, args.into_iter().map(Into::into).collect())
                }
                od::Expr::Identifier(s) => Expr::Identifier(s),
                od::Expr::Value(v) => Expr::Value(v.into()),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        }
    }
}

/// One `$orderby` item: property name plus direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderKey {
    pub field: String,
    pub dir: SortDir,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use]
pub struct ODataOrderBy(pub Vec<OrderKey>);

impl ODataOrderBy {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sort by the key last so paging is stable; no-op when the key already appears.
    pub fn ensure_tiebreaker(mut self, key: &str, dir: SortDir) -> Self {
        let present = self.0.iter().any(|k| k.field.eq_ignore_ascii_case(key));
        if !present {
            self.0.push(OrderKey {
                field: key.to_owned(),
                dir,
            });
        }
        self
    }
}

/// Renders as an `$orderby` value, e.g. `Name desc,Id asc`.
impl std::fmt::Display for ODataOrderBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{} {}", key.field, key.dir.as_str())?;
        }
        Ok(())
    }
}

/// Why a query string or key predicate was refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid $filter: {0}")]
    InvalidFilter(String),

    #[error("unsupported $orderby field: {0}")]
    InvalidOrderByField(String),

    #[error("invalid $select: {0}")]
    InvalidSelect(String),

    #[error("invalid $expand: {0}")]
    InvalidExpand(String),

    #[error("invalid ${option} value '{value}'")]
    InvalidPaging { option: &'static str, value: String },

    #[error("invalid $count value '{0}': expected true or false")]
    InvalidCount(String),

    #[error("invalid key predicate: {0}")]
    InvalidKey(String),

    #[error("unsupported system query option: {0}")]
    UnsupportedOption(String),

    #[error("query option specified more than once: {0}")]
    DuplicateOption(String),

    #[error("unsupported $format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed query string: {0}")]
    MalformedQuery(String),
}

/// Parsed system query options for one request.
#[derive(Clone, Debug, Default, PartialEq)]
#[must_use]
pub struct ODataQuery {
    pub filter: Option<Box<ast::Expr>>,
    pub order: ODataOrderBy,
    pub select: Option<Vec<String>>,
    pub expand: Vec<String>,
    pub top: Option<u64>,
    pub skip: Option<u64>,
    pub count: bool,
}

impl ODataQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, expr: ast::Expr) -> Self {
        self.filter = Some(Box::new(expr));
        self
    }

    pub fn with_order(mut self, order: ODataOrderBy) -> Self {
        self.order = order;
        self
    }

    pub fn with_select(mut self, fields: Vec<String>) -> Self {
        self.select = Some(fields);
        self
    }

    pub fn with_expand(mut self, navigations: Vec<String>) -> Self {
        self.expand = navigations;
        self
    }

    pub fn with_top(mut self, top: u64) -> Self {
        self.top = Some(top);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_count(mut self, count: bool) -> Self {
        self.count = count;
        self
    }

    #[must_use]
    pub fn filter(&self) -> Option<&ast::Expr> {
        self.filter.as_deref()
    }

    #[must_use]
    pub fn selected_fields(&self) -> Option<&[String]> {
        self.select.as_deref()
    }
}
