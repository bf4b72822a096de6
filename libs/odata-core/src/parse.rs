//! Parsing of the system query options of a single request.

use std::collections::HashSet;

use crate::{Error, ODataLimits, ODataOrderBy, ODataQuery, OrderKey, SortDir, ast};

pub const MAX_ORDERBY_LEN: usize = 1024;
pub const MAX_SELECT_LEN: usize = 2048;
pub const MAX_EXPAND_LEN: usize = 1024;

/// Result of parsing a filter string, including both the AST and complexity metadata.
#[derive(Clone, Debug)]
pub struct ParsedFilter {
    expr: ast::Expr,
    node_count: usize,
}

impl ParsedFilter {
    #[must_use]
    pub fn as_expr(&self) -> &ast::Expr {
        &self.expr
    }

    #[must_use]
    pub fn into_expr(self) -> ast::Expr {
        self.expr
    }

    /// AST node count for budget enforcement
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

/// Parse a raw $filter string into the crate AST.
///
/// # Errors
/// `Error::InvalidFilter` if the filter string is malformed.
pub fn parse_filter_string(raw: &str) -> Result<ParsedFilter, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidFilter("filter cannot be empty".into()));
    }

    let ast_src = odata_params::filters::parse_str(raw)
        .map_err(|e| Error::InvalidFilter(format!("{e:?}")))?;
    let expr: ast::Expr = ast_src.into();
    let node_count = expr.node_count();

    Ok(ParsedFilter { expr, node_count })
}

/// Parse $orderby string into `ODataOrderBy`.
/// Format: "field1 [asc|desc], field2 [asc|desc], ..."
/// Default direction is asc if not specified.
///
/// # Errors
/// `Error::InvalidOrderByField` if the orderby string is invalid.
pub fn parse_orderby(raw: &str) -> Result<ODataOrderBy, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(ODataOrderBy::default());
    }

    if raw.len() > MAX_ORDERBY_LEN {
        return Err(Error::InvalidOrderByField("orderby too long".into()));
    }

    let mut keys = Vec::new();

    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::InvalidOrderByField(
                "empty clause in orderby".into(),
            ));
        }

        let tokens: Vec<&str> = part.split_whitespace().collect();
        let (field, dir) = match tokens.as_slice() {
            [field] | [field, "asc"] => (*field, SortDir::Asc),
            [field, "desc"] => (*field, SortDir::Desc),
            _ => {
                return Err(Error::InvalidOrderByField(format!(
                    "invalid orderby clause: {part}"
                )));
            }
        };

        keys.push(OrderKey {
            field: field.to_owned(),
            dir,
        });
    }

    Ok(ODataOrderBy(keys))
}

fn split_names(raw: &str, what: &str) -> Result<Vec<String>, String> {
    let fields: Vec<String> = raw.split(',').map(|f| f.trim().to_owned()).collect();

    if fields.iter().any(String::is_empty) {
        return Err(format!("{what} contains an empty entry"));
    }

    let mut seen = HashSet::new();
    for field in &fields {
        if !seen.insert(field.to_ascii_lowercase()) {
            return Err(format!("duplicate entry in {what}: {field}"));
        }
    }

    Ok(fields)
}

/// Parse $select string into a list of property names.
/// Returns `None` when the list contains `*` (all properties).
///
/// # Errors
/// `Error::InvalidSelect` for empty, overlong or duplicated entries.
pub fn parse_select(raw: &str) -> Result<Option<Vec<String>>, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidSelect("$select cannot be empty".into()));
    }
    if raw.len() > MAX_SELECT_LEN {
        return Err(Error::InvalidSelect("$select too long".into()));
    }

    let fields = split_names(raw, "$select").map_err(Error::InvalidSelect)?;
    if fields.iter().any(|f| f == "*") {
        return Ok(None);
    }
    Ok(Some(fields))
}

/// Parse $expand into navigation names. Only a single level without
/// nested options is accepted.
///
/// # Errors
/// `Error::InvalidExpand` for malformed or nested entries.
pub fn parse_expand(raw: &str) -> Result<Vec<String>, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidExpand("$expand cannot be empty".into()));
    }
    if raw.len() > MAX_EXPAND_LEN {
        return Err(Error::InvalidExpand("$expand too long".into()));
    }

    let navs = split_names(raw, "$expand").map_err(Error::InvalidExpand)?;
    if let Some(bad) = navs
        .iter()
        .find(|n| n.contains(['(', ')', '/', ';']) || n.as_str() == "*")
    {
        return Err(Error::InvalidExpand(format!(
            "nested or wildcard expansion is not supported: {bad}"
        )));
    }
    Ok(navs)
}

/// Drivers bind `LIMIT`/`OFFSET` as signed 64-bit integers.
const MAX_PAGING_VALUE: u64 = i64::MAX.unsigned_abs();

fn parse_paging(option: &'static str, raw: &str) -> Result<u64, Error> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n <= MAX_PAGING_VALUE)
        .ok_or_else(|| Error::InvalidPaging {
            option,
            value: raw.to_owned(),
        })
}

/// Parse every system query option of a raw (still percent-encoded) query string.
///
/// Non-`$` parameters are ignored, unknown `$` options are rejected.
///
/// # Errors
/// Any option-specific [`Error`].
pub fn parse_query(raw: &str, limits: &ODataLimits) -> Result<ODataQuery, Error> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(raw).map_err(|e| Error::MalformedQuery(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut query = ODataQuery::new();

    for (name, value) in pairs {
        if !name.starts_with('$') {
            continue;
        }
        let name = name.to_ascii_lowercase();
        if !seen.insert(name.clone()) {
            return Err(Error::DuplicateOption(name));
        }

        match name.as_str() {
            "$filter" => {
                limits.validate_filter(&value)?;
                let parsed = parse_filter_string(&value)?;
                limits.validate_filter_nodes(parsed.node_count())?;
                query = query.with_filter(parsed.into_expr());
            }
            "$orderby" => {
                let order = parse_orderby(&value)?;
                limits.validate_orderby_count(order.0.len())?;
                query = query.with_order(order);
            }
            "$select" => {
                if let Some(fields) = parse_select(&value)? {
                    limits.validate_select_count(fields.len())?;
                    query = query.with_select(fields);
                }
            }
            "$expand" => {
                let navs = parse_expand(&value)?;
                limits.validate_expand_count(navs.len())?;
                query = query.with_expand(navs);
            }
            "$top" => {
                let top = parse_paging("top", &value)?;
                limits.validate_top(top)?;
                query = query.with_top(top);
            }
            "$skip" => {
                query = query.with_skip(parse_paging("skip", &value)?);
            }
            "$count" => match value.trim() {
                "true" => query = query.with_count(true),
                "false" => query = query.with_count(false),
                other => return Err(Error::InvalidCount(other.to_owned())),
            },
            "$format" => {
                let v = value.trim().to_ascii_lowercase();
                if v != "json" && !v.starts_with("application/json") {
                    return Err(Error::UnsupportedFormat(value));
                }
            }
            _ => return Err(Error::UnsupportedOption(name)),
        }
    }

    Ok(query)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::ast::{CompareOperator, Expr, Value};

    #[test]
    fn orderby_defaults_to_asc() {
        let order = parse_orderby("Name, Price desc").unwrap();
        assert_eq!(order.0.len(), 2);
        assert_eq!(order.0[0].dir, SortDir::Asc);
        assert_eq!(order.0[1].field, "Price");
        assert_eq!(order.0[1].dir, SortDir::Desc);
    }

    #[test]
    fn orderby_rejects_garbage_direction() {
        assert!(matches!(
            parse_orderby("Name sideways"),
            Err(Error::InvalidOrderByField(_))
        ));
        assert!(parse_orderby("Name,,Price").is_err());
    }

    #[test]
    fn select_star_means_all() {
        assert_eq!(parse_select("*").unwrap(), None);
        assert_eq!(
            parse_select(" Name , Price ").unwrap(),
            Some(vec!["Name".to_owned(), "Price".to_owned()])
        );
    }

    #[test]
    fn select_rejects_duplicates_case_insensitively() {
        assert!(matches!(
            parse_select("Name,name"),
            Err(Error::InvalidSelect(_))
        ));
    }

    #[test]
    fn expand_rejects_nested_options() {
        assert_eq!(parse_expand("Category").unwrap(), vec!["Category"]);
        assert!(parse_expand("Category($select=Name)").is_err());
        assert!(parse_expand("Category/Products").is_err());
    }

    #[test]
    fn filter_is_converted_to_crate_ast() {
        let parsed = parse_filter_string("Price gt 10").unwrap();
        assert_eq!(parsed.node_count(), 3);
        match parsed.into_expr() {
            Expr::Compare(lhs, CompareOperator::Gt, rhs) => {
                assert_eq!(*lhs, Expr::Identifier("Price".into()));
                assert!(matches!(*rhs, Expr::Value(Value::Number(_))));
            }
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn filter_syntax_error_is_reported() {
        assert!(matches!(
            parse_filter_string("Price gt"),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn full_query_string() {
        let q = parse_query(
            "$filter=Name%20eq%20%27Milk%27&$orderby=Price%20desc&$top=5&$skip=10&$count=true&$select=Name,Price&$expand=Category&foo=bar",
            &ODataLimits::default(),
        )
        .unwrap();
        assert!(q.filter().is_some());
        assert_eq!(q.order.to_string(), "Price desc");
        assert_eq!(q.top, Some(5));
        assert_eq!(q.skip, Some(10));
        assert!(q.count);
        assert_eq!(q.selected_fields().map(<[String]>::len), Some(2));
        assert_eq!(q.expand, vec!["Category"]);
    }

    #[test]
    fn unknown_dollar_option_is_rejected() {
        assert_eq!(
            parse_query("$search=milk", &ODataLimits::default()),
            Err(Error::UnsupportedOption("$search".into()))
        );
    }

    #[test]
    fn duplicate_option_is_rejected() {
        assert!(matches!(
            parse_query("$top=1&$top=2", &ODataLimits::default()),
            Err(Error::DuplicateOption(_))
        ));
    }

    #[test]
    fn paging_and_count_validation() {
        let limits = ODataLimits::default().with_max_top(10);
        assert!(matches!(
            parse_query("$top=-1", &limits),
            Err(Error::InvalidPaging { option: "top", .. })
        ));
        assert!(parse_query("$top=11", &limits).is_err());
        assert!(matches!(
            parse_query("$skip=abc", &limits),
            Err(Error::InvalidPaging { option: "skip", .. })
        ));
        assert!(matches!(
            parse_query("$skip=18446744073709551615", &limits),
            Err(Error::InvalidPaging { option: "skip", .. })
        ));
        assert_eq!(
            parse_query("$skip=9223372036854775807", &limits).unwrap().skip,
            Some(9_223_372_036_854_775_807)
        );
        let unbounded = ODataLimits::default().with_max_top(u64::MAX);
        assert!(parse_query("$top=9223372036854775808", &unbounded).is_err());
        assert_eq!(
            parse_query("$count=yes", &limits),
            Err(Error::InvalidCount("yes".into()))
        );
    }

    #[test]
    fn only_json_format_is_accepted() {
        let limits = ODataLimits::default();
        assert!(parse_query("$format=json", &limits).is_ok());
        assert!(parse_query("$format=application/json;odata.metadata=minimal", &limits).is_ok());
        assert!(matches!(
            parse_query("$format=xml", &limits),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn filter_length_limit_applies() {
        let limits = ODataLimits::default().with_max_filter_length(5);
        assert!(matches!(
            parse_query("$filter=Price%20gt%2010", &limits),
            Err(Error::InvalidFilter(_))
        ));
    }
}
