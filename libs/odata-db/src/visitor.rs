//! OData query (AST in) → sea-query pieces (SQL out).
//!
//! Parsing belongs to `odata-core`; this module only consumes
//! `odata_core::ast::Expr` and an [`EntityType`] describing the target table.

use bigdecimal::{BigDecimal, ToPrimitive};
use odata_core::{ODataQuery, SortDir, ast as core};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Alias, Condition, Expr, Func, LikeExpr, Order, SimpleExpr};
use thiserror::Error;

use crate::entity::{EntityType, FieldKind, Property};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TranslateError {
    #[error("unknown property: {0}")]
    UnknownField(String),

    #[error("unknown property in $select: {0}")]
    UnknownSelectField(String),

    #[error("unknown property in $orderby: {0}")]
    UnknownOrderByField(String),

    #[error("property paths are not supported: {0}")]
    UnsupportedPath(String),

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        expected: FieldKind,
        got: &'static str,
    },

    #[error("cannot compare {left} with {right}")]
    IncompatibleOperands { left: FieldKind, right: FieldKind },

    #[error("operator {0:?} cannot be used with null or boolean predicates")]
    UnsupportedOp(core::CompareOperator),

    #[error("unsupported function or args: {0}()")]
    UnsupportedFn(String),

    #[error("IN() list supports only literals")]
    NonLiteralInList,

    #[error("bare identifier not allowed: {0}")]
    BareIdentifier(String),

    #[error("bare literal not allowed")]
    BareLiteral,

    #[error("comparison needs at least one property operand")]
    LiteralComparison,

    #[error("{0}")]
    Other(&'static str),
}

pub type TranslateResult<T> = Result<T, TranslateError>;

/// Translator output for one entity-set query.
#[derive(Clone, Debug)]
pub struct SqlQuery {
    /// Properties to read, in declaration order; always contains the key.
    pub selected: Vec<Property>,
    pub condition: Option<Condition>,
    /// `(column, direction)` pairs; ends with the key as tiebreaker.
    pub order: Vec<(String, Order)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub inline_count: bool,
}

impl SqlQuery {
    /// Every property, ordered by key, no filter or paging.
    #[must_use]
    pub fn all(entity: &EntityType) -> Self {
        let key = entity.key_property();
        Self {
            selected: entity.properties.clone(),
            condition: None,
            order: vec![(key.column.clone(), Order::Asc)],
            limit: None,
            offset: None,
            inline_count: false,
        }
    }

    /// Add a property to the select list if it is not there yet.
    pub fn ensure_selected(&mut self, property: &Property) {
        if !self.selected.iter().any(|p| p.name == property.name) {
            self.selected.push(property.clone());
        }
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.selected.iter().map(|p| p.column.as_str()).collect()
    }
}

/// Translate parsed query options against an entity type.
///
/// # Errors
/// Any [`TranslateError`] raised by `$select`, `$filter` or `$orderby`.
pub fn translate(entity: &EntityType, query: &ODataQuery) -> TranslateResult<SqlQuery> {
    let selected = match query.selected_fields() {
        None => entity.properties.clone(),
        Some(fields) => {
            for f in fields {
                if entity.property(f).is_none() {
                    return Err(TranslateError::UnknownSelectField(f.clone()));
                }
            }
            entity
                .properties
                .iter()
                .filter(|p| {
                    p.name == entity.key || fields.iter().any(|f| f.eq_ignore_ascii_case(&p.name))
                })
                .cloned()
                .collect()
        }
    };

    let condition = query
        .filter()
        .map(|expr| filter_to_condition(entity, expr))
        .transpose()?;

    let order_by = query
        .order
        .clone()
        .ensure_tiebreaker(&entity.key, SortDir::Asc);
    let mut order = Vec::with_capacity(order_by.0.len());
    for key in &order_by.0 {
        let prop = entity
            .property(&key.field)
            .ok_or_else(|| TranslateError::UnknownOrderByField(key.field.clone()))?;
        let dir = match key.dir {
            SortDir::Asc => Order::Asc,
            SortDir::Desc => Order::Desc,
        };
        order.push((prop.column.clone(), dir));
    }

    Ok(SqlQuery {
        selected,
        condition,
        order,
        limit: query.top,
        offset: query.skip,
        inline_count: query.count,
    })
}

/* ---------- coercion helpers ---------- */

fn bigdecimal_to_decimal(bd: &BigDecimal) -> TranslateResult<Decimal> {
    // Preserve precision via string.
    let s = bd.normalized().to_string();
    Decimal::from_str_exact(&s)
        .or_else(|_| s.parse::<Decimal>())
        .map_err(|_| TranslateError::Other("invalid decimal"))
}

/// Typed SQL NULL for a property kind.
#[must_use]
pub fn null_value(kind: FieldKind) -> sea_orm::Value {
    use sea_orm::Value as V;
    match kind {
        FieldKind::String => V::String(None),
        FieldKind::I64 => V::BigInt(None),
        FieldKind::F64 => V::Double(None),
        FieldKind::Bool => V::Bool(None),
        FieldKind::Uuid => V::Uuid(None),
        FieldKind::DateTimeUtc => V::ChronoDateTimeUtc(None),
        FieldKind::Date => V::ChronoDate(None),
        FieldKind::Time => V::ChronoTime(None),
        FieldKind::Decimal => V::Decimal(None),
    }
}

/// Convert an OData literal to a database value of the given kind.
///
/// # Errors
/// `TranslateError::TypeMismatch` when the literal does not fit the kind.
pub fn coerce(kind: FieldKind, v: &core::Value) -> TranslateResult<sea_orm::Value> {
    use core::Value as V;
    let mismatch = || TranslateError::TypeMismatch {
        expected: kind,
        got: v.type_name(),
    };

    Ok(match (kind, v) {
        (FieldKind::String, V::String(s)) => sea_orm::Value::String(Some(Box::new(s.clone()))),

        (FieldKind::I64, V::Number(n)) => {
            if !n.is_integer() {
                return Err(mismatch());
            }
            sea_orm::Value::BigInt(Some(n.to_i64().ok_or_else(mismatch)?))
        }

        (FieldKind::F64, V::Number(n)) => {
            sea_orm::Value::Double(Some(n.to_f64().ok_or_else(mismatch)?))
        }

        (FieldKind::Decimal, V::Number(n)) => {
            sea_orm::Value::Decimal(Some(Box::new(bigdecimal_to_decimal(n)?)))
        }

        (FieldKind::Bool, V::Bool(b)) => sea_orm::Value::Bool(Some(*b)),

        (FieldKind::Uuid, V::Uuid(u)) => sea_orm::Value::Uuid(Some(Box::new(*u))),

        (FieldKind::DateTimeUtc, V::DateTime(dt)) => {
            sea_orm::Value::ChronoDateTimeUtc(Some(Box::new(*dt)))
        }
        (FieldKind::Date, V::Date(d)) => sea_orm::Value::ChronoDate(Some(Box::new(*d))),
        (FieldKind::Time, V::Time(t)) => sea_orm::Value::ChronoTime(Some(Box::new(*t))),

        _ => return Err(mismatch()),
    })
}

fn coerce_many(kind: FieldKind, items: &[core::Expr]) -> TranslateResult<Vec<sea_orm::Value>> {
    items
        .iter()
        .map(|e| match e {
            core::Expr::Value(v) => coerce(kind, v),
            _ => Err(TranslateError::NonLiteralInList),
        })
        .collect()
}

/* ---------- LIKE helpers ---------- */

fn like_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            c => out.push(c),
        }
    }
    out
}

fn like(pattern: String) -> LikeExpr {
    LikeExpr::new(pattern).escape('\\')
}

/* ---------- operands ---------- */

enum Operand<'a> {
    Column(SimpleExpr, FieldKind),
    Literal(&'a core::Value),
}

fn lookup<'e>(entity: &'e EntityType, name: &str) -> TranslateResult<&'e Property> {
    if name.contains('/') {
        return Err(TranslateError::UnsupportedPath(name.to_owned()));
    }
    entity
        .property(name)
        .ok_or_else(|| TranslateError::UnknownField(name.to_owned()))
}

fn column(prop: &Property) -> SimpleExpr {
    Expr::col(Alias::new(prop.column.as_str())).into()
}

fn operand<'a>(entity: &EntityType, e: &'a core::Expr) -> TranslateResult<Operand<'a>> {
    use core::Expr as X;
    match e {
        X::Identifier(name) => {
            let prop = lookup(entity, name)?;
            Ok(Operand::Column(column(prop), prop.kind))
        }
        X::Value(v) => Ok(Operand::Literal(v)),
        X::Function(fname, args) => {
            let n = fname.to_ascii_lowercase();
            let [arg] = args.as_slice() else {
                return Err(TranslateError::UnsupportedFn(fname.clone()));
            };
            let inner = string_operand(entity, arg)?;
            let call = match n.as_str() {
                "tolower" => Func::lower(inner),
                "toupper" => Func::upper(inner),
                "trim" => Func::cust(Alias::new("TRIM")).arg(inner),
                _ => return Err(TranslateError::UnsupportedFn(fname.clone())),
            };
            Ok(Operand::Column(call.into(), FieldKind::String))
        }
        _ => Err(TranslateError::Other("unsupported operand")),
    }
}

/// A column-like operand of string kind (property or string function).
fn string_operand(entity: &EntityType, e: &core::Expr) -> TranslateResult<SimpleExpr> {
    match operand(entity, e)? {
        Operand::Column(expr, FieldKind::String) => Ok(expr),
        Operand::Column(_, _) => Err(TranslateError::TypeMismatch {
            expected: FieldKind::String,
            got: "non-string property",
        }),
        Operand::Literal(_) => Err(TranslateError::BareLiteral),
    }
}

fn compare(lhs: SimpleExpr, op: core::CompareOperator, rhs: SimpleExpr) -> SimpleExpr {
    use core::CompareOperator as Op;
    let lhs = Expr::expr(lhs);
    match op {
        Op::Eq => lhs.eq(rhs),
        Op::Ne => lhs.ne(rhs),
        Op::Gt => lhs.gt(rhs),
        Op::Ge => lhs.gte(rhs),
        Op::Lt => lhs.lt(rhs),
        Op::Le => lhs.lte(rhs),
    }
}

fn compare_with_literal(
    col: SimpleExpr,
    kind: FieldKind,
    op: core::CompareOperator,
    lit: &core::Value,
) -> TranslateResult<SimpleExpr> {
    use core::CompareOperator as Op;
    if matches!(lit, core::Value::Null) {
        return match op {
            Op::Eq => Ok(Expr::expr(col).is_null()),
            Op::Ne => Ok(Expr::expr(col).is_not_null()),
            _ => Err(TranslateError::UnsupportedOp(op)),
        };
    }
    let value = coerce(kind, lit)?;
    Ok(compare(col, op, SimpleExpr::Value(value)))
}

/* ---------- Expr (AST) -> Condition ---------- */

/// Convert a filter expression to a sea-query condition.
///
fn is_predicate(name: &str) -> bool {
    ["contains", "startswith", "endswith"]
        .iter()
        .any(|p| name.eq_ignore_ascii_case(p))
}

/// `contains(Name,'x') eq true`: a predicate call compared with a boolean
/// literal is the call itself or its negation.
fn predicate_against_bool(
    entity: &EntityType,
    lhs: &core::Expr,
    op: core::CompareOperator,
    rhs: &core::Expr,
) -> TranslateResult<Option<Condition>> {
    use core::CompareOperator as Op;
    use core::Expr as X;

    let (call, literal) = match (lhs, rhs) {
        (call @ X::Function(name, _), X::Value(core::Value::Bool(b)))
        | (X::Value(core::Value::Bool(b)), call @ X::Function(name, _))
            if is_predicate(name) =>
        {
            (call, *b)
        }
        _ => return Ok(None),
    };
    let holds = match op {
        Op::Eq => literal,
        Op::Ne => !literal,
        _ => return Err(TranslateError::UnsupportedOp(op)),
    };
    let cond = filter_to_condition(entity, call)?;
    Ok(Some(if holds { cond } else { cond.not() }))
}

/// # Errors
/// Unknown properties, type mismatches and unsupported constructs.
pub fn filter_to_condition(entity: &EntityType, expr: &core::Expr) -> TranslateResult<Condition> {
    use core::Expr as X;

    Ok(match expr {
        X::And(a, b) => Condition::all()
            .add(filter_to_condition(entity, a)?)
            .add(filter_to_condition(entity, b)?),
        X::Or(a, b) => Condition::any()
            .add(filter_to_condition(entity, a)?)
            .add(filter_to_condition(entity, b)?),
        X::Not(x) => Condition::all().add(filter_to_condition(entity, x)?).not(),

        X::Compare(lhs, op, rhs) => {
            if let Some(cond) = predicate_against_bool(entity, lhs, *op, rhs)? {
                return Ok(cond);
            }
            let cmp = match (operand(entity, lhs)?, operand(entity, rhs)?) {
                (Operand::Column(col, kind), Operand::Literal(lit)) => {
                    compare_with_literal(col, kind, *op, lit)?
                }
                // literal on the left: mirror the operator
                (Operand::Literal(lit), Operand::Column(col, kind)) => {
                    compare_with_literal(col, kind, op.flipped(), lit)?
                }
                (Operand::Column(l, lk), Operand::Column(r, rk)) => {
                    if lk != rk && !(lk.is_numeric() && rk.is_numeric()) {
                        return Err(TranslateError::IncompatibleOperands {
                            left: lk,
                            right: rk,
                        });
                    }
                    compare(l, *op, r)
                }
                (Operand::Literal(_), Operand::Literal(_)) => {
                    return Err(TranslateError::LiteralComparison);
                }
            };
            Condition::all().add(cmp)
        }

        X::In(l, list) => {
            let Operand::Column(col, kind) = operand(entity, l)? else {
                return Err(TranslateError::Other("left side of IN must be a property"));
            };
            let vals = coerce_many(kind, list)?;
            if vals.is_empty() {
                // IN () → always false
                Condition::all().add(Expr::cust("1=0"))
            } else {
                Condition::all().add(Expr::expr(col).is_in(vals))
            }
        }

        X::Function(fname, args) => {
            let n = fname.to_ascii_lowercase();
            let (target, needle) = match args.as_slice() {
                [target, X::Value(core::Value::String(s))] => (target, like_escape(s)),
                _ => return Err(TranslateError::UnsupportedFn(fname.clone())),
            };
            let pattern = match n.as_str() {
                "contains" => format!("%{needle}%"),
                "startswith" => format!("{needle}%"),
                "endswith" => format!("%{needle}"),
                _ => return Err(TranslateError::UnsupportedFn(fname.clone())),
            };
            let col = string_operand(entity, target)?;
            Condition::all().add(Expr::expr(col).like(like(pattern)))
        }

        // Leaf forms are not valid WHERE by themselves
        X::Identifier(name) => return Err(TranslateError::BareIdentifier(name.clone())),
        X::Value(_) => return Err(TranslateError::BareLiteral),
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::entity::Navigation;
    use odata_core::{ODataLimits, parse_filter_string, parse_query};
    use sea_orm::sea_query::{Asterisk, PostgresQueryBuilder, Query, SqliteQueryBuilder};

    fn product() -> EntityType {
        EntityType::builder("Product")
            .set_name("Products")
            .table("products")
            .key("Id")
            .property(Property::new("Id", FieldKind::I64).column("id"))
            .property(Property::new("Name", FieldKind::String).column("name"))
            .property(Property::new("Stock", FieldKind::I64).column("stock"))
            .property(Property::new("Reorder", FieldKind::I64).column("reorder_level"))
            .property(
                Property::new("Description", FieldKind::String)
                    .column("description")
                    .nullable(),
            )
            .property(Property::new("Active", FieldKind::Bool).column("active"))
            .navigation(Navigation::many_to_one("Category", "Category", "Stock"))
            .build()
            .unwrap()
    }

    fn where_sql(filter: &str) -> String {
        let expr = parse_filter_string(filter).unwrap().into_expr();
        let cond = filter_to_condition(&product(), &expr).unwrap();
        Query::select()
            .column(Asterisk)
            .from(Alias::new("products"))
            .cond_where(cond)
            .to_string(PostgresQueryBuilder)
    }

    fn filter_err(filter: &str) -> TranslateError {
        let expr = parse_filter_string(filter).unwrap().into_expr();
        filter_to_condition(&product(), &expr).unwrap_err()
    }

    #[test]
    fn simple_comparison_uses_column_name() {
        let sql = where_sql("Stock gt 10");
        assert!(sql.contains(r#""stock" > 10"#), "{sql}");
        let sql = where_sql("Name eq 'Milk'");
        assert!(sql.contains(r#""name" = 'Milk'"#), "{sql}");
    }

    #[test]
    fn literal_on_left_flips_operator() {
        let sql = where_sql("5 lt Stock");
        assert!(sql.contains(r#""stock" > 5"#), "{sql}");
    }

    #[test]
    fn property_to_property_comparison() {
        let sql = where_sql("Stock le Reorder");
        assert!(sql.contains(r#""stock" <= "reorder_level""#), "{sql}");
        assert!(matches!(
            filter_err("Stock eq Name"),
            TranslateError::IncompatibleOperands { .. }
        ));
    }

    #[test]
    fn null_comparisons() {
        assert!(where_sql("Description eq null").contains(r#""description" IS NULL"#));
        assert!(where_sql("Description ne null").contains(r#""description" IS NOT NULL"#));
        assert!(matches!(
            filter_err("Description gt null"),
            TranslateError::UnsupportedOp(_)
        ));
    }

    #[test]
    fn logical_operators() {
        let sql = where_sql("Stock gt 1 and (Active eq true or Name eq 'x')");
        assert!(sql.contains("AND"), "{sql}");
        assert!(sql.contains("OR"), "{sql}");

        let expr = !parse_filter_string("Name eq 'x'").unwrap().into_expr();
        let cond = filter_to_condition(&product(), &expr).unwrap();
        let sql = Query::select()
            .column(Asterisk)
            .from(Alias::new("products"))
            .cond_where(cond)
            .to_string(PostgresQueryBuilder);
        assert!(sql.contains("NOT"), "{sql}");
    }

    #[test]
    fn in_list() {
        let sql = where_sql("Id in (1, 2, 3)");
        assert!(sql.contains(r#""id" IN (1, 2, 3)"#), "{sql}");
    }

    #[test]
    fn empty_in_list_is_false() {
        let expr = core::Expr::In(Box::new(core::Expr::Identifier("Id".into())), vec![]);
        let cond = filter_to_condition(&product(), &expr).unwrap();
        let sql = Query::select()
            .column(Asterisk)
            .from(Alias::new("products"))
            .cond_where(cond)
            .to_string(SqliteQueryBuilder);
        assert!(sql.contains("1=0"), "{sql}");
    }

    #[test]
    fn string_functions() {
        let sql = where_sql("contains(Name, 'ilk')");
        assert!(sql.contains("LIKE '%ilk%'"), "{sql}");
        assert!(sql.contains("ESCAPE"), "{sql}");

        let sql = where_sql("startswith(tolower(Name), 'mi')");
        assert!(sql.contains(r#"LOWER("name") LIKE 'mi%'"#), "{sql}");

        let sql = where_sql("toupper(Name) eq 'MILK'");
        assert!(sql.contains(r#"UPPER("name") = 'MILK'"#), "{sql}");

        let sql = where_sql("trim(Name) eq 'Milk'");
        assert!(sql.contains(r#"TRIM("name") = 'Milk'"#), "{sql}");
    }

    #[test]
    fn predicates_compared_with_booleans() {
        let sql = where_sql("contains(Name,'x') eq true");
        assert!(sql.contains(r#""name" LIKE '%x%'"#), "{sql}");
        assert!(!sql.contains("NOT"), "{sql}");

        let sql = where_sql("contains(Name,'x') eq false");
        assert!(sql.contains("NOT"), "{sql}");
        assert!(sql.contains("LIKE '%x%'"), "{sql}");

        let sql = where_sql("true ne startswith(Name,'M')");
        assert!(sql.contains("NOT"), "{sql}");
        assert!(sql.contains("LIKE 'M%'"), "{sql}");

        assert!(matches!(
            filter_err("contains(Name,'x') gt true"),
            TranslateError::UnsupportedOp(core::CompareOperator::Gt)
        ));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(like_escape("50%_off"), r"50\%\_off");
    }

    #[test]
    fn errors() {
        assert_eq!(
            filter_err("Colour eq 'red'"),
            TranslateError::UnknownField("Colour".into())
        );
        assert!(matches!(
            filter_err("Name eq 5"),
            TranslateError::TypeMismatch { expected: FieldKind::String, got: "number" }
        ));
        assert!(matches!(
            filter_err("Stock eq 1.5"),
            TranslateError::TypeMismatch { expected: FieldKind::I64, .. }
        ));
        assert!(matches!(filter_err("contains(Stock, 'x')"), TranslateError::TypeMismatch { .. }));
        assert!(matches!(filter_err("length(Name) eq 3"), TranslateError::UnsupportedFn(_)));
        assert_eq!(filter_err("1 eq 1"), TranslateError::LiteralComparison);

        let path = core::Expr::Compare(
            Box::new(core::Expr::Identifier("Category/Name".into())),
            core::CompareOperator::Eq,
            Box::new(core::Expr::Value(core::Value::String("x".into()))),
        );
        assert!(matches!(
            filter_to_condition(&product(), &path),
            Err(TranslateError::UnsupportedPath(_))
        ));
    }

    #[test]
    fn translate_select_order_and_paging() {
        let q = parse_query(
            "$select=Name&$orderby=Stock desc&$top=10&$skip=20&$count=true",
            &ODataLimits::default(),
        )
        .unwrap();
        let sql = translate(&product(), &q).unwrap();
        let names: Vec<&str> = sql.selected.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Id", "Name"]);
        assert_eq!(
            sql.order,
            vec![
                ("stock".to_owned(), Order::Desc),
                ("id".to_owned(), Order::Asc)
            ]
        );
        assert_eq!(sql.limit, Some(10));
        assert_eq!(sql.offset, Some(20));
        assert!(sql.inline_count);
    }

    #[test]
    fn translate_rejects_unknown_select_and_order() {
        let q = ODataQuery::new().with_select(vec!["Colour".into()]);
        assert_eq!(
            translate(&product(), &q).unwrap_err(),
            TranslateError::UnknownSelectField("Colour".into())
        );

        let q = parse_query("$orderby=Colour", &ODataLimits::default()).unwrap();
        assert_eq!(
            translate(&product(), &q).unwrap_err(),
            TranslateError::UnknownOrderByField("Colour".into())
        );
    }
}
