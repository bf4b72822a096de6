//! Per-backend assembly of complete statements from translator output.

use std::sync::Arc;

use sea_orm::sea_query::{
    Alias, Asterisk, Condition, Expr, Func, IntoTableRef, Query, SelectStatement, SimpleExpr,
    TableRef,
};
use sea_orm::{DbBackend, Statement};

use crate::DbEngine;
use crate::entity::{EntityType, Property};
use crate::repository::RepoError;
use crate::visitor::SqlQuery;

/// Column alias of the count statement.
pub const COUNT_ALIAS: &str = "odata_count";

/// `SELECT` for the rows plus, when `$count=true`, the matching `COUNT(*)`.
#[derive(Clone, Debug)]
pub struct BuiltQuery {
    pub query: Statement,
    pub count: Option<Statement>,
}

/// Builds the statements the repository executes.
///
/// The query builders differ per backend; so do `RETURNING` support and the
/// rules for `OFFSET` without `LIMIT`.
pub trait DbHelper: Send + Sync {
    fn backend(&self) -> DbBackend;

    fn supports_returning(&self) -> bool;

    /// `OFFSET` needs an accompanying `LIMIT` on this backend.
    fn offset_requires_limit(&self) -> bool {
        false
    }

    fn build_query(&self, entity: &EntityType, query: &SqlQuery) -> BuiltQuery {
        self.build_filtered(entity, query, None)
    }

    /// Same as [`DbHelper::build_query`] with an extra `column = value` restriction.
    fn select_related(
        &self,
        target: &EntityType,
        column: &str,
        value: sea_orm::Value,
        query: &SqlQuery,
    ) -> BuiltQuery {
        let extra = Condition::all().add(Expr::col(Alias::new(column)).eq(value));
        self.build_filtered(target, query, Some(extra))
    }

    fn build_filtered(
        &self,
        entity: &EntityType,
        query: &SqlQuery,
        extra: Option<Condition>,
    ) -> BuiltQuery {
        let condition = match (query.condition.clone(), extra) {
            (Some(c), Some(e)) => Some(Condition::all().add(e).add(c)),
            (c, e) => c.or(e),
        };

        let mut select = Query::select();
        select
            .columns(query.selected.iter().map(|p| Alias::new(p.column.as_str())))
            .from(table_ref(entity));
        if let Some(cond) = condition.clone() {
            select.cond_where(cond);
        }
        for (column, order) in &query.order {
            select.order_by(Alias::new(column.as_str()), order.clone());
        }
        self.apply_paging(&mut select, query.limit, query.offset);

        let count = query.inline_count.then(|| {
            let mut count = Query::select();
            count
                .expr_as(Func::count(Expr::col(Asterisk)), Alias::new(COUNT_ALIAS))
                .from(table_ref(entity));
            if let Some(cond) = condition {
                count.cond_where(cond);
            }
            self.backend().build(&count)
        });

        BuiltQuery {
            query: self.backend().build(&select),
            count,
        }
    }

    /// Values above `i64::MAX` are clamped; drivers bind them as signed integers.
    fn apply_paging(&self, select: &mut SelectStatement, limit: Option<u64>, offset: Option<u64>) {
        let max = i64::MAX.unsigned_abs();
        match (limit, offset) {
            (Some(l), _) => {
                select.limit(l.min(max));
            }
            (None, Some(_)) if self.offset_requires_limit() => {
                select.limit(max);
            }
            (None, _) => {}
        }
        if let Some(o) = offset {
            select.offset(o.min(max));
        }
    }

    fn select_by_key(
        &self,
        entity: &EntityType,
        key: sea_orm::Value,
        columns: &[Property],
    ) -> Statement {
        let mut select = Query::select();
        select
            .columns(columns.iter().map(|p| Alias::new(p.column.as_str())))
            .from(table_ref(entity))
            .and_where(Expr::col(Alias::new(entity.key_property().column.as_str())).eq(key));
        self.backend().build(&select)
    }

    /// # Errors
    /// `RepoError::Query` when sea-query rejects the value list.
    fn insert(
        &self,
        entity: &EntityType,
        values: Vec<(Property, sea_orm::Value)>,
    ) -> Result<Statement, RepoError> {
        let mut insert = Query::insert();
        insert.into_table(table_ref(entity));
        if values.is_empty() {
            insert.or_default_values();
        } else {
            let (columns, values): (Vec<_>, Vec<_>) = values
                .into_iter()
                .map(|(p, v)| (Alias::new(p.column), SimpleExpr::Value(v)))
                .unzip();
            insert.columns(columns).values(values)?;
        }
        if self.supports_returning() {
            let all = entity.properties.iter().map(|p| Alias::new(p.column.as_str()));
            insert.returning(Query::returning().columns(all));
        }
        Ok(self.backend().build(&insert))
    }

    fn update(
        &self,
        entity: &EntityType,
        key: sea_orm::Value,
        values: Vec<(Property, sea_orm::Value)>,
    ) -> Statement {
        let mut update = Query::update();
        update
            .table(table_ref(entity))
            .values(
                values
                    .into_iter()
                    .map(|(p, v)| (Alias::new(p.column), SimpleExpr::Value(v))),
            )
            .and_where(Expr::col(Alias::new(entity.key_property().column.as_str())).eq(key));
        self.backend().build(&update)
    }

    fn delete(&self, entity: &EntityType, key: sea_orm::Value) -> Statement {
        let mut delete = Query::delete();
        delete
            .from_table(table_ref(entity))
            .and_where(Expr::col(Alias::new(entity.key_property().column.as_str())).eq(key));
        self.backend().build(&delete)
    }
}

/// Schema-qualified table reference when the entity names a schema.
#[must_use]
pub fn table_ref(entity: &EntityType) -> TableRef {
    match &entity.schema {
        Some(schema) => {
            (Alias::new(schema.as_str()), Alias::new(entity.table.as_str())).into_table_ref()
        }
        None => Alias::new(entity.table.as_str()).into_table_ref(),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PostgresHelper;

impl DbHelper for PostgresHelper {
    fn backend(&self) -> DbBackend {
        DbBackend::Postgres
    }

    fn supports_returning(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MySqlHelper;

impl DbHelper for MySqlHelper {
    fn backend(&self) -> DbBackend {
        DbBackend::MySql
    }

    fn supports_returning(&self) -> bool {
        false
    }

    fn offset_requires_limit(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteHelper;

impl DbHelper for SqliteHelper {
    fn backend(&self) -> DbBackend {
        DbBackend::Sqlite
    }

    // RETURNING is available since SQLite 3.35, bundled by sqlx.
    fn supports_returning(&self) -> bool {
        true
    }

    fn offset_requires_limit(&self) -> bool {
        true
    }
}

#[must_use]
pub fn helper_for(engine: DbEngine) -> Arc<dyn DbHelper> {
    match engine {
        DbEngine::Postgres => Arc::new(PostgresHelper),
        DbEngine::MySql => Arc::new(MySqlHelper),
        DbEngine::Sqlite => Arc::new(SqliteHelper),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::entity::FieldKind;
    use crate::visitor::translate;
    use odata_core::{ODataLimits, parse_query};

    fn product(schema: Option<&str>) -> EntityType {
        let mut b = EntityType::builder("Product")
            .set_name("Products")
            .table("products")
            .key("Id")
            .property(Property::new("Id", FieldKind::I64).column("id").computed())
            .property(Property::new("Name", FieldKind::String).column("name"));
        if let Some(s) = schema {
            b = b.schema(s);
        }
        b.build().unwrap()
    }

    fn built(helper: &dyn DbHelper, entity: &EntityType, qs: &str) -> BuiltQuery {
        let q = parse_query(qs, &ODataLimits::default()).unwrap();
        helper.build_query(entity, &translate(entity, &q).unwrap())
    }

    #[test]
    fn postgres_select_with_paging_and_count() {
        let b = built(
            &PostgresHelper,
            &product(None),
            "$filter=Name%20eq%20%27Milk%27&$top=5&$skip=10&$count=true",
        );
        let sql = &b.query.sql;
        assert!(
            sql.starts_with(r#"SELECT "id", "name" FROM "products" WHERE "name" = $1"#),
            "{sql}"
        );
        assert!(sql.contains(r#"ORDER BY "id" ASC"#), "{sql}");
        assert!(sql.contains("LIMIT $2 OFFSET $3"), "{sql}");

        let count = b.count.unwrap();
        assert!(count.sql.contains("COUNT(*)"), "{}", count.sql);
        assert!(count.sql.contains(r#"WHERE "name" = $1"#), "{}", count.sql);
        assert!(!count.sql.contains("ORDER BY"), "{}", count.sql);
        assert!(!count.sql.contains("LIMIT"), "{}", count.sql);
    }

    #[test]
    fn no_count_statement_without_count_option() {
        let b = built(&SqliteHelper, &product(None), "$top=1");
        assert!(b.count.is_none());
    }

    #[test]
    fn mysql_quotes_with_backticks_and_adds_limit_for_offset() {
        let b = built(&MySqlHelper, &product(None), "$skip=3");
        let sql = &b.query.sql;
        assert!(sql.contains("FROM `products`"), "{sql}");
        assert!(sql.contains("LIMIT ? OFFSET ?"), "{sql}");
    }

    #[test]
    fn postgres_offset_without_limit() {
        let b = built(&PostgresHelper, &product(None), "$skip=3");
        assert!(!b.query.sql.contains("LIMIT"), "{}", b.query.sql);
        assert!(b.query.sql.contains("OFFSET $1"), "{}", b.query.sql);
    }

    #[test]
    fn paging_values_fit_a_signed_bind() {
        let entity = product(None);
        let mut sql = translate(&entity, &odata_core::ODataQuery::new()).unwrap();
        sql.limit = Some(u64::MAX);
        sql.offset = Some(u64::MAX);
        let values = SqliteHelper.build_query(&entity, &sql).query.values.unwrap().0;
        let max = sea_orm::Value::BigUnsigned(Some(i64::MAX.unsigned_abs()));
        assert_eq!(values.iter().filter(|v| **v == max).count(), 2, "{values:?}");
    }

    #[test]
    fn schema_qualified_table() {
        let b = built(&PostgresHelper, &product(Some("shop")), "");
        assert!(b.query.sql.contains(r#"FROM "shop"."products""#), "{}", b.query.sql);
    }

    #[test]
    fn insert_uses_returning_only_where_supported() {
        let entity = product(None);
        let name = entity.property("Name").unwrap().clone();
        let values = vec![(name, sea_orm::Value::from("Milk"))];

        let pg = PostgresHelper.insert(&entity, values.clone()).unwrap();
        assert!(
            pg.sql
                .starts_with(r#"INSERT INTO "products" ("name") VALUES ($1)"#),
            "{}",
            pg.sql
        );
        assert!(pg.sql.contains(r#"RETURNING "id", "name""#), "{}", pg.sql);

        let my = MySqlHelper.insert(&entity, values).unwrap();
        assert!(!my.sql.contains("RETURNING"), "{}", my.sql);
    }

    #[test]
    fn update_and_delete_by_key() {
        let entity = product(None);
        let name = entity.property("Name").unwrap().clone();

        let upd = SqliteHelper.update(&entity, 7i64.into(), vec![(name, "Tea".into())]);
        assert!(upd.sql.contains(r#"UPDATE "products" SET "name" = ?"#), "{}", upd.sql);
        assert!(upd.sql.contains(r#"WHERE "id" = ?"#), "{}", upd.sql);

        let del = PostgresHelper.delete(&entity, 7i64.into());
        assert_eq!(del.sql, r#"DELETE FROM "products" WHERE "id" = $1"#);
    }

    #[test]
    fn related_rows_are_restricted_by_foreign_key() {
        let entity = product(None);
        let q = parse_query("$filter=Name%20eq%20%27x%27", &ODataLimits::default()).unwrap();
        let sql_query = translate(&entity, &q).unwrap();
        let b = PostgresHelper.select_related(&entity, "category_id", 3i64.into(), &sql_query);
        assert!(b.query.sql.contains(r#""category_id" = $1"#), "{}", b.query.sql);
        assert!(b.query.sql.contains(r#""name" = $2"#), "{}", b.query.sql);
    }

    #[test]
    fn helper_for_engine() {
        assert_eq!(helper_for(DbEngine::MySql).backend(), DbBackend::MySql);
        assert!(helper_for(DbEngine::Postgres).supports_returning());
    }
}
