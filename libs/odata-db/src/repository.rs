//! Statement execution for metadata-described entities.
//!
//! The repository is stateless apart from the dialect helper, so one instance
//! serves every entity type; callers pass the connection (pool or
//! transaction) explicitly.

use std::sync::Arc;

use sea_orm::{ConnectionTrait, DbErr, SqlErr, Statement};
use serde_json::Value as Json;
use thiserror::Error;

use crate::DbEngine;
use crate::dialect::{COUNT_ALIAS, DbHelper, helper_for};
use crate::entity::{EntityError, EntityType, Property, ResolvedNavigation};
use crate::row::{FieldViolation, JsonObject, json_to_value, row_to_json};
use crate::visitor::{SqlQuery, TranslateError};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Db(DbErr),

    #[error("statement build error: {0}")]
    Query(#[from] sea_orm::sea_query::error::Error),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("foreign key constraint violated: {0}")]
    ForeignKey(String),

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("request body has {} invalid propert(ies)", .0.len())]
    Body(Vec<FieldViolation>),

    #[error("inserted row of '{0}' could not be read back")]
    MissingInsertedRow(String),
}

impl From<DbErr> for RepoError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg)) => RepoError::Conflict(msg),
            Some(SqlErr::ForeignKeyConstraintViolation(msg)) => RepoError::ForeignKey(msg),
            _ => RepoError::Db(err),
        }
    }
}

impl From<Vec<FieldViolation>> for RepoError {
    fn from(violations: Vec<FieldViolation>) -> Self {
        RepoError::Body(violations)
    }
}

/// Page of rows plus the inline count when one was requested.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindResult {
    pub rows: Vec<JsonObject>,
    pub count: Option<u64>,
}

/// What a navigation read produced.
#[derive(Clone, Debug, PartialEq)]
pub enum Related {
    One(Option<JsonObject>),
    Many(FindResult),
}

impl Related {
    /// JSON for inlining under `$expand`.
    #[must_use]
    pub fn into_json(self) -> Json {
        match self {
            Related::One(row) => row.map_or(Json::Null, Json::Object),
            Related::Many(found) => Json::Array(found.rows.into_iter().map(Json::Object).collect()),
        }
    }
}

#[derive(Clone)]
pub struct Repository {
    helper: Arc<dyn DbHelper>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("backend", &self.helper.backend())
            .finish()
    }
}

impl Repository {
    #[must_use]
    pub fn new(helper: Arc<dyn DbHelper>) -> Self {
        Self { helper }
    }

    #[must_use]
    pub fn for_engine(engine: DbEngine) -> Self {
        Self::new(helper_for(engine))
    }

    #[must_use]
    pub fn helper(&self) -> &dyn DbHelper {
        self.helper.as_ref()
    }

    /// Rows matching the query, plus `COUNT(*)` when `inline_count` is set.
    ///
    /// # Errors
    /// Driver and decode failures.
    pub async fn find<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &EntityType,
        query: &SqlQuery,
    ) -> Result<FindResult, RepoError> {
        let built = self.helper.build_query(entity, query);
        self.run_built(conn, built, &query.selected).await
    }

    /// Number of rows matching the query's filter, ignoring paging.
    ///
    /// # Errors
    /// Driver failures.
    pub async fn count<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &EntityType,
        query: &SqlQuery,
    ) -> Result<u64, RepoError> {
        let counting = SqlQuery {
            inline_count: true,
            limit: None,
            offset: None,
            ..query.clone()
        };
        let built = self.helper.build_query(entity, &counting);
        match built.count {
            Some(stmt) => fetch_count(conn, stmt).await,
            None => Ok(0),
        }
    }

    /// # Errors
    /// Driver and decode failures; a missing row is `Ok(None)`.
    pub async fn find_by_key<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &EntityType,
        key: sea_orm::Value,
        columns: &[Property],
    ) -> Result<Option<JsonObject>, RepoError> {
        let stmt = self.helper.select_by_key(entity, key, columns);
        tracing::debug!(entity = %entity.name, sql = %stmt.sql, "select by key");
        match conn.query_one(stmt).await? {
            Some(row) => Ok(Some(row_to_json(&row, columns)?)),
            None => Ok(None),
        }
    }

    /// Insert one row and return it as stored, computed columns included.
    ///
    /// # Errors
    /// Constraint violations map to `Conflict` / `ForeignKey`.
    pub async fn insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &EntityType,
        values: Vec<(Property, sea_orm::Value)>,
    ) -> Result<JsonObject, RepoError> {
        let supplied_key = values
            .iter()
            .find(|(p, _)| p.name == entity.key)
            .map(|(_, v)| v.clone());
        let stmt = self.helper.insert(entity, values)?;
        tracing::debug!(entity = %entity.name, sql = %stmt.sql, "insert");

        if self.helper.supports_returning() {
            let row = conn
                .query_one(stmt)
                .await?
                .ok_or_else(|| RepoError::MissingInsertedRow(entity.name.clone()))?;
            return Ok(row_to_json(&row, &entity.properties)?);
        }

        let result = conn.execute(stmt).await?;
        let key = supplied_key
            .unwrap_or_else(|| sea_orm::Value::BigUnsigned(Some(result.last_insert_id())));
        self.find_by_key(conn, entity, key, &entity.properties)
            .await?
            .ok_or_else(|| RepoError::MissingInsertedRow(entity.name.clone()))
    }

    /// # Errors
    /// Driver failures and constraint violations.
    pub async fn update<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &EntityType,
        key: sea_orm::Value,
        values: Vec<(Property, sea_orm::Value)>,
    ) -> Result<u64, RepoError> {
        if values.is_empty() {
            let exists = self
                .find_by_key(conn, entity, key, std::slice::from_ref(entity.key_property()))
                .await?;
            return Ok(u64::from(exists.is_some()));
        }
        let stmt = self.helper.update(entity, key, values);
        tracing::debug!(entity = %entity.name, sql = %stmt.sql, "update");
        Ok(conn.execute(stmt).await?.rows_affected())
    }

    /// # Errors
    /// Driver failures; a foreign key still pointing at the row is `ForeignKey`.
    pub async fn delete<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &EntityType,
        key: sea_orm::Value,
    ) -> Result<u64, RepoError> {
        let stmt = self.helper.delete(entity, key);
        tracing::debug!(entity = %entity.name, sql = %stmt.sql, "delete");
        Ok(conn.execute(stmt).await?.rows_affected())
    }

    /// Follow a navigation from an already loaded source row.
    ///
    /// `source_row` must contain the foreign key (to-one) or the key
    /// (one-to-many). `query` is translated against the target type.
    ///
    /// # Errors
    /// Driver failures, or `InvalidValue` when the linking value cannot be
    /// converted to the target column type.
    pub async fn find_related<C: ConnectionTrait>(
        &self,
        conn: &C,
        source: &EntityType,
        nav: &ResolvedNavigation<'_>,
        source_row: &JsonObject,
        query: &SqlQuery,
    ) -> Result<Related, RepoError> {
        let target = nav.target.as_ref();

        if nav.navigation.kind.is_collection() {
            let key_prop = source.key_property();
            let link = linking_value(source_row, key_prop, &nav.foreign_key)?;
            let Some(link) = link else {
                return Ok(Related::Many(FindResult::default()));
            };
            let built = self
                .helper
                .select_related(target, &nav.foreign_key.column, link, query);
            return Ok(Related::Many(self.run_built(conn, built, &query.selected).await?));
        }

        let target_key = target.key_property();
        let Some(link) = linking_value(source_row, &nav.foreign_key, target_key)? else {
            return Ok(Related::One(None));
        };
        let built = self
            .helper
            .select_related(target, &target_key.column, link, query);
        let found = self.run_built(conn, built, &query.selected).await?;
        Ok(Related::One(found.rows.into_iter().next()))
    }

    async fn run_built<C: ConnectionTrait>(
        &self,
        conn: &C,
        built: crate::BuiltQuery,
        selected: &[Property],
    ) -> Result<FindResult, RepoError> {
        tracing::debug!(sql = %built.query.sql, "select");
        let rows = conn
            .query_all(built.query)
            .await?
            .iter()
            .map(|row| row_to_json(row, selected))
            .collect::<Result<Vec<_>, _>>()?;

        let count = match built.count {
            Some(stmt) => Some(fetch_count(conn, stmt).await?),
            None => None,
        };
        Ok(FindResult { rows, count })
    }
}

/// Read `from` out of the row and convert it for comparison with `to`.
/// `None` when the row holds null (or lacks the property).
fn linking_value(
    row: &JsonObject,
    from: &Property,
    to: &Property,
) -> Result<Option<sea_orm::Value>, RepoError> {
    match row.get(&from.name) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => json_to_value(to, v)
            .map(Some)
            .map_err(|message| RepoError::InvalidValue {
                field: from.name.clone(),
                message,
            }),
    }
}

async fn fetch_count<C: ConnectionTrait>(conn: &C, stmt: Statement) -> Result<u64, RepoError> {
    tracing::debug!(sql = %stmt.sql, "count");
    let Some(row) = conn.query_one(stmt).await? else {
        return Ok(0);
    };
    let n: i64 = row.try_get("", COUNT_ALIAS)?;
    Ok(n.unsigned_abs())
}
