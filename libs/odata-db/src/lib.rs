#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! SeaORM storage for OData entity sets.
//!
//! An [`EntityRegistry`] describes tables as entity types; [`translate`] turns
//! parsed query options into sea-query statements which [`Repository`] runs on
//! a pooled connection ([`DbHandle`]) or inside a [`TransactionContext`].
//!
//! Drivers are opt-in through the `pg`, `mysql` and `sqlite` features.

#![cfg_attr(
    not(any(feature = "pg", feature = "mysql", feature = "sqlite")),
    allow(unused_imports, unused_variables, dead_code, unreachable_code)
)]

pub mod config;
pub mod dialect;
pub mod entity;
pub mod repository;
pub mod row;
pub mod transaction;
pub mod visitor;

#[cfg(any(feature = "pg", feature = "mysql", feature = "sqlite"))]
mod pool_opts;

pub use config::{DatabaseConfig, redact_credentials_in_dsn};
pub use dialect::{BuiltQuery, DbHelper, MySqlHelper, PostgresHelper, SqliteHelper, helper_for};
pub use entity::{
    EntityError, EntityRegistry, EntityType, EntityTypeBuilder, FieldKind, Navigation,
    NavigationKind, Property, ResolvedNavigation,
};
pub use repository::{FindResult, Related, RepoError, Repository};
pub use row::{BodyMode, FieldViolation, JsonObject, body_to_values};
pub use transaction::TransactionContext;
pub use visitor::{SqlQuery, TranslateError, translate};

use std::time::Duration;

#[cfg(any(feature = "pg", feature = "mysql", feature = "sqlite"))]
use pool_opts::pool_options;

#[cfg(feature = "mysql")]
use sea_orm::SqlxMySqlConnector;
#[cfg(feature = "pg")]
use sea_orm::SqlxPostgresConnector;
#[cfg(feature = "sqlite")]
use sea_orm::SqlxSqliteConnector;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

/// Failures while configuring or opening the connection pool.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("unrecognised database url scheme: {0}")]
    UnknownDsn(String),

    #[error("driver not compiled in: {0}")]
    FeatureDisabled(&'static str),

    #[error("bad database configuration: {0}")]
    InvalidConfig(String),

    #[error("Environment variable '{name}' is not set")]
    MissingEnvVar { name: String },

    #[cfg(any(feature = "pg", feature = "mysql", feature = "sqlite"))]
    #[error(transparent)]
    Sqlx(#[from] sea_orm::sqlx::Error),

    #[error(transparent)]
    Sea(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbEngine {
    Postgres,
    MySql,
    Sqlite,
}

impl DbEngine {
    #[must_use]
    pub fn backend(self) -> DbBackend {
        match self {
            DbEngine::Postgres => DbBackend::Postgres,
            DbEngine::MySql => DbBackend::MySql,
            DbEngine::Sqlite => DbBackend::Sqlite,
        }
    }
}

impl From<DbBackend> for DbEngine {
    fn from(backend: DbBackend) -> Self {
        match backend {
            DbBackend::Postgres => DbEngine::Postgres,
            DbBackend::MySql => DbEngine::MySql,
            DbBackend::Sqlite => DbEngine::Sqlite,
        }
    }
}

/// Pool sizing and timeouts for [`DbHandle::connect`].
#[derive(Clone, Debug)]
pub struct ConnectOpts {
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    pub acquire_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// `mkdir -p` the directory of a file-backed `SQLite` database.
    pub create_sqlite_dirs: bool,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            max_conns: Some(10),
            min_conns: None,
            acquire_timeout: Some(Duration::from_secs(30)),
            idle_timeout: None,
            create_sqlite_dirs: true,
        }
    }
}

/// Main handle: engine, redacted DSN and the SeaORM connection pool.
#[derive(Debug, Clone)]
pub struct DbHandle {
    engine: DbEngine,
    dsn: String,
    sea: DatabaseConnection,
}

impl DbHandle {
    /// Engine named by the DSN scheme.
    ///
    /// # Errors
    /// `DbError::UnknownDsn` for anything but postgres, mysql or sqlite urls.
    pub fn detect(dsn: &str) -> Result<DbEngine> {
        const SCHEMES: [(&str, DbEngine); 4] = [
            ("postgres://", DbEngine::Postgres),
            ("postgresql://", DbEngine::Postgres),
            ("mysql://", DbEngine::MySql),
            ("sqlite:", DbEngine::Sqlite),
        ];
        let url = dsn.trim_start();
        SCHEMES
            .iter()
            .find(|(scheme, _)| url.starts_with(scheme))
            .map(|&(_, engine)| engine)
            .ok_or_else(|| DbError::UnknownDsn(redact_credentials_in_dsn(Some(dsn))))
    }

    /// Open a pool for `dsn`. `SQLite` connections get `foreign_keys` turned on.
    ///
    /// # Errors
    /// Unknown scheme, disabled driver or a failed connection.
    pub async fn connect(dsn: &str, opts: ConnectOpts) -> Result<Self> {
        let engine = Self::detect(dsn)?;
        let redacted = redact_credentials_in_dsn(Some(dsn));
        tracing::debug!(dsn = %redacted, ?engine, "connecting to database");

        let sea = match engine {
            #[cfg(feature = "pg")]
            DbEngine::Postgres => {
                let pool = pool_options::<sea_orm::sqlx::Postgres>(&opts).connect(dsn).await?;
                SqlxPostgresConnector::from_sqlx_postgres_pool(pool)
            }
            #[cfg(not(feature = "pg"))]
            DbEngine::Postgres => {
                return Err(DbError::FeatureDisabled("pg"));
            }
            #[cfg(feature = "mysql")]
            DbEngine::MySql => {
                let pool = pool_options::<sea_orm::sqlx::MySql>(&opts).connect(dsn).await?;
                SqlxMySqlConnector::from_sqlx_mysql_pool(pool)
            }
            #[cfg(not(feature = "mysql"))]
            DbEngine::MySql => return Err(DbError::FeatureDisabled("mysql")),
            #[cfg(feature = "sqlite")]
            DbEngine::Sqlite => {
                prepare_sqlite_path(dsn, opts.create_sqlite_dirs)?;
                let mut pool_opts = pool_options::<sea_orm::sqlx::Sqlite>(&opts);
                if is_memory_dsn(dsn) {
                    // The database lives only as long as one of its connections.
                    pool_opts = pool_opts
                        .min_connections(opts.min_conns.unwrap_or(1).max(1))
                        .idle_timeout(None)
                        .max_lifetime(None);
                }
                let pool = pool_opts
                    .after_connect(|conn, _meta| {
                        Box::pin(async move {
                            sea_orm::sqlx::query("PRAGMA foreign_keys = ON")
                                .execute(&mut *conn)
                                .await?;
                            Ok(())
                        })
                    })
                    .connect(dsn)
                    .await?;
                SqlxSqliteConnector::from_sqlx_sqlite_pool(pool)
            }
            #[cfg(not(feature = "sqlite"))]
            DbEngine::Sqlite => return Err(DbError::FeatureDisabled("sqlite")),
        };

        tracing::info!(dsn = %redacted, ?engine, "database connected");
        Ok(Self {
            engine,
            dsn: redacted,
            sea,
        })
    }

    /// Wrap an existing SeaORM connection (mock connections in tests, externally built pools).
    #[must_use]
    pub fn from_connection(sea: DatabaseConnection) -> Self {
        let engine = DbEngine::from(sea.get_database_backend());
        Self {
            engine,
            dsn: String::from("external"),
            sea,
        }
    }

    /// # Errors
    /// When the pool does not close cleanly.
    pub async fn close(self) -> Result<()> {
        self.sea.close().await?;
        Ok(())
    }

    #[must_use]
    pub fn engine(&self) -> DbEngine {
        self.engine
    }

    /// The DSN with credentials redacted.
    #[must_use]
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Shared SeaORM connection pool.
    #[must_use]
    pub fn conn(&self) -> &DatabaseConnection {
        &self.sea
    }

    /// Start a request-scoped transaction.
    ///
    /// # Errors
    /// Returns an error if a connection cannot be acquired.
    pub async fn begin(&self) -> Result<TransactionContext> {
        Ok(TransactionContext::begin(self).await?)
    }
}

#[cfg(feature = "sqlite")]
fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

/// Create the parent directory of a file-backed `SQLite` DSN.
#[cfg(feature = "sqlite")]
fn prepare_sqlite_path(dsn: &str, create_dirs: bool) -> Result<()> {
    if !create_dirs || is_memory_dsn(dsn) {
        return Ok(());
    }
    let path = dsn
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn detect_by_scheme() {
        assert_eq!(
            DbHandle::detect("postgres://u:p@localhost/db").unwrap(),
            DbEngine::Postgres
        );
        assert_eq!(
            DbHandle::detect("mysql://localhost/db").unwrap(),
            DbEngine::MySql
        );
        assert_eq!(
            DbHandle::detect("sqlite::memory:").unwrap(),
            DbEngine::Sqlite
        );
    }

    #[test]
    fn unknown_dsn_is_redacted() {
        let err = DbHandle::detect("oracle://scott:tiger@db/xe").unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains("tiger"), "{msg}");
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn memory_dsns_are_recognised() {
        assert!(is_memory_dsn("sqlite::memory:"));
        assert!(is_memory_dsn("sqlite:file:test?mode=memory&cache=shared"));
        assert!(!is_memory_dsn("sqlite://data/app.db"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn connect_sqlite_memory() {
        let db = DbHandle::connect("sqlite::memory:", ConnectOpts::default())
            .await
            .unwrap();
        assert_eq!(db.engine(), DbEngine::Sqlite);
        db.close().await.unwrap();
    }
}
