use anyhow::{Context, Result};
use odata_db::DbHandle;
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, migrations::Migrator};
use crate::config::AppConfig;

/// Connect, migrate and build the router for `config`.
///
/// # Errors
/// Connection, migration or registry failures.
pub async fn build_app(config: &AppConfig) -> Result<axum::Router> {
    let dsn = config.database.resolved_dsn()?;
    let db = DbHandle::connect(&dsn, config.database.connect_opts())
        .await
        .with_context(|| format!("connecting to {}", config.database.redacted().dsn))?;
    tracing::info!(engine = ?db.engine(), "database connected");

    Migrator::up(db.conn(), None)
        .await
        .context("running catalog migrations")?;

    let service = catalog::service(db, config.database.schema.as_deref(), &config.server)?;
    Ok(odata_server::router(service, &config.server))
}

/// Serve until `cancel` fires.
///
/// # Errors
/// Startup failures or a failed bind.
pub async fn run(config: AppConfig, cancel: CancellationToken) -> Result<()> {
    let app = build_app(&config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        base_path = %config.server.service_root(),
        "OData service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serving HTTP")?;
    tracing::info!("server stopped");
    Ok(())
}
