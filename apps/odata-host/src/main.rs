mod catalog;
mod config;
mod logging;
mod server;
mod shutdown;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, CliOverrides};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Serves the demo product catalog over OData v4.
#[derive(Parser)]
#[command(name = "odata-host", version)]
struct Cli {
    /// YAML file layered over the built-in defaults
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen on this port instead of the configured one
    #[arg(short, long)]
    port: Option<u16>,

    /// Dump the merged configuration as YAML, then exit
    #[arg(long)]
    print_config: bool,

    /// Raise the log level; repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Ignore the configured database and serve from a fresh in-memory SQLite
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Migrate the database and serve requests (default)
    Run,
    /// Resolve the database DSN and entity model without serving
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = cli.config.as_deref().filter(|p| !p.is_file()) {
        anyhow::bail!("no config file at {}", path.display());
    }

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliOverrides {
        port: cli.port,
        mock: cli.mock,
        verbose: cli.verbose,
    });

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    logging::init_logging(&config.logging);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(
                bind_addr = %config.server.bind_addr,
                database = %config.database.redacted().dsn,
                "odata-host starting"
            );
            let cancel = CancellationToken::new();
            shutdown::cancel_on_signal(cancel.clone());
            server::run(config, cancel).await
        }
        Command::Check => check_config(&config),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    config.database.resolved_dsn()?;
    let registry = catalog::registry(config.database.schema.as_deref())?;
    let sets: Vec<&str> = registry.iter().map(|e| e.set_name.as_str()).collect();
    println!("ok: {}", sets.join(", "));
    Ok(())
}
