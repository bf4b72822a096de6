//! Host configuration: defaults, then the YAML file, then `ODATA__*`
//! environment variables, then command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use odata_db::DatabaseConfig;
use odata_server::ServerConfig;
use serde::{Deserialize, Serialize};

/// `ODATA__SERVER__BIND_ADDR=0.0.0.0:9000` sets `server.bind_addr`.
pub const ENV_PREFIX: &str = "ODATA__";

const MOCK_DSN: &str = "sqlite::memory:";

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Command-line flags that win over every other layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub mock: bool,
    pub verbose: u8,
}

impl AppConfig {
    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// # Errors
    /// Unreadable YAML, unknown keys or values of the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::figment(path)
            .extract()
            .context("failed to load configuration")
    }

    pub fn apply_cli_overrides(&mut self, cli: &CliOverrides) {
        if let Some(port) = cli.port {
            self.server.bind_addr = with_port(&self.server.bind_addr, port);
        }
        if cli.mock {
            self.database = DatabaseConfig {
                dsn: MOCK_DSN.to_owned(),
                max_conns: Some(1),
                ..self.database.clone()
            };
        }
        let level = match cli.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        };
        if let Some(level) = level {
            level.clone_into(&mut self.logging.level);
        }
    }

    /// YAML rendering with database credentials redacted.
    ///
    /// # Errors
    /// Serialization failures.
    pub fn to_yaml(&self) -> Result<String> {
        let printable = AppConfig {
            database: self.database.redacted(),
            ..self.clone()
        };
        serde_yaml::to_string(&printable).context("failed to render configuration")
    }
}

fn with_port(bind_addr: &str, port: u16) -> String {
    match bind_addr.rsplit_once(':') {
        Some((host, _)) => format!("{host}:{port}"),
        None => format!("{bind_addr}:{port}"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        let cfg = AppConfig::load(None).unwrap();
        assert_eq!(cfg.server.base_path, "/odata");
        assert_eq!(cfg.database.dsn, "sqlite::memory:");
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let file = yaml_file(
            r"
server:
  bind_addr: 0.0.0.0:9000
  namespace: Shop
  max_page_size: 50
database:
  dsn: sqlite://catalog.db?mode=rwc
  acquire_timeout: 5s
logging:
  format: json
",
        );
        let cfg = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.server.namespace, "Shop");
        assert_eq!(cfg.server.max_page_size, Some(50));
        assert_eq!(cfg.server.base_path, "/odata");
        assert_eq!(cfg.database.acquire_timeout, std::time::Duration::from_secs(5));
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = yaml_file("server:\n  bind_address: 0.0.0.0:9000\n");
        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn cli_overrides_win() {
        let mut cfg = AppConfig::default();
        cfg.database.dsn = "postgres://app:pw@db/shop".to_owned();
        cfg.apply_cli_overrides(&CliOverrides {
            port: Some(9100),
            mock: true,
            verbose: 2,
        });
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:9100");
        assert_eq!(cfg.database.dsn, "sqlite::memory:");
        assert_eq!(cfg.database.max_conns, Some(1));
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn printed_config_hides_passwords() {
        let mut cfg = AppConfig::default();
        cfg.database.dsn = "postgres://app:s3cret@db:5432/shop".to_owned();
        let yaml = cfg.to_yaml().unwrap();
        assert!(yaml.contains("postgres://app:***@db:5432/shop"));
        assert!(!yaml.contains("s3cret"));
    }
}
