//! Database section of the host configuration.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ConnectOpts, DbError, Result};

static ENV_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection string; `${VAR}` placeholders are expanded from the environment.
    pub dsn: String,
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub idle_timeout: Option<Duration>,
    /// Default schema for entity types that do not name one.
    pub schema: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite::memory:".to_owned(),
            max_conns: Some(10),
            min_conns: None,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: None,
            schema: None,
        }
    }
}

impl DatabaseConfig {
    /// DSN with environment placeholders substituted.
    ///
    /// # Errors
    /// `DbError::MissingEnvVar` when a referenced variable is unset.
    pub fn resolved_dsn(&self) -> Result<String> {
        expand_env_vars(&self.dsn)
    }

    #[must_use]
    pub fn connect_opts(&self) -> ConnectOpts {
        ConnectOpts {
            max_conns: self.max_conns,
            min_conns: self.min_conns,
            acquire_timeout: Some(self.acquire_timeout),
            idle_timeout: self.idle_timeout,
            ..ConnectOpts::default()
        }
    }

    /// Copy safe to print or log.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            dsn: redact_credentials_in_dsn(Some(&self.dsn)),
            ..self.clone()
        }
    }
}

fn expand_env_vars(input: &str) -> Result<String> {
    let re = ENV_VAR
        .as_ref()
        .ok_or_else(|| DbError::InvalidConfig("env placeholder pattern".to_owned()))?;
    let mut result = input.to_owned();

    for caps in re.captures_iter(input) {
        let full_match = &caps[0];
        let var_name = &caps[1];
        let value = std::env::var(var_name).map_err(|_| DbError::MissingEnvVar {
            name: var_name.to_owned(),
        })?;
        result = result.replace(full_match, &value);
    }

    Ok(result)
}

/// Replace the password of a URL-style DSN with `***`.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: Option<&str>) -> String {
    match dsn {
        Some(dsn) if dsn.contains('@') => {
            if let Ok(mut parsed) = url::Url::parse(dsn) {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            } else {
                "***".to_owned()
            }
        }
        Some(dsn) => dsn.to_owned(),
        None => "none".to_owned(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn redacts_password() {
        let redacted = redact_credentials_in_dsn(Some("postgres://app:s3cret@db:5432/shop"));
        assert_eq!(redacted, "postgres://app:***@db:5432/shop");
        assert_eq!(redact_credentials_in_dsn(Some("sqlite::memory:")), "sqlite::memory:");
        assert_eq!(redact_credentials_in_dsn(None), "none");
    }

    #[test]
    fn placeholder_without_variable_fails() {
        let cfg = DatabaseConfig {
            dsn: "postgres://app:${ODATA_TEST_SURELY_UNSET_VAR}@db/shop".to_owned(),
            ..DatabaseConfig::default()
        };
        assert!(matches!(
            cfg.resolved_dsn(),
            Err(DbError::MissingEnvVar { name }) if name == "ODATA_TEST_SURELY_UNSET_VAR"
        ));
    }

    #[test]
    fn plain_dsn_is_unchanged() {
        let cfg = DatabaseConfig::default();
        assert_eq!(cfg.resolved_dsn().unwrap(), "sqlite::memory:");
        assert_eq!(cfg.connect_opts().max_conns, Some(10));
    }

    #[test]
    fn deserializes_humantime_durations() {
        let cfg: DatabaseConfig =
            serde_json::from_str(r#"{"dsn":"sqlite::memory:","acquire_timeout":"5s","idle_timeout":"2m"}"#)
                .unwrap();
        assert_eq!(cfg.acquire_timeout, Duration::from_secs(5));
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(120)));
    }
}
