//! Entity key predicates: the `(...)` part of `/Products(42)`.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use uuid::Uuid;

use crate::{Error, ast::Value};

/// A single-property key as written in a resource path.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityKey {
    /// Property name for the `Name=value` form.
    pub name: Option<String>,
    pub value: Value,
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name}=")?;
        }
        match &self.value {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Date(d) => write!(f, "{d}"),
            Value::Time(t) => write!(f, "{t}"),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// Parse the text between the parentheses of a key predicate.
///
/// Accepted forms: `42`, `-7`, `'text'` (with `''` as an escaped quote),
/// a bare GUID, `true`/`false`, and `Name=<any of these>`.
///
/// # Errors
/// `Error::InvalidKey` for empty, composite or malformed predicates.
pub fn parse_key(raw: &str) -> Result<EntityKey, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidKey("empty key".into()));
    }

    if raw.starts_with('\'') {
        return Ok(EntityKey {
            name: None,
            value: parse_literal(raw)?,
        });
    }

    match raw.split_once('=') {
        Some((name, value)) => {
            let name = name.trim();
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(Error::InvalidKey(format!("invalid key property name: {name}")));
            }
            if value.contains(',') && !value.trim_start().starts_with('\'') {
                return Err(Error::InvalidKey("composite keys are not supported".into()));
            }
            Ok(EntityKey {
                name: Some(name.to_owned()),
                value: parse_literal(value.trim())?,
            })
        }
        None => Ok(EntityKey {
            name: None,
            value: parse_literal(raw)?,
        }),
    }
}

fn parse_literal(raw: &str) -> Result<Value, Error> {
    if let Some(inner) = raw.strip_prefix('\'') {
        let Some(body) = inner.strip_suffix('\'') else {
            return Err(Error::InvalidKey(format!("unterminated string: {raw}")));
        };
        // Every quote inside the literal must be doubled.
        if body.replace("''", "").contains('\'') {
            return Err(Error::InvalidKey(format!("unescaped quote in {raw}")));
        }
        return Ok(Value::String(body.replace("''", "'")));
    }

    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Err(Error::InvalidKey("null is not a valid key".into())),
        _ => {}
    }

    if raw.len() == 36 {
        if let Ok(uuid) = Uuid::parse_str(raw) {
            return Ok(Value::Uuid(uuid));
        }
    }

    let numeric = raw
        .strip_suffix(['L', 'l', 'M', 'm'])
        .unwrap_or(raw);
    BigDecimal::from_str(numeric)
        .map(Value::Number)
        .map_err(|_| Error::InvalidKey(format!("unrecognised key literal: {raw}")))
}

/// Render a key value the way it appears inside a resource path.
#[must_use]
pub fn format_key_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => {
            if Uuid::parse_str(s).is_ok() && s.len() == 36 {
                s.clone()
            } else {
                format!("'{}'", s.replace('\'', "''"))
            }
        }
        other => other.to_string(),
    }
}
