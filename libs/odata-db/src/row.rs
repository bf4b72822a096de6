//! Row ↔ JSON marshalling driven by [`FieldKind`].

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{DbErr, QueryResult, TryGetable};
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::entity::{EntityType, FieldKind, Property};
use crate::visitor::null_value;

pub type JsonObject = Map<String, Json>;

/// A property a request body could not supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_owned(),
            message: message.into(),
        }
    }
}

/// How a request body maps onto the entity's properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyMode {
    /// POST: every supplied non-computed property.
    Create,
    /// PATCH: only the supplied properties, never the key.
    Merge,
    /// PUT: every non-key, non-computed property; missing ones become null.
    Replace,
}

fn get<T: TryGetable>(row: &QueryResult, col: &str) -> Result<Option<T>, DbErr> {
    row.try_get::<Option<T>>("", col)
}

/// Read one column as JSON. Drivers disagree on integer widths and on
/// how `SQLite` stores uuids and timestamps, so narrower fallbacks are tried.
///
/// # Errors
/// The last decode error when no representation fits.
pub fn column_to_json(row: &QueryResult, prop: &Property) -> Result<Json, DbErr> {
    let col = prop.column.as_str();
    let value = match prop.kind {
        FieldKind::String => get::<String>(row, col)?.map(Json::String),
        FieldKind::I64 => get::<i64>(row, col)
            .or_else(|_| get::<i32>(row, col).map(|v| v.map(i64::from)))
            .or_else(|_| get::<i16>(row, col).map(|v| v.map(i64::from)))?
            .map(Json::from),
        FieldKind::F64 => get::<f64>(row, col)
            .or_else(|_| get::<f32>(row, col).map(|v| v.map(f64::from)))?
            .map(Json::from),
        FieldKind::Bool => get::<bool>(row, col)?.map(Json::Bool),
        FieldKind::Decimal => get::<Decimal>(row, col)
            .map(|v| v.map(|d| d.normalize().to_string()))
            .or_else(|_| get::<f64>(row, col).map(|v| v.map(|f| f.to_string())))
            .or_else(|_| get::<String>(row, col))?
            .map(Json::String),
        FieldKind::Uuid => get::<Uuid>(row, col)
            .map(|v| v.map(|u| u.to_string()))
            .or_else(|_| get::<String>(row, col))?
            .map(Json::String),
        FieldKind::DateTimeUtc => get::<DateTime<Utc>>(row, col)
            .or_else(|_| get::<NaiveDateTime>(row, col).map(|v| v.map(|n| n.and_utc())))?
            .map(|dt| Json::String(dt.to_rfc3339())),
        FieldKind::Date => get::<NaiveDate>(row, col)?.map(|d| Json::String(d.to_string())),
        FieldKind::Time => get::<NaiveTime>(row, col)?.map(|t| Json::String(t.to_string())),
    };
    Ok(value.unwrap_or(Json::Null))
}

/// Render the selected properties of a row as a JSON object keyed by API name.
///
/// # Errors
/// Decode failures from the driver.
pub fn row_to_json(row: &QueryResult, selected: &[Property]) -> Result<JsonObject, DbErr> {
    let mut obj = Map::with_capacity(selected.len());
    for prop in selected {
        obj.insert(prop.name.clone(), column_to_json(row, prop)?);
    }
    Ok(obj)
}

/// Convert one JSON value to a database value for `prop`.
///
/// # Errors
/// A message describing why the value does not fit the property.
pub fn json_to_value(prop: &Property, value: &Json) -> Result<sea_orm::Value, String> {
    use sea_orm::Value as V;

    if value.is_null() {
        if !prop.nullable {
            return Err("property is not nullable".to_owned());
        }
        return Ok(null_value(prop.kind));
    }

    let expected = || format!("expected {}", prop.kind.edm_type());
    let text = || value.as_str().ok_or_else(expected);

    Ok(match prop.kind {
        FieldKind::String => V::String(Some(Box::new(text()?.to_owned()))),
        FieldKind::I64 => V::BigInt(Some(value.as_i64().ok_or_else(expected)?)),
        FieldKind::F64 => V::Double(Some(value.as_f64().ok_or_else(expected)?)),
        FieldKind::Bool => V::Bool(Some(value.as_bool().ok_or_else(expected)?)),
        FieldKind::Decimal => {
            let raw = match value {
                Json::Number(n) => n.to_string(),
                Json::String(s) => s.clone(),
                _ => return Err(expected()),
            };
            let d = Decimal::from_str(&raw)
                .or_else(|_| Decimal::from_scientific(&raw))
                .map_err(|e| e.to_string())?;
            V::Decimal(Some(Box::new(d)))
        }
        FieldKind::Uuid => {
            let u = Uuid::parse_str(text()?).map_err(|e| e.to_string())?;
            V::Uuid(Some(Box::new(u)))
        }
        FieldKind::DateTimeUtc => {
            let dt = DateTime::parse_from_rfc3339(text()?)
                .map_err(|e| e.to_string())?
                .with_timezone(&Utc);
            V::ChronoDateTimeUtc(Some(Box::new(dt)))
        }
        FieldKind::Date => {
            let d = NaiveDate::from_str(text()?).map_err(|e| e.to_string())?;
            V::ChronoDate(Some(Box::new(d)))
        }
        FieldKind::Time => {
            let t = NaiveTime::from_str(text()?).map_err(|e| e.to_string())?;
            V::ChronoTime(Some(Box::new(t)))
        }
    })
}

/// Map a JSON request body onto column values.
///
/// Instance annotations (`@odata.*`, `Prop@...`) are skipped; computed
/// properties are ignored; unknown properties and navigations are rejected.
///
/// # Errors
/// Every offending property, so clients can fix them in one round trip.
pub fn body_to_values(
    entity: &EntityType,
    body: &JsonObject,
    mode: BodyMode,
) -> Result<Vec<(Property, sea_orm::Value)>, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    let mut values = Vec::new();

    for (name, value) in body {
        if name.contains('@') {
            continue;
        }
        let Some(prop) = entity.property(name) else {
            let message = if entity.navigation(name).is_some() {
                "navigation properties cannot be written inline"
            } else {
                "unknown property"
            };
            violations.push(FieldViolation::new(name, message));
            continue;
        };
        let is_key = prop.name == entity.key;
        if prop.computed || (is_key && mode != BodyMode::Create) {
            continue;
        }
        match json_to_value(prop, value) {
            Ok(v) => values.push((prop.clone(), v)),
            Err(message) => violations.push(FieldViolation::new(&prop.name, message)),
        }
    }

    if mode == BodyMode::Replace {
        for prop in &entity.properties {
            let supplied = values.iter().any(|(p, _)| p.name == prop.name);
            if supplied || prop.computed || prop.name == entity.key {
                continue;
            }
            if prop.nullable {
                values.push((prop.clone(), null_value(prop.kind)));
            } else if !violations.iter().any(|v| v.field == prop.name) {
                violations.push(FieldViolation::new(&prop.name, "required property is missing"));
            }
        }
    }

    if violations.is_empty() {
        Ok(values)
    } else {
        Err(violations)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::entity::Navigation;
    use serde_json::json;

    fn product() -> EntityType {
        EntityType::builder("Product")
            .key("Id")
            .property(Property::new("Id", FieldKind::I64).column("id").computed())
            .property(Property::new("Name", FieldKind::String).column("name"))
            .property(Property::new("Price", FieldKind::Decimal).column("price").nullable())
            .property(Property::new("Released", FieldKind::Date).column("released").nullable())
            .navigation(Navigation::many_to_one("Category", "Category", "Id"))
            .build()
            .unwrap()
    }

    fn obj(v: Json) -> JsonObject {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn create_body_skips_computed_and_annotations() {
        let body = obj(json!({
            "@odata.type": "#Default.Product",
            "Id": 99,
            "Name": "Milk",
            "Price": "1.25",
        }));
        let values = body_to_values(&product(), &body, BodyMode::Create).unwrap();
        let names: Vec<&str> = values.iter().map(|(p, _)| p.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Name"));
        assert!(names.contains(&"Price"));
    }

    #[test]
    fn unknown_and_mistyped_properties_are_all_reported() {
        let body = obj(json!({"Colour": "red", "Name": 5, "Category": {"Id": 1}}));
        let errs = body_to_values(&product(), &body, BodyMode::Merge).unwrap_err();
        assert_eq!(errs.len(), 3);
        assert!(errs.iter().any(|v| v.field == "Colour" && v.message == "unknown property"));
        assert!(errs.iter().any(|v| v.field == "Name" && v.message.contains("Edm.String")));
        assert!(errs.iter().any(|v| v.field == "Category"));
    }

    #[test]
    fn replace_nulls_missing_nullable_and_requires_the_rest() {
        let values = body_to_values(&product(), &obj(json!({"Name": "Tea"})), BodyMode::Replace)
            .unwrap();
        assert_eq!(values.len(), 3);
        assert!(
            values
                .iter()
                .any(|(p, v)| p.name == "Released" && *v == sea_orm::Value::ChronoDate(None))
        );

        let errs = body_to_values(&product(), &obj(json!({})), BodyMode::Replace).unwrap_err();
        assert_eq!(
            errs,
            vec![FieldViolation::new("Name", "required property is missing")]
        );
    }

    #[test]
    fn null_only_for_nullable_properties() {
        let p = product();
        assert!(json_to_value(p.property("Name").unwrap(), &Json::Null).is_err());
        assert_eq!(
            json_to_value(p.property("Price").unwrap(), &Json::Null).unwrap(),
            sea_orm::Value::Decimal(None)
        );
    }

    #[test]
    fn decimal_from_number_or_string() {
        let price = product().property("Price").cloned().unwrap();
        let expected = sea_orm::Value::Decimal(Some(Box::new(Decimal::new(125, 2))));
        assert_eq!(json_to_value(&price, &json!("1.25")).unwrap(), expected);
        assert_eq!(json_to_value(&price, &json!(1.25)).unwrap(), expected);
        assert!(json_to_value(&price, &json!(true)).is_err());
    }

    #[test]
    fn temporal_values_parse_iso_formats() {
        let released = product().property("Released").cloned().unwrap();
        assert!(json_to_value(&released, &json!("2024-02-29")).is_ok());
        assert!(json_to_value(&released, &json!("29/02/2024")).is_err());
    }
}
