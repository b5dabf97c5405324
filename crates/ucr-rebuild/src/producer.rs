//! Source documents and the rows they produce
//!
//! Evaluating indicator expressions belongs to the admin layer; the engine
//! only needs "document in, rows out". [`JsonFieldProducer`] is the simple
//! built-in mapping used by the CLI and tests: each column reads the document
//! field of the same name.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;
use ucr_rdbc::{types::Row, Value};

use crate::definition::{DataSourceConfig, Datatype};
use crate::error::Result;

/// A source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id
    pub id: String,
    /// Owning domain
    pub domain: String,
    /// Document type, e.g. `CommCareCase`
    pub doc_type: String,
    /// Document body
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Document {
    /// Create a document
    pub fn new(
        id: impl Into<String>,
        domain: impl Into<String>,
        doc_type: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            doc_type: doc_type.into(),
            body,
        }
    }

    /// Case type or form xmlns the document belongs to
    pub fn unit(&self) -> Option<&str> {
        self.body
            .get("type")
            .or_else(|| self.body.get("xmlns"))
            .and_then(|v| v.as_str())
    }
}

/// Produces indicator rows for a data source
pub trait RowProducer: Send + Sync {
    /// Rows for `doc`, or `None` when the document does not belong in the
    /// table (its existing rows are then removed).
    ///
    /// Returning [`RebuildError::Warning`](crate::error::RebuildError::Warning)
    /// pauses the data source until the next bootstrap.
    fn rows(&self, config: &DataSourceConfig, doc: &Document) -> Result<Option<Vec<Row>>>;
}

impl<F> RowProducer for F
where
    F: Fn(&DataSourceConfig, &Document) -> Result<Option<Vec<Row>>> + Send + Sync,
{
    fn rows(&self, config: &DataSourceConfig, doc: &Document) -> Result<Option<Vec<Row>>> {
        self(config, doc)
    }
}

/// One row per matching document, columns read from same-named fields
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFieldProducer;

impl JsonFieldProducer {
    /// Whether `doc` passes the data source filter
    pub fn matches(config: &DataSourceConfig, doc: &Document) -> bool {
        if doc.domain != config.domain || doc.doc_type != config.referenced_doc_type {
            return false;
        }
        config.units.is_empty()
            || doc
                .unit()
                .is_some_and(|unit| config.units.iter().any(|u| u == unit))
    }
}

impl RowProducer for JsonFieldProducer {
    fn rows(&self, config: &DataSourceConfig, doc: &Document) -> Result<Option<Vec<Row>>> {
        if !Self::matches(config, doc) {
            return Ok(None);
        }
        let pairs = config.columns.iter().map(|column| {
            let value = doc
                .body
                .get(&column.name)
                .map(|v| json_to_value(v, column.datatype))
                .unwrap_or(Value::Null);
            if value.is_null() && doc.body.get(&column.name).is_some_and(|v| !v.is_null()) {
                debug!(doc_id = %doc.id, column = %column.name, "value does not fit column type");
            }
            (column.name.clone(), value)
        });
        Ok(Some(vec![Row::from_pairs(pairs)]))
    }
}

/// Convert a JSON value for a column type; unconvertible values become NULL
pub fn json_to_value(value: &serde_json::Value, datatype: Datatype) -> Value {
    use serde_json::Value as J;

    let text = match value {
        J::Null => return Value::Null,
        J::String(s) => Some(s.as_str()),
        _ => None,
    };

    let converted = match datatype {
        Datatype::String => Some(match value {
            J::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        Datatype::Integer => as_i64(value, text)
            .and_then(|n| i32::try_from(n).ok())
            .map(Value::Int32),
        Datatype::SmallInteger => as_i64(value, text)
            .and_then(|n| i16::try_from(n).ok())
            .map(Value::Int16),
        Datatype::BigInteger => as_i64(value, text).map(Value::Int64),
        Datatype::Decimal => match value {
            J::Number(n) => Decimal::from_str(&n.to_string()).ok(),
            _ => text.and_then(|s| Decimal::from_str(s.trim()).ok()),
        }
        .map(Value::Decimal),
        Datatype::Double => match value {
            J::Number(n) => n.as_f64(),
            _ => text.and_then(|s| s.trim().parse().ok()),
        }
        .map(Value::Float64),
        Datatype::Boolean => match value {
            J::Bool(b) => Some(*b),
            _ => text.and_then(|s| match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            }),
        }
        .map(Value::Bool),
        Datatype::Date => text.and_then(parse_date).map(Value::Date),
        Datatype::DateTime => text.and_then(parse_datetime).map(Value::DateTime),
        Datatype::Array => match value {
            J::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|i| match i {
                        J::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            J::String(s) => Some(Value::Array(s.split_whitespace().map(String::from).collect())),
            _ => None,
        },
    };
    converted.unwrap_or(Value::Null)
}

fn as_i64(value: &serde_json::Value, text: Option<&str>) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| text.and_then(|s| s.trim().parse().ok()))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date()))
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ColumnDef;
    use serde_json::json;

    fn config() -> DataSourceConfig {
        DataSourceConfig::new("abc", "demo", "cases")
            .with_units(["household"])
            .with_column(ColumnDef::new("age", Datatype::Integer))
            .with_column(ColumnDef::new("dob", Datatype::Date))
    }

    #[test]
    fn test_matching_document_produces_row() {
        let doc = Document::new(
            "d1",
            "demo",
            "CommCareCase",
            json!({"type": "household", "age": "42", "dob": "1980-02-03"}),
        );
        let rows = JsonFieldProducer.rows(&config(), &doc).unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("age"), Some(&Value::Int32(42)));
        assert_eq!(
            rows[0].get_by_name("dob"),
            Some(&Value::Date(NaiveDate::from_ymd_opt(1980, 2, 3).unwrap()))
        );
    }

    #[test]
    fn test_other_unit_is_filtered() {
        let doc = Document::new("d1", "demo", "CommCareCase", json!({"type": "person"}));
        assert!(JsonFieldProducer.rows(&config(), &doc).unwrap().is_none());

        let doc = Document::new("d1", "other", "CommCareCase", json!({"type": "household"}));
        assert!(JsonFieldProducer.rows(&config(), &doc).unwrap().is_none());
    }

    #[test]
    fn test_unconvertible_values_are_null() {
        assert_eq!(json_to_value(&json!("abc"), Datatype::Integer), Value::Null);
        assert_eq!(json_to_value(&json!(70000), Datatype::SmallInteger), Value::Null);
        assert_eq!(json_to_value(&json!("yes"), Datatype::Boolean), Value::Bool(true));
        assert_eq!(
            json_to_value(&json!(["a", 1]), Datatype::Array),
            Value::Array(vec!["a".into(), "1".into()])
        );
    }
}
