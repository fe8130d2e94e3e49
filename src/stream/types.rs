use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row mutation kind, written verbatim into the `action` column of a log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded column value as delivered by the binlog decoder.
///
/// Date and datetime columns carry `None` when the decoder produced a value
/// that has no calendar representation (zero dates such as `0000-00-00`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(Option<NaiveDate>),
    DateTime(Option<NaiveDateTime>),
    Json(serde_json::Value),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Plain JSON form used inside serialized instances.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Bool(b) => Value::Bool(*b),
            ColumnValue::Int(i) => Value::from(*i),
            ColumnValue::UInt(u) => Value::from(*u),
            ColumnValue::Double(d) => Value::from(*d),
            ColumnValue::Decimal(s) | ColumnValue::Text(s) => Value::String(s.clone()),
            ColumnValue::Bytes(b) => Value::String(BASE64.encode(b)),
            ColumnValue::Date(d) => d.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null),
            ColumnValue::DateTime(dt) => dt
                .map(|dt| Value::String(dt.and_utc().to_rfc3339()))
                .unwrap_or(Value::Null),
            ColumnValue::Json(v) => v.clone(),
        }
    }

    /// Textual key used for identifiers (origin, entity id, cache keys).
    ///
    /// Returns `None` for null and unrepresentable dates.
    pub fn as_key(&self) -> Option<String> {
        match self {
            ColumnValue::Null => None,
            ColumnValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            ColumnValue::Int(i) => Some(i.to_string()),
            ColumnValue::UInt(u) => Some(u.to_string()),
            ColumnValue::Double(d) => Some(d.to_string()),
            ColumnValue::Decimal(s) | ColumnValue::Text(s) => Some(s.clone()),
            ColumnValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            ColumnValue::Date(d) => d.map(|d| d.to_string()),
            ColumnValue::DateTime(dt) => dt.map(|dt| dt.to_string()),
            ColumnValue::Json(v) => Some(v.to_string()),
        }
    }

    /// Truthiness used by the boolean cast.
    pub fn is_truthy(&self) -> bool {
        match self {
            ColumnValue::Null => false,
            ColumnValue::Bool(b) => *b,
            ColumnValue::Int(i) => *i != 0,
            ColumnValue::UInt(u) => *u != 0,
            ColumnValue::Double(d) => *d != 0.0 && !d.is_nan(),
            ColumnValue::Decimal(s) => s.parse::<f64>().map(|d| d != 0.0).unwrap_or(!s.is_empty()),
            ColumnValue::Text(s) => !s.is_empty(),
            ColumnValue::Bytes(b) => !b.is_empty(),
            ColumnValue::Date(d) => d.is_some(),
            ColumnValue::DateTime(dt) => dt.is_some(),
            ColumnValue::Json(v) => !v.is_null(),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(s: &str) -> Self {
        ColumnValue::Text(s.to_string())
    }
}

impl From<i64> for ColumnValue {
    fn from(i: i64) -> Self {
        ColumnValue::Int(i)
    }
}

impl From<bool> for ColumnValue {
    fn from(b: bool) -> Self {
        ColumnValue::Bool(b)
    }
}

/// Row image keyed by column name.
pub type Row = BTreeMap<String, ColumnValue>;

/// Builds a [`Row`] from `(column, value)` pairs.
pub fn row<I, V>(columns: I) -> Row
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<ColumnValue>,
{
    columns
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.into()))
        .collect()
}

/// Before/after images of one mutated row.
///
/// Inserts carry only `after`, deletes only `before`, updates both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    #[serde(default)]
    pub before: Option<Row>,
    #[serde(default)]
    pub after: Option<Row>,
}

impl RowChange {
    pub fn inserted(after: Row) -> Self {
        Self {
            before: None,
            after: Some(after),
        }
    }

    pub fn updated(before: Row, after: Row) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(before: Row) -> Self {
        Self {
            before: Some(before),
            after: None,
        }
    }
}

/// Row mutation event referencing an earlier table map event by `table_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsEvent {
    pub action: Action,
    pub table_id: u64,
    pub rows: Vec<RowChange>,
    /// Commit timestamp of the transaction that produced the rows.
    pub timestamp: DateTime<Utc>,
    /// Stream offset just past this event.
    pub next_position: u64,
}

/// Events consumed from the replication stream, in stream order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The stream moved to another file.
    Rotate { file: String, position: u64 },
    /// Binds `table_id` to a schema-qualified table for following row events.
    TableMap {
        table_id: u64,
        schema: String,
        table: String,
        next_position: u64,
    },
    Rows(RowsEvent),
}
