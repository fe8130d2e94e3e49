//! Resolved routing metadata for tracked tables.
//!
//! [`LogInfo`] and [`TableInfo`] are built once by the [`loader`] and then
//! shared behind `Arc`; a schema reload builds a new [`SchemaMap`] instead of
//! patching the existing one.

pub mod loader;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::multimap::MultiMap;
use crate::stream::{ColumnValue, Row};

pub use loader::ModelLoader;

/// Suffix marking "display via relation" in a `show_field` and naming the
/// display companion of a relation column inside instances.
pub const SHOW_SUFFIX: &str = "$";

/// Tracked tables keyed by `schema -> table`.
pub type SchemaMap = MultiMap<String, String, Arc<TableInfo>>;

/// Log definitions keyed by name.
pub type LogMap = BTreeMap<String, Arc<LogInfo>>;

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses `[schema.]table`, falling back to `default_schema`.
    pub fn parse(reference: &str, default_schema: &str) -> Self {
        match reference.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new(default_schema, reference),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Value conversion applied to a captured column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastType {
    Boolean,
}

impl CastType {
    pub fn apply(&self, value: &ColumnValue) -> ColumnValue {
        match self {
            CastType::Boolean if value.is_null() => ColumnValue::Null,
            CastType::Boolean => ColumnValue::Bool(value.is_truthy()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub data_type: String,
    pub default: Option<String>,
}

/// How a row's human-readable value is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShowMode {
    None,
    /// Own column.
    Field(String),
    /// Display value of the entity referenced by this relation column.
    Relation(String),
}

/// One logical audit stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInfo {
    pub name: String,
    /// Table receiving the log rows.
    pub table: TableRef,
    /// Owner entity table.
    pub main_table: TableRef,
}

/// Resolved metadata of one tracked table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub table: TableRef,
    pub log: Arc<LogInfo>,
    pub model_name: String,
    pub is_main: bool,
    /// Captured columns, exclusions already removed.
    pub columns: BTreeMap<String, ColumnInfo>,
    pub cast_types: HashMap<String, CastType>,
    pub id_name: String,
    /// Column referencing the main table's primary key; `None` on main tables.
    pub relation: Option<String>,
    pub show: ShowMode,
    pub user_field: Option<String>,
    /// Outgoing foreign keys used for display resolution.
    pub relations: BTreeMap<String, TableRef>,
}

impl TableInfo {
    pub fn is_captured(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Applies the column's cast, if any.
    pub fn cast(&self, column: &str, value: &ColumnValue) -> ColumnValue {
        match self.cast_types.get(column) {
            Some(cast) => cast.apply(value),
            None => value.clone(),
        }
    }

    /// Identifier of the changed entity within `row`.
    pub fn model_id(&self, row: &Row) -> Option<String> {
        row.get(&self.id_name).and_then(ColumnValue::as_key)
    }

    /// Identifier of the main entity `row` belongs to.
    pub fn origin(&self, row: &Row) -> Option<String> {
        if self.is_main {
            return self.model_id(row);
        }
        self.relation
            .as_ref()
            .and_then(|relation| row.get(relation))
            .and_then(ColumnValue::as_key)
    }

    /// Acting user recorded in `row`.
    pub fn user(&self, row: &Row) -> Option<String> {
        self.user_field
            .as_ref()
            .and_then(|field| row.get(field))
            .and_then(ColumnValue::as_key)
    }
}

/// `order_line` / `order-line` to `OrderLine`.
pub fn to_upper_camel_case(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if matches!(c, '-' | '_' | ' ') {
            upper = true;
            continue;
        }
        if upper {
            result.extend(c.to_uppercase());
            upper = false;
        } else {
            result.push(c);
        }
    }
    result
}
