//! Converts row events into [`ChangeRecord`]s.
//!
//! Capture is synchronous and only depends on the event and the resolved
//! [`TableInfo`]: images are built by walking the table's captured columns,
//! so excluded columns never reach an instance.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::checkpoint::Checkpoint;
use crate::model::{SchemaMap, TableInfo, TableRef};
use crate::stream::{Action, ColumnValue, Row, RowChange, RowsEvent};

/// One captured row mutation.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub action: Action,
    pub table: Arc<TableInfo>,
    /// Full row as received: `after` for inserts and updates, `before` for
    /// deletes. Source of ids, relations, user and display fields.
    pub row: Row,
    pub old_image: Option<Row>,
    pub new_image: Option<Row>,
    pub timestamp: DateTime<Utc>,
    /// Filled by the show-value cache right before the record is applied.
    pub display_value: Option<String>,
}

/// Records captured from one stream event, closed by the position reached
/// after it.
#[derive(Debug, Clone)]
pub struct QueuedOperation {
    pub records: Vec<ChangeRecord>,
    pub checkpoint: Checkpoint,
}

/// Routes row events to tracked tables.
#[derive(Debug, Default)]
pub struct CaptureEngine {
    schema_map: Arc<SchemaMap>,
    table_ids: HashMap<u64, TableRef>,
}

impl CaptureEngine {
    pub fn new(schema_map: Arc<SchemaMap>) -> Self {
        Self {
            schema_map,
            table_ids: HashMap::new(),
        }
    }

    /// Remembers the table a following row event's `table_id` refers to.
    pub fn on_table_map(&mut self, table_id: u64, schema: &str, table: &str) {
        trace!(table_id, schema, table, "Table map");
        self.table_ids.insert(table_id, TableRef::new(schema, table));
    }

    /// Captures the changes of a row event. Untracked tables and unknown
    /// table ids yield nothing.
    pub fn on_rows(&self, event: &RowsEvent) -> Vec<ChangeRecord> {
        let Some(table) = self.table_ids.get(&event.table_id) else {
            debug!(table_id = event.table_id, "Rows event without table map, ignored");
            return Vec::new();
        };
        let Some(table_info) = self.schema_map.get(&table.schema, &table.name) else {
            return Vec::new();
        };

        let records = capture(table_info, event);
        debug!(
            action = %event.action,
            table = %table,
            changes = records.len(),
            "Rows captured"
        );
        records
    }
}

/// Builds the change records of `event` for `table`.
pub fn capture(table: &Arc<TableInfo>, event: &RowsEvent) -> Vec<ChangeRecord> {
    let record = |row: Row, old_image: Option<Row>, new_image: Option<Row>| ChangeRecord {
        action: event.action,
        table: table.clone(),
        row,
        old_image,
        new_image,
        timestamp: event.timestamp,
        display_value: None,
    };

    let mut records = Vec::with_capacity(event.rows.len());
    for change in &event.rows {
        match (event.action, change) {
            (
                Action::Update,
                RowChange {
                    before: Some(before),
                    after: Some(after),
                },
            ) => {
                if let Some((old_image, new_image)) = diff(table, before, after) {
                    records.push(record(after.clone(), Some(old_image), Some(new_image)));
                }
            }
            (Action::Insert, RowChange { after: Some(after), .. }) => {
                records.push(record(after.clone(), None, Some(instance(table, after))));
            }
            (Action::Delete, RowChange { before: Some(before), .. }) => {
                records.push(record(before.clone(), Some(instance(table, before)), None));
            }
            (action, _) => {
                debug!(%action, table = %table.table, "Row without the expected image, ignored");
            }
        }
    }
    records
}

/// Captured, non-null, cast columns of `row`.
pub fn instance(table: &TableInfo, row: &Row) -> Row {
    table
        .columns
        .keys()
        .filter_map(|column| match row.get(column) {
            Some(value) if !value.is_null() => Some((column.clone(), table.cast(column, value))),
            _ => None,
        })
        .collect()
}

/// Old and new images of the captured columns that changed, or `None` when
/// nothing captured changed.
///
/// The old image omits columns that were null before; the new image always
/// holds the after value of every changed column.
pub fn diff(table: &TableInfo, before: &Row, after: &Row) -> Option<(Row, Row)> {
    let mut old_image = Row::new();
    let mut new_image = Row::new();

    for column in table.columns.keys() {
        let (old, new) = match (before.get(column), after.get(column)) {
            (None, None) => continue,
            (old, new) => (
                old.unwrap_or(&ColumnValue::Null),
                new.unwrap_or(&ColumnValue::Null),
            ),
        };
        if values_equal(old, new) {
            continue;
        }
        if !old.is_null() {
            old_image.insert(column.clone(), table.cast(column, old));
        }
        new_image.insert(column.clone(), table.cast(column, new));
    }

    if new_image.is_empty() {
        None
    } else {
        Some((old_image, new_image))
    }
}

/// Value equality used for change detection.
///
/// Dates compare by the instant they denote; unrepresentable dates are all
/// the same "no value".
pub fn values_equal(a: &ColumnValue, b: &ColumnValue) -> bool {
    match (a, b) {
        (ColumnValue::DateTime(a), ColumnValue::DateTime(b)) => a == b,
        (ColumnValue::Date(a), ColumnValue::Date(b)) => a == b,
        (ColumnValue::Null, ColumnValue::Null) => true,
        (ColumnValue::Null, _) | (_, ColumnValue::Null) => false,
        _ => a == b,
    }
}
