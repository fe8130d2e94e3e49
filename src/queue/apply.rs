//! Writes one [`ChangeRecord`] to its log.

use serde_json::{Map, Value};
use tracing::debug;

use crate::capture::ChangeRecord;
use crate::store::{AuditStore, DeleteUpdate, LogEntry};
use crate::stream::{Action, ColumnValue, Row};
use crate::Result;

/// Serializes an image as a JSON object.
pub fn instance_json(image: &Row) -> Result<String> {
    let object: Map<String, Value> = image
        .iter()
        .map(|(column, value)| (column.clone(), value.to_json()))
        .collect();
    Ok(serde_json::to_string(&Value::Object(object))?)
}

/// Applies `record` inside the caller's transaction.
///
/// A delete first looks for an earlier delete row of the same entity and
/// origin and rewrites it instead of adding another. An update that moves a
/// subordinate row to another owner is logged for both owners. Rows without
/// an origin are not logged, and inserts rejected because the origin no
/// longer exists are skipped.
pub async fn apply_record<S: AuditStore + ?Sized>(
    store: &mut S,
    record: &ChangeRecord,
    dry_run: bool,
) -> Result<()> {
    let table = &record.table;
    let log = &table.log;
    let model_id = table.model_id(&record.row);
    let origin = table.origin(&record.row);
    let old_instance = record.old_image.as_ref().map(instance_json).transpose()?;

    debug!(
        action = %record.action,
        log = %log.name,
        origin = origin.as_deref().unwrap_or("NULL"),
        model = %table.model_name,
        id = model_id.as_deref().unwrap_or("NULL"),
        "Log"
    );

    if record.action == Action::Delete {
        let existing = store
            .find_delete(log, &table.model_name, model_id.as_deref(), origin.as_deref())
            .await?;
        if let Some(id) = existing {
            if !dry_run {
                let update = DeleteUpdate {
                    origin: origin.clone(),
                    created: record.timestamp,
                    old_instance,
                    model_value: record.display_value.clone(),
                };
                store.update_delete(log, id, &update).await?;
            }
            debug!(id, "Delete merged into existing log row");
            return Ok(());
        }
    }

    if dry_run {
        return Ok(());
    }

    let mut entry = LogEntry {
        origin,
        user: table.user(&record.row),
        action: record.action,
        created: record.timestamp,
        model: table.model_name.clone(),
        old_instance,
        new_instance: record.new_image.as_ref().map(instance_json).transpose()?,
        model_id,
        model_value: record.display_value.clone(),
    };
    insert(store, record, &entry).await?;

    if let Some(previous) = previous_origin(record) {
        entry.origin = Some(previous);
        insert(store, record, &entry).await?;
    }
    Ok(())
}

/// Former owner of a subordinate row whose relation column changed.
fn previous_origin(record: &ChangeRecord) -> Option<String> {
    let table = &record.table;
    if record.action != Action::Update || table.is_main {
        return None;
    }
    let relation = table.relation.as_ref()?;
    if !record.new_image.as_ref()?.contains_key(relation) {
        return None;
    }
    record
        .old_image
        .as_ref()?
        .get(relation)
        .and_then(ColumnValue::as_key)
}

async fn insert<S: AuditStore + ?Sized>(
    store: &mut S,
    record: &ChangeRecord,
    entry: &LogEntry,
) -> Result<()> {
    if entry.origin.is_none() {
        debug!(model = %entry.model, "No origin, entry skipped");
        return Ok(());
    }
    match store.insert_entry(&record.table.log, entry).await {
        Err(e) if e.is_foreign_key_violation() => {
            debug!(error = %e, "Ignored because of constraint failure");
            Ok(())
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::{order_line_table, order_table};
    use crate::store::MemoryStore;
    use crate::stream::row;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(
        action: Action,
        line: Row,
        old_image: Option<Row>,
        new_image: Option<Row>,
    ) -> ChangeRecord {
        ChangeRecord {
            action,
            table: order_line_table(),
            row: line,
            old_image,
            new_image,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            display_value: None,
        }
    }

    fn line(id: i64, order: i64, qty: i64) -> Row {
        row([
            ("id", ColumnValue::Int(id)),
            ("orderFk", ColumnValue::Int(order)),
            ("qty", ColumnValue::Int(qty)),
            ("editorFk", ColumnValue::Int(42)),
        ])
    }

    fn qty(qty: i64) -> Row {
        row([("qty", ColumnValue::Int(qty))])
    }

    #[test]
    fn test_instance_json() {
        let image = row([("qty", ColumnValue::Int(2)), ("shipped", ColumnValue::Bool(true))]);
        let value: Value = serde_json::from_str(&instance_json(&image).unwrap()).unwrap();
        assert_eq!(value, json!({"qty": 2, "shipped": true}));
    }

    #[tokio::test]
    async fn test_insert_entry_fields() {
        let mut store = MemoryStore::new();
        let new_image = row([
            ("id", ColumnValue::Int(7)),
            ("orderFk", ColumnValue::Int(3)),
            ("qty", ColumnValue::Int(2)),
        ]);
        let record = record(Action::Insert, line(7, 3, 2), None, Some(new_image));

        apply_record(&mut store, &record, false).await.unwrap();

        let rows = store.entries(&record.table.log.table);
        assert_eq!(rows.len(), 1);
        let entry = &rows[0].entry;
        assert_eq!(entry.origin.as_deref(), Some("3"));
        assert_eq!(entry.user.as_deref(), Some("42"));
        assert_eq!(entry.model, "OrderLine");
        assert_eq!(entry.model_id.as_deref(), Some("7"));
        assert_eq!(entry.old_instance, None);
        assert_eq!(entry.new_instance.as_deref(), Some(r#"{"id":7,"orderFk":3,"qty":2}"#));
    }

    #[tokio::test]
    async fn test_delete_merges_into_existing_delete() {
        let mut store = MemoryStore::new();
        let first = record(Action::Delete, line(7, 3, 2), Some(qty(2)), None);
        let mut second = record(Action::Delete, line(7, 3, 5), Some(qty(5)), None);
        second.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();

        apply_record(&mut store, &first, false).await.unwrap();
        apply_record(&mut store, &second, false).await.unwrap();

        let rows = store.entries(&first.table.log.table);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.old_instance.as_deref(), Some(r#"{"qty":5}"#));
        assert_eq!(rows[0].entry.created, second.timestamp);
    }

    #[tokio::test]
    async fn test_delete_of_other_origin_is_not_merged() {
        let mut store = MemoryStore::new();
        let first = record(Action::Delete, line(7, 3, 2), Some(qty(2)), None);
        let second = record(Action::Delete, line(7, 4, 2), Some(qty(2)), None);

        apply_record(&mut store, &first, false).await.unwrap();
        apply_record(&mut store, &second, false).await.unwrap();

        assert_eq!(store.entries(&first.table.log.table).len(), 2);
    }

    #[tokio::test]
    async fn test_reparenting_logs_both_owners() {
        let mut store = MemoryStore::new();
        let record = record(
            Action::Update,
            line(7, 4, 2),
            Some(row([("orderFk", ColumnValue::Int(3))])),
            Some(row([("orderFk", ColumnValue::Int(4))])),
        );

        apply_record(&mut store, &record, false).await.unwrap();

        let rows = store.entries(&record.table.log.table);
        let origins: Vec<_> = rows.iter().map(|row| row.entry.origin.as_deref()).collect();
        assert_eq!(origins, vec![Some("4"), Some("3")]);
        assert_eq!(rows[0].entry.new_instance, rows[1].entry.new_instance);
    }

    #[tokio::test]
    async fn test_missing_origin_is_tolerated() {
        let mut store = MemoryStore::new();
        store.remove_origin("3");
        let record = record(Action::Insert, line(7, 3, 2), None, Some(qty(2)));

        apply_record(&mut store, &record, false).await.unwrap();
        assert!(store.entries(&record.table.log.table).is_empty());
    }

    #[tokio::test]
    async fn test_null_origin_and_dry_run_write_nothing() {
        let mut store = MemoryStore::new();
        let mut orphan = line(7, 3, 2);
        orphan.insert("orderFk".into(), ColumnValue::Null);
        let record = record(Action::Insert, orphan, None, Some(qty(2)));
        apply_record(&mut store, &record, false).await.unwrap();

        let order = ChangeRecord {
            table: order_table(),
            ..record.clone()
        };
        apply_record(&mut store, &order, true).await.unwrap();

        assert!(store.entries(&record.table.log.table).is_empty());
    }
}
