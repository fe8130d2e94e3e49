//! In-memory audit store and catalog.
//!
//! Handles returned by [`MemoryConnector::connect`] share one state, so a test
//! can keep a [`MemoryStore`] to inspect what the logger wrote across
//! restarts. A transaction snapshots the log data on `begin` and restores it
//! on `rollback`; reconnecting discards an open transaction like a server
//! would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{
    AuditStore, Catalog, CatalogColumn, DeleteUpdate, ForeignKey, LogEntry, ShowQuery,
    StoreConnector,
};
use crate::checkpoint::Checkpoint;
use crate::model::{LogInfo, LogMap, TableRef};
use crate::stream::Action;
use crate::{Error, Result};

/// Row stored in a log table.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub id: i64,
    pub entry: LogEntry,
}

/// Failure raised by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    ConnectionLost,
    Fatal,
}

impl Failure {
    fn error(self, context: &str) -> Error {
        match self {
            Failure::ConnectionLost => Error::Connection(format!("{}: connection reset", context)),
            Failure::Fatal => Error::Store(format!("{}: injected failure", context)),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Data {
    logs: BTreeMap<TableRef, Vec<LogRow>>,
    checkpoints: BTreeMap<String, Checkpoint>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct CatalogData {
    columns: BTreeMap<TableRef, Vec<CatalogColumn>>,
    primary_keys: BTreeMap<TableRef, Vec<String>>,
    foreign_keys: BTreeMap<TableRef, Vec<ForeignKey>>,
    show_rows: BTreeMap<TableRef, Vec<BTreeMap<String, String>>>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Inserts left before `insert_failure` fires.
    inserts_until_failure: Option<usize>,
    insert_failure: Option<Failure>,
    failing_pings: bool,
    failing_connects: usize,
    missing_origins: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Counters {
    connects: usize,
    commits: usize,
    rollbacks: usize,
    show_queries: usize,
    show_rows_fetched: usize,
}

#[derive(Debug, Default)]
struct State {
    data: Data,
    snapshot: Option<Data>,
    prepared: BTreeSet<String>,
    catalog: CatalogData,
    faults: Faults,
    counters: Counters,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    closed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self) -> Result<MutexGuard<'_, State>> {
        if self.closed {
            return Err(Error::Connection("audit store connection closed".to_string()));
        }
        Ok(self.state())
    }

    /// Declares a source table, replacing its columns and primary key.
    pub fn add_table(&self, table: &TableRef, columns: &[(&str, &str)], primary_keys: &[&str]) {
        let mut state = self.state();
        state.catalog.columns.insert(
            table.clone(),
            columns
                .iter()
                .map(|(name, data_type)| CatalogColumn {
                    name: name.to_string(),
                    data_type: data_type.to_string(),
                    default: None,
                })
                .collect(),
        );
        state
            .catalog
            .primary_keys
            .insert(table.clone(), primary_keys.iter().map(|key| key.to_string()).collect());
    }

    pub fn add_foreign_key(
        &self,
        table: &TableRef,
        column: &str,
        referenced: &TableRef,
        referenced_column: &str,
    ) {
        self.state()
            .catalog
            .foreign_keys
            .entry(table.clone())
            .or_default()
            .push(ForeignKey {
                column: column.to_string(),
                referenced: referenced.clone(),
                referenced_column: referenced_column.to_string(),
            });
    }

    pub fn clear_foreign_keys(&self, table: &TableRef) {
        self.state().catalog.foreign_keys.remove(table);
    }

    /// Adds a row readable by display lookups.
    pub fn add_show_row(&self, table: &TableRef, id_name: &str, id: &str, values: &[(&str, &str)]) {
        let mut row: BTreeMap<String, String> = values
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        row.insert(id_name.to_string(), id.to_string());
        self.state().catalog.show_rows.entry(table.clone()).or_default().push(row);
    }

    /// Makes the insert following the next `skip` successful ones fail once.
    pub fn fail_insert(&self, skip: usize, failure: Failure) {
        let mut state = self.state();
        state.faults.inserts_until_failure = Some(skip);
        state.faults.insert_failure = Some(failure);
    }

    /// Inserts attributed to `origin` fail with a foreign key violation.
    pub fn remove_origin(&self, origin: &str) {
        self.state().faults.missing_origins.insert(origin.to_string());
    }

    pub fn fail_pings(&self, failing: bool) {
        self.state().faults.failing_pings = failing;
    }

    /// Fails the next `count` connection attempts.
    pub fn fail_connects(&self, count: usize) {
        self.state().faults.failing_connects = count;
    }

    /// Committed and uncommitted rows of a log table, in insertion order.
    pub fn entries(&self, log_table: &TableRef) -> Vec<LogRow> {
        self.state().data.logs.get(log_table).cloned().unwrap_or_default()
    }

    pub fn checkpoint(&self, code: &str) -> Option<Checkpoint> {
        self.state().data.checkpoints.get(code).cloned()
    }

    pub fn set_checkpoint(&self, code: &str, checkpoint: Checkpoint) {
        self.state().data.checkpoints.insert(code.to_string(), checkpoint);
    }

    pub fn is_prepared(&self, log: &str) -> bool {
        self.state().prepared.contains(log)
    }

    pub fn in_transaction(&self) -> bool {
        self.state().snapshot.is_some()
    }

    pub fn connects(&self) -> usize {
        self.state().counters.connects
    }

    pub fn commits(&self) -> usize {
        self.state().counters.commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state().counters.rollbacks
    }

    pub fn show_queries(&self) -> usize {
        self.state().counters.show_queries
    }

    pub fn show_rows_fetched(&self) -> usize {
        self.state().counters.show_rows_fetched
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<CatalogColumn>> {
        Ok(self.open()?.catalog.columns.get(table).cloned().unwrap_or_default())
    }

    async fn primary_keys(&mut self, table: &TableRef) -> Result<Vec<String>> {
        Ok(self.open()?.catalog.primary_keys.get(table).cloned().unwrap_or_default())
    }

    async fn foreign_keys(&mut self, table: &TableRef) -> Result<Vec<ForeignKey>> {
        Ok(self.open()?.catalog.foreign_keys.get(table).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn prepare(&mut self, logs: &LogMap) -> Result<()> {
        let mut state = self.open()?;
        state.prepared = logs.keys().cloned().collect();
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        let mut state = self.open()?;
        if state.snapshot.is_some() {
            return Err(Error::Store("transaction already open".to_string()));
        }
        state.snapshot = Some(state.data.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.open()?;
        state.snapshot = None;
        state.counters.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut state = self.open()?;
        if let Some(snapshot) = state.snapshot.take() {
            state.data = snapshot;
        }
        state.counters.rollbacks += 1;
        Ok(())
    }

    async fn insert_entry(&mut self, log: &LogInfo, entry: &LogEntry) -> Result<()> {
        let mut state = self.open()?;

        if let Some(remaining) = state.faults.inserts_until_failure {
            if remaining == 0 {
                state.faults.inserts_until_failure = None;
                if let Some(failure) = state.faults.insert_failure.take() {
                    return Err(failure.error("insert"));
                }
            } else {
                state.faults.inserts_until_failure = Some(remaining - 1);
            }
        }
        if let Some(origin) = &entry.origin {
            if state.faults.missing_origins.contains(origin) {
                return Err(Error::ForeignKeyViolation(format!(
                    "{} references missing origin {}",
                    log.table, origin
                )));
            }
        }

        state.data.next_id += 1;
        let id = state.data.next_id;
        state.data.logs.entry(log.table.clone()).or_default().push(LogRow {
            id,
            entry: entry.clone(),
        });
        Ok(())
    }

    async fn find_delete(
        &mut self,
        log: &LogInfo,
        model: &str,
        model_id: Option<&str>,
        origin: Option<&str>,
    ) -> Result<Option<i64>> {
        let state = self.open()?;
        let found = state.data.logs.get(&log.table).and_then(|rows| {
            rows.iter().find(|row| {
                let entry = &row.entry;
                entry.action == Action::Delete
                    && entry.model == model
                    && model_id.is_some()
                    && entry.model_id.as_deref() == model_id
                    && (entry.origin.is_none() || entry.origin.as_deref() == origin)
            })
        });
        Ok(found.map(|row| row.id))
    }

    async fn update_delete(&mut self, log: &LogInfo, id: i64, update: &DeleteUpdate) -> Result<()> {
        let mut state = self.open()?;
        let row = state
            .data
            .logs
            .get_mut(&log.table)
            .and_then(|rows| rows.iter_mut().find(|row| row.id == id));
        if let Some(row) = row {
            row.entry.origin = update.origin.clone();
            row.entry.created = update.created;
            row.entry.old_instance = update.old_instance.clone();
            row.entry.model_value = update.model_value.clone();
        }
        Ok(())
    }

    async fn load_checkpoint(&mut self, code: &str) -> Result<Option<Checkpoint>> {
        Ok(self.open()?.data.checkpoints.get(code).cloned())
    }

    async fn save_checkpoint(&mut self, code: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.open()?
            .data
            .checkpoints
            .insert(code.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn fetch_show_values(
        &mut self,
        query: ShowQuery<'_>,
        ids: &[String],
    ) -> Result<Vec<(String, String)>> {
        let mut state = self.open()?;
        let values: Vec<(String, String)> = state
            .catalog
            .show_rows
            .get(query.table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let id = row.get(query.id_name)?;
                        if !ids.contains(id) {
                            return None;
                        }
                        Some((id.clone(), row.get(query.show_field)?.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        state.counters.show_queries += 1;
        state.counters.show_rows_fetched += values.len();
        Ok(values)
    }

    async fn ping(&mut self) -> Result<()> {
        let state = self.open()?;
        if state.faults.failing_pings {
            return Err(Failure::ConnectionLost.error("ping"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Hands out handles on a shared [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    type Store = MemoryStore;

    async fn connect(&self) -> Result<MemoryStore> {
        let mut state = self.store.state();
        if state.faults.failing_connects > 0 {
            state.faults.failing_connects -= 1;
            return Err(Failure::ConnectionLost.error("connect"));
        }
        if let Some(snapshot) = state.snapshot.take() {
            debug!("Discarding transaction of the previous connection");
            state.data = snapshot;
        }
        state.counters.connects += 1;
        drop(state);

        Ok(MemoryStore {
            state: self.store.state.clone(),
            closed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn log() -> LogInfo {
        LogInfo {
            name: "orders".into(),
            table: TableRef::new("shop", "orderLog"),
            main_table: TableRef::new("shop", "order"),
        }
    }

    fn entry(action: Action, origin: Option<&str>, model_id: &str) -> LogEntry {
        LogEntry {
            origin: origin.map(str::to_string),
            user: None,
            action,
            created: Utc::now(),
            model: "OrderLine".into(),
            old_instance: None,
            new_instance: None,
            model_id: Some(model_id.into()),
            model_value: None,
        }
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let mut store = MemoryStore::new();
        let log = log();
        store.insert_entry(&log, &entry(Action::Insert, Some("1"), "1")).await.unwrap();

        store.begin().await.unwrap();
        store.insert_entry(&log, &entry(Action::Insert, Some("1"), "2")).await.unwrap();
        store.save_checkpoint("audit", &Checkpoint::new("bin.000001", 10)).await.unwrap();
        store.rollback().await.unwrap();

        assert_eq!(store.entries(&log.table).len(), 1);
        assert_eq!(store.checkpoint("audit"), None);
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_find_delete_scopes_by_origin() {
        let mut store = MemoryStore::new();
        let log = log();
        store.insert_entry(&log, &entry(Action::Delete, Some("3"), "7")).await.unwrap();
        store.insert_entry(&log, &entry(Action::Insert, Some("4"), "8")).await.unwrap();

        let found = store.find_delete(&log, "OrderLine", Some("7"), Some("3")).await;
        assert_eq!(found.unwrap(), Some(1));
        assert_eq!(store.find_delete(&log, "OrderLine", Some("7"), Some("4")).await.unwrap(), None);
        assert_eq!(store.find_delete(&log, "OrderLine", Some("8"), Some("4")).await.unwrap(), None);
        assert_eq!(store.find_delete(&log, "Order", Some("7"), Some("3")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mut store = MemoryStore::new();
        let log = log();
        store.fail_insert(1, Failure::ConnectionLost);
        store.remove_origin("9");

        store.insert_entry(&log, &entry(Action::Insert, Some("1"), "1")).await.unwrap();
        let err = store
            .insert_entry(&log, &entry(Action::Insert, Some("1"), "2"))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
        store.insert_entry(&log, &entry(Action::Insert, Some("1"), "3")).await.unwrap();

        let err = store
            .insert_entry(&log, &entry(Action::Insert, Some("9"), "4"))
            .await
            .unwrap_err();
        assert!(err.is_foreign_key_violation());
        assert_eq!(store.entries(&log.table).len(), 2);
    }

    #[tokio::test]
    async fn test_connector_discards_open_transaction() {
        let shared = MemoryStore::new();
        let connector = MemoryConnector::new(shared.clone());
        let log = log();

        let mut first = connector.connect().await.unwrap();
        first.begin().await.unwrap();
        first.insert_entry(&log, &entry(Action::Insert, Some("1"), "1")).await.unwrap();
        first.close().await.unwrap();
        assert!(first.ping().await.is_err());

        let mut second = connector.connect().await.unwrap();
        assert!(shared.entries(&log.table).is_empty());
        second.prepare(&LogMap::from([("orders".to_string(), Arc::new(log))])).await.unwrap();
        assert!(shared.is_prepared("orders"));
        assert_eq!(shared.connects(), 2);
    }
}
