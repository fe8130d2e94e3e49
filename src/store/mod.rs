//! Audit store and source catalog boundary.
//!
//! The flush engine writes through [`AuditStore`]; the model loader and the
//! show-value cache introspect through [`Catalog`]. One connection serves
//! both, opened by a [`StoreConnector`] on every (re)start.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::Checkpoint;
use crate::model::{LogInfo, LogMap, TableRef};
use crate::stream::Action;
use crate::Result;

pub use memory::{MemoryConnector, MemoryStore};
pub use postgres::{PgConnector, PgStore};

/// Column as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    pub name: String,
    pub data_type: String,
    pub default: Option<String>,
}

/// Single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub referenced: TableRef,
    pub referenced_column: String,
}

/// Live metadata of the tracked database.
#[async_trait]
pub trait Catalog: Send {
    /// Columns of `table` in ordinal order.
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<CatalogColumn>>;

    /// Primary key columns of `table`.
    async fn primary_keys(&mut self, table: &TableRef) -> Result<Vec<String>>;

    /// Single-column foreign keys declared on `table`.
    async fn foreign_keys(&mut self, table: &TableRef) -> Result<Vec<ForeignKey>>;
}

/// One row of a log table.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub origin: Option<String>,
    pub user: Option<String>,
    pub action: Action,
    pub created: DateTime<Utc>,
    pub model: String,
    pub old_instance: Option<String>,
    pub new_instance: Option<String>,
    pub model_id: Option<String>,
    pub model_value: Option<String>,
}

/// Fields rewritten when a delete is coalesced into an existing delete row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteUpdate {
    pub origin: Option<String>,
    pub created: DateTime<Utc>,
    pub old_instance: Option<String>,
    pub model_value: Option<String>,
}

/// Display lookup for one referenced table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowQuery<'a> {
    pub table: &'a TableRef,
    pub id_name: &'a str,
    pub show_field: &'a str,
}

/// Destination of log rows and checkpoints.
///
/// `begin`/`commit`/`rollback` bracket a batch; every other write issued in
/// between belongs to that transaction.
#[async_trait]
pub trait AuditStore: Send {
    /// Prepares per-log statements.
    async fn prepare(&mut self, logs: &LogMap) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Appends a log row. A missing origin surfaces as an error for which
    /// [`crate::Error::is_foreign_key_violation`] holds and must leave the
    /// enclosing transaction usable.
    async fn insert_entry(&mut self, log: &LogInfo, entry: &LogEntry) -> Result<()>;

    /// Id of an existing delete row for `(model, model_id)` whose origin is
    /// unset or equal to `origin`.
    async fn find_delete(
        &mut self,
        log: &LogInfo,
        model: &str,
        model_id: Option<&str>,
        origin: Option<&str>,
    ) -> Result<Option<i64>>;

    async fn update_delete(&mut self, log: &LogInfo, id: i64, update: &DeleteUpdate) -> Result<()>;

    async fn load_checkpoint(&mut self, code: &str) -> Result<Option<Checkpoint>>;

    /// Upserts the checkpoint row for `code`.
    async fn save_checkpoint(&mut self, code: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// `(id, display)` pairs of the requested ids, in one round trip.
    async fn fetch_show_values(
        &mut self,
        query: ShowQuery<'_>,
        ids: &[String],
    ) -> Result<Vec<(String, String)>>;

    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens audit store connections.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: AuditStore + Catalog;

    async fn connect(&self) -> Result<Self::Store>;
}

/// Quotes an SQL identifier.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn quote_table(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}
