//! PostgreSQL audit store and catalog.
//!
//! Log and checkpoint tables may declare their key and reference columns
//! with any integer or text type, the action column as text or enum and the
//! instance columns as json, jsonb or text. Parameters are therefore bound
//! through [`SqlParam`], which encodes itself for whatever type the server
//! inferred for the placeholder.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use tokio_postgres::types::{to_sql_checked, IsNull, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::{debug, error, info};

use super::{
    quote_ident, quote_table, AuditStore, Catalog, CatalogColumn, DeleteUpdate, ForeignKey,
    LogEntry, ShowQuery, StoreConnector,
};
use crate::checkpoint::Checkpoint;
use crate::config::PostgresConfig;
use crate::model::{LogInfo, LogMap, TableRef};
use crate::{Error, Result};

const ENTRY_SAVEPOINT: &str = "audit_entry";

const COLUMNS_QUERY: &str = "\
    SELECT column_name::text, data_type::text, column_default::text
    FROM information_schema.columns
    WHERE table_schema = $1::text AND table_name = $2::text
    ORDER BY ordinal_position";

const PRIMARY_KEYS_QUERY: &str = "\
    SELECT kcu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON kcu.constraint_schema = tc.constraint_schema
        AND kcu.constraint_name = tc.constraint_name
        AND kcu.table_name = tc.table_name
    WHERE tc.constraint_type = 'PRIMARY KEY'
        AND tc.table_schema = $1::text
        AND tc.table_name = $2::text
    ORDER BY kcu.ordinal_position";

const FOREIGN_KEYS_QUERY: &str = "\
    SELECT a.attname::text, rn.nspname::text, rc.relname::text, ra.attname::text
    FROM pg_constraint c
    JOIN pg_class cl ON cl.oid = c.conrelid
    JOIN pg_namespace n ON n.oid = cl.relnamespace
    JOIN pg_class rc ON rc.oid = c.confrelid
    JOIN pg_namespace rn ON rn.oid = rc.relnamespace
    JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = c.conkey[1]
    JOIN pg_attribute ra ON ra.attrelid = c.confrelid AND ra.attnum = c.confkey[1]
    WHERE c.contype = 'f'
        AND array_length(c.conkey, 1) = 1
        AND n.nspname = $1::text
        AND cl.relname = $2::text
    ORDER BY a.attname";

/// Query parameter encoded according to the placeholder's type.
#[derive(Debug)]
enum SqlParam<'a> {
    /// Text or number; `None` binds NULL.
    Text(Option<&'a str>),
    Time(DateTime<Utc>),
}

impl ToSql for SqlParam<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            SqlParam::Text(None) => Ok(IsNull::Yes),
            SqlParam::Text(Some(value)) => {
                if *ty == Type::INT2 {
                    value.parse::<i16>()?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    value.parse::<i32>()?.to_sql(ty, out)
                } else if *ty == Type::INT8 {
                    value.parse::<i64>()?.to_sql(ty, out)
                } else if *ty == Type::JSONB {
                    out.put_u8(1);
                    out.put_slice(value.as_bytes());
                    Ok(IsNull::No)
                } else if *ty == Type::JSON || matches!(ty.kind(), Kind::Enum(_)) {
                    out.put_slice(value.as_bytes());
                    Ok(IsNull::No)
                } else {
                    value.to_sql(ty, out)
                }
            }
            SqlParam::Time(time) => {
                if *ty == Type::TIMESTAMP {
                    time.naive_utc().to_sql(ty, out)
                } else {
                    time.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Reads an integer column whatever its width.
fn get_i64(row: &Row, idx: usize) -> Result<i64> {
    let ty = row.columns()[idx].type_();
    if *ty == Type::INT2 {
        Ok(i64::from(row.try_get::<_, i16>(idx)?))
    } else if *ty == Type::INT4 {
        Ok(i64::from(row.try_get::<_, i32>(idx)?))
    } else if *ty == Type::INT8 {
        Ok(row.try_get::<_, i64>(idx)?)
    } else {
        Err(Error::Store(format!(
            "column {} is not an integer ({})",
            row.columns()[idx].name(),
            ty
        )))
    }
}

struct LogStatements {
    insert: Statement,
    find_delete: Statement,
    update_delete: Statement,
}

pub struct PgConnector {
    config: PostgresConfig,
    checkpoint_table: TableRef,
}

impl PgConnector {
    pub fn new(config: PostgresConfig, checkpoint_table: &str) -> Self {
        Self {
            config,
            checkpoint_table: TableRef::parse(checkpoint_table, "public"),
        }
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    type Store = PgStore;

    async fn connect(&self) -> Result<PgStore> {
        info!(
            host = %self.config.host,
            database = %self.config.database,
            "Connecting to audit database"
        );

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.database)
            .user(&self.config.username)
            .password(&self.config.password)
            .application_name("audit-capture")
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs));

        let (client, connection) = pg_config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Audit database connection error: {}", e);
            }
        });

        let table = quote_table(&self.checkpoint_table);
        let load_checkpoint = client
            .prepare(&format!("SELECT log_name, position FROM {} WHERE code = $1", table))
            .await?;
        let save_checkpoint = client
            .prepare(&format!(
                "INSERT INTO {} (code, log_name, position) VALUES ($1, $2, $3) \
                 ON CONFLICT (code) DO UPDATE SET log_name = EXCLUDED.log_name, position = EXCLUDED.position",
                table
            ))
            .await?;

        info!("Connected to audit database");
        Ok(PgStore {
            client,
            connection_task,
            statements: HashMap::new(),
            load_checkpoint,
            save_checkpoint,
            in_transaction: false,
        })
    }
}

pub struct PgStore {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    statements: HashMap<String, LogStatements>,
    load_checkpoint: Statement,
    save_checkpoint: Statement,
    in_transaction: bool,
}

impl PgStore {
    fn statements(&self, log: &LogInfo) -> Result<&LogStatements> {
        self.statements
            .get(&log.name)
            .ok_or_else(|| Error::Store(format!("statements of log {} are not prepared", log.name)))
    }

    async fn execute_insert(&self, log: &LogInfo, entry: &LogEntry) -> Result<()> {
        let statement = &self.statements(log)?.insert;
        self.client
            .execute(
                statement,
                &[
                    &SqlParam::Text(entry.origin.as_deref()),
                    &SqlParam::Text(entry.user.as_deref()),
                    &SqlParam::Text(Some(entry.action.as_str())),
                    &SqlParam::Time(entry.created),
                    &SqlParam::Text(Some(&entry.model)),
                    &SqlParam::Text(entry.old_instance.as_deref()),
                    &SqlParam::Text(entry.new_instance.as_deref()),
                    &SqlParam::Text(entry.model_id.as_deref()),
                    &SqlParam::Text(entry.model_value.as_deref()),
                ],
            )
            .await?;
        Ok(())
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl Catalog for PgStore {
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<CatalogColumn>> {
        let rows = self.client.query(COLUMNS_QUERY, &[&table.schema, &table.name]).await?;
        rows.iter()
            .map(|row| -> Result<CatalogColumn> {
                Ok(CatalogColumn {
                    name: row.try_get(0)?,
                    data_type: row.try_get(1)?,
                    default: row.try_get(2)?,
                })
            })
            .collect()
    }

    async fn primary_keys(&mut self, table: &TableRef) -> Result<Vec<String>> {
        let rows = self.client.query(PRIMARY_KEYS_QUERY, &[&table.schema, &table.name]).await?;
        rows.iter()
            .map(|row| -> Result<String> { Ok(row.try_get(0)?) })
            .collect()
    }

    async fn foreign_keys(&mut self, table: &TableRef) -> Result<Vec<ForeignKey>> {
        let rows = self.client.query(FOREIGN_KEYS_QUERY, &[&table.schema, &table.name]).await?;
        rows.iter()
            .map(|row| -> Result<ForeignKey> {
                Ok(ForeignKey {
                    column: row.try_get(0)?,
                    referenced: TableRef::new(
                        row.try_get::<_, String>(1)?,
                        row.try_get::<_, String>(2)?,
                    ),
                    referenced_column: row.try_get(3)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn prepare(&mut self, logs: &LogMap) -> Result<()> {
        self.statements.clear();
        for log in logs.values() {
            let table = quote_table(&log.table);
            let insert = self
                .client
                .prepare(&format!(
                    "INSERT INTO {} (origin_fk, user_fk, action, creation_date, changed_model, \
                     old_instance, new_instance, changed_model_id, changed_model_value) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                    table
                ))
                .await?;
            let find_delete = self
                .client
                .prepare(&format!(
                    "SELECT id FROM {} WHERE changed_model = $1 AND changed_model_id = $2 \
                     AND action = 'delete' AND (origin_fk IS NULL OR origin_fk = $3) LIMIT 1",
                    table
                ))
                .await?;
            let update_delete = self
                .client
                .prepare(&format!(
                    "UPDATE {} SET origin_fk = $1, creation_date = $2, old_instance = $3, \
                     changed_model_value = $4 WHERE id = $5",
                    table
                ))
                .await?;

            debug!(log = %log.name, table = %log.table, "Log statements prepared");
            self.statements.insert(
                log.name.clone(),
                LogStatements {
                    insert,
                    find_delete,
                    update_delete,
                },
            );
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn insert_entry(&mut self, log: &LogInfo, entry: &LogEntry) -> Result<()> {
        if !self.in_transaction {
            return self.execute_insert(log, entry).await;
        }

        self.client
            .batch_execute(&format!("SAVEPOINT {}", ENTRY_SAVEPOINT))
            .await?;
        match self.execute_insert(log, entry).await {
            Ok(()) => {
                self.client
                    .batch_execute(&format!("RELEASE SAVEPOINT {}", ENTRY_SAVEPOINT))
                    .await?;
                Ok(())
            }
            Err(e) if e.is_foreign_key_violation() => {
                self.client
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", ENTRY_SAVEPOINT))
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_delete(
        &mut self,
        log: &LogInfo,
        model: &str,
        model_id: Option<&str>,
        origin: Option<&str>,
    ) -> Result<Option<i64>> {
        let statement = &self.statements(log)?.find_delete;
        let row = self
            .client
            .query_opt(
                statement,
                &[&SqlParam::Text(Some(model)), &SqlParam::Text(model_id), &SqlParam::Text(origin)],
            )
            .await?;
        row.map(|row| get_i64(&row, 0)).transpose()
    }

    async fn update_delete(&mut self, log: &LogInfo, id: i64, update: &DeleteUpdate) -> Result<()> {
        let statement = &self.statements(log)?.update_delete;
        let id = id.to_string();
        self.client
            .execute(
                statement,
                &[
                    &SqlParam::Text(update.origin.as_deref()),
                    &SqlParam::Time(update.created),
                    &SqlParam::Text(update.old_instance.as_deref()),
                    &SqlParam::Text(update.model_value.as_deref()),
                    &SqlParam::Text(Some(&id)),
                ],
            )
            .await?;
        Ok(())
    }

    async fn load_checkpoint(&mut self, code: &str) -> Result<Option<Checkpoint>> {
        let row = self
            .client
            .query_opt(&self.load_checkpoint, &[&SqlParam::Text(Some(code))])
            .await?;
        match row {
            Some(row) => {
                let file: String = row.try_get(0)?;
                let position = get_i64(&row, 1)?;
                let position = u64::try_from(position)
                    .map_err(|_| {
                        Error::Store(format!("negative checkpoint position {}", position))
                    })?;
                Ok(Some(Checkpoint::new(file, position)))
            }
            None => Ok(None),
        }
    }

    async fn save_checkpoint(&mut self, code: &str, checkpoint: &Checkpoint) -> Result<()> {
        let position = checkpoint.position.to_string();
        self.client
            .execute(
                &self.save_checkpoint,
                &[
                    &SqlParam::Text(Some(code)),
                    &SqlParam::Text(Some(&checkpoint.file)),
                    &SqlParam::Text(Some(&position)),
                ],
            )
            .await?;
        Ok(())
    }

    async fn fetch_show_values(
        &mut self,
        query: ShowQuery<'_>,
        ids: &[String],
    ) -> Result<Vec<(String, String)>> {
        let sql = format!(
            "SELECT {id}::text, {show}::text FROM {table} WHERE {id}::text = ANY($1)",
            id = quote_ident(query.id_name),
            show = quote_ident(query.show_field),
            table = quote_table(query.table),
        );
        let rows = self.client.query(&sql, &[&ids]).await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get(0)?;
            if let Some(show) = row.try_get::<_, Option<String>>(1)? {
                values.push((id, show));
            }
        }
        Ok(values)
    }

    async fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing audit database connection");
        self.connection_task.abort();
        Ok(())
    }
}
