//! Audit store against a live PostgreSQL server.
//!
//! Run with `cargo test --test postgres_store_test -- --ignored` after pointing
//! the `TEST_PG_*` variables at a disposable database.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use audit_capture::checkpoint::Checkpoint;
use audit_capture::model::{LogInfo, LogMap, TableRef};
use audit_capture::store::{
    AuditStore, Catalog, DeleteUpdate, LogEntry, PgConnector, PgStore, ShowQuery, StoreConnector,
};
use audit_capture::stream::Action;
use chrono::{TimeZone, Utc};
use tokio_postgres::{Client, NoTls};

const SETUP: &str = r#"
    DROP SCHEMA IF EXISTS audit_capture_test CASCADE;
    CREATE SCHEMA audit_capture_test;
    CREATE TABLE audit_capture_test.customer (
        id INT PRIMARY KEY,
        name TEXT
    );
    CREATE TABLE audit_capture_test."order" (
        id INT PRIMARY KEY,
        "customerFk" INT REFERENCES audit_capture_test.customer (id),
        status TEXT
    );
    CREATE TYPE audit_capture_test.log_action AS ENUM ('insert', 'update', 'delete');
    CREATE TABLE audit_capture_test."orderLog" (
        id SERIAL PRIMARY KEY,
        origin_fk INT REFERENCES audit_capture_test."order" (id),
        user_fk INT,
        action audit_capture_test.log_action NOT NULL,
        creation_date TIMESTAMP NOT NULL,
        changed_model TEXT NOT NULL,
        old_instance JSON,
        new_instance JSONB,
        changed_model_id TEXT,
        changed_model_value TEXT
    );
    CREATE TABLE audit_capture_test.binlog_queue (
        code TEXT PRIMARY KEY,
        log_name TEXT NOT NULL,
        position BIGINT NOT NULL
    );
    INSERT INTO audit_capture_test.customer VALUES (5, 'Acme'), (6, 'Globex'), (7, NULL);
    INSERT INTO audit_capture_test."order" VALUES (1, 5, 'open'), (2, 6, 'open');
"#;

fn order_log(schema: &str) -> Arc<LogInfo> {
    Arc::new(LogInfo {
        name: "orders".to_string(),
        table: TableRef::new(schema, "orderLog"),
        main_table: TableRef::new(schema, "order"),
    })
}

fn entry(action: Action, origin: &str, model_id: &str) -> LogEntry {
    LogEntry {
        origin: Some(origin.to_string()),
        user: Some("9".to_string()),
        action,
        created: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        model: "Order".to_string(),
        old_instance: None,
        new_instance: Some(r#"{"status":"open"}"#.to_string()),
        model_id: Some(model_id.to_string()),
        model_value: None,
    }
}

async fn admin_client() -> Client {
    let url = common::test_config().postgres_url();
    let (client, connection) = tokio_postgres::connect(&url, NoTls)
        .await
        .expect("TEST_PG_* must point at a reachable server");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("admin connection error: {}", e);
        }
    });
    client
}

/// Recreates the fixture tables in `schema`; every test owns its schema.
async fn setup(schema: &str) -> (Client, PgStore, LogMap) {
    let admin = admin_client().await;
    admin
        .batch_execute(&SETUP.replace("audit_capture_test", schema))
        .await
        .unwrap();

    let connector = PgConnector::new(common::pg_config(), &format!("{}.binlog_queue", schema));
    let mut store = connector.connect().await.unwrap();

    let log = order_log(schema);
    let mut logs = BTreeMap::new();
    logs.insert(log.name.clone(), log);
    store.prepare(&logs).await.unwrap();
    (admin, store, logs)
}

async fn log_rows(admin: &Client, schema: &str) -> Vec<(Option<i32>, String, Option<String>)> {
    let sql = format!(
        r#"SELECT origin_fk, action::text, old_instance::text FROM {}."orderLog" ORDER BY id"#,
        schema
    );
    admin
        .query(&sql, &[])
        .await
        .unwrap()
        .iter()
        .map(|row| (row.get(0), row.get(1), row.get(2)))
        .collect()
}

#[tokio::test]
#[ignore]
async fn test_entries_and_checkpoint_commit_together() {
    const SCHEMA: &str = "capture_test_commit";
    let (admin, mut store, logs) = setup(SCHEMA).await;
    let log = &logs["orders"];

    store.begin().await.unwrap();
    store.insert_entry(log, &entry(Action::Insert, "1", "1")).await.unwrap();

    let missing = store.insert_entry(log, &entry(Action::Insert, "404", "404")).await;
    assert!(missing.unwrap_err().is_foreign_key_violation());

    // The transaction survives the rejected row.
    store.insert_entry(log, &entry(Action::Update, "2", "2")).await.unwrap();
    store
        .save_checkpoint("test", &Checkpoint::new("mysql-bin.000001", 1_200))
        .await
        .unwrap();
    store.commit().await.unwrap();

    let rows = log_rows(&admin, SCHEMA).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, Some(1));
    assert_eq!(rows[1].1, "update");

    assert_eq!(
        store.load_checkpoint("test").await.unwrap(),
        Some(Checkpoint::new("mysql-bin.000001", 1_200))
    );
}

#[tokio::test]
#[ignore]
async fn test_rollback_discards_entries_and_checkpoint() {
    const SCHEMA: &str = "capture_test_rollback";
    let (admin, mut store, logs) = setup(SCHEMA).await;
    let log = &logs["orders"];

    store.begin().await.unwrap();
    store.insert_entry(log, &entry(Action::Insert, "1", "1")).await.unwrap();
    store
        .save_checkpoint("test", &Checkpoint::new("mysql-bin.000001", 900))
        .await
        .unwrap();
    store.rollback().await.unwrap();

    assert!(log_rows(&admin, SCHEMA).await.is_empty());
    assert!(store.load_checkpoint("test").await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_delete_rows_are_found_and_rewritten() {
    const SCHEMA: &str = "capture_test_delete";
    let (admin, mut store, logs) = setup(SCHEMA).await;
    let log = &logs["orders"];

    assert!(store.find_delete(log, "Order", Some("1"), Some("1")).await.unwrap().is_none());

    let mut deleted = entry(Action::Delete, "1", "1");
    deleted.old_instance = Some(r#"{"status":"open"}"#.to_string());
    deleted.new_instance = None;
    store.insert_entry(log, &deleted).await.unwrap();

    assert!(store.find_delete(log, "Order", Some("1"), Some("2")).await.unwrap().is_none());
    let id = store
        .find_delete(log, "Order", Some("1"), Some("1"))
        .await
        .unwrap()
        .expect("delete row should be found");

    let update = DeleteUpdate {
        origin: Some("1".to_string()),
        created: Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap(),
        old_instance: Some(r#"{"status":"closed"}"#.to_string()),
        model_value: Some("Acme".to_string()),
    };
    store.update_delete(log, id, &update).await.unwrap();

    let rows = log_rows(&admin, SCHEMA).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].2.as_deref(), Some(r#"{"status":"closed"}"#));
}

#[tokio::test]
#[ignore]
async fn test_checkpoint_upsert() {
    const SCHEMA: &str = "capture_test_checkpoint";
    let (_admin, mut store, _logs) = setup(SCHEMA).await;

    store
        .save_checkpoint("test", &Checkpoint::new("mysql-bin.000001", 10))
        .await
        .unwrap();
    store
        .save_checkpoint("test", &Checkpoint::new("mysql-bin.000002", 4))
        .await
        .unwrap();

    assert_eq!(
        store.load_checkpoint("test").await.unwrap(),
        Some(Checkpoint::new("mysql-bin.000002", 4))
    );
    assert!(store.load_checkpoint("other").await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_catalog_introspection() {
    const SCHEMA: &str = "capture_test_catalog";
    let (_admin, mut store, _logs) = setup(SCHEMA).await;
    let order = TableRef::new(SCHEMA, "order");

    let columns: Vec<String> = store
        .columns(&order)
        .await
        .unwrap()
        .into_iter()
        .map(|column| column.name)
        .collect();
    assert_eq!(columns, vec!["id", "customerFk", "status"]);

    assert_eq!(store.primary_keys(&order).await.unwrap(), vec!["id"]);

    let foreign_keys = store.foreign_keys(&order).await.unwrap();
    assert_eq!(foreign_keys.len(), 1);
    assert_eq!(foreign_keys[0].column, "customerFk");
    assert_eq!(foreign_keys[0].referenced, TableRef::new(SCHEMA, "customer"));
    assert_eq!(foreign_keys[0].referenced_column, "id");
}

#[tokio::test]
#[ignore]
async fn test_fetch_show_values() {
    const SCHEMA: &str = "capture_test_show";
    let (_admin, mut store, _logs) = setup(SCHEMA).await;
    let customer = TableRef::new(SCHEMA, "customer");
    let query = ShowQuery {
        table: &customer,
        id_name: "id",
        show_field: "name",
    };

    let ids = vec!["5".to_string(), "7".to_string(), "8".to_string()];
    let mut values = store.fetch_show_values(query, &ids).await.unwrap();
    values.sort();

    // Unknown ids and NULL display values are left out.
    assert_eq!(values, vec![("5".to_string(), "Acme".to_string())]);

    store.ping().await.unwrap();
    store.close().await.unwrap();
}
