#![allow(dead_code)]

use audit_capture::config::{
    Config, LogConf, LoggerConfig, ModelConfig, PostgresConfig, ShowCacheConfig, SourceConfig,
    TableEntry,
};
use audit_capture::model::TableRef;
use audit_capture::store::MemoryStore;
use audit_capture::stream::{Action, ColumnValue, Row, RowChange, RowsEvent, StreamEvent};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use tokio::time::{sleep, timeout};

pub const FILE: &str = "mysql-bin.000001";
pub const ORDER_TABLE_ID: u64 = 11;
pub const LINE_TABLE_ID: u64 = 12;

pub fn order_log() -> TableRef {
    TableRef::new("shop", "orderLog")
}

/// `orders` log over `shop.order` and `shop.orderLine`, tuned for fast flushes.
pub fn test_config() -> Config {
    let mut logs = BTreeMap::new();
    logs.insert(
        "orders".to_string(),
        LogConf {
            log_table: "orderLog".to_string(),
            main_table: TableEntry::Name("order".to_string()),
            schema: None,
            tables: vec![TableEntry::Name("orderLine".to_string())],
        },
    );

    Config {
        code: "test".to_string(),
        source: SourceConfig {
            address: "127.0.0.1:0".to_string(),
            database: "shop".to_string(),
            server_id: 7,
            connect_timeout_secs: 1,
        },
        audit_db: pg_config(),
        logger: LoggerConfig {
            flush_interval_secs: 1,
            ping_interval_secs: 60,
            queue_flush_delay_ms: 20,
            restart_timeout_secs: 0,
            ..LoggerConfig::default()
        },
        show_cache: ShowCacheConfig::default(),
        model: ModelConfig {
            upper_case_table: true,
            user_field: Some("editorFk".to_string()),
            show_fields: vec!["name".to_string()],
            exclude: vec!["updated".to_string()],
            ..ModelConfig::default()
        },
        logs,
    }
}

/// Audit database from `TEST_PG_*` environment variables.
pub fn pg_config() -> PostgresConfig {
    PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 5,
    }
}

/// Catalog of the shop database.
pub fn shop_store() -> MemoryStore {
    let store = MemoryStore::new();
    let order = TableRef::new("shop", "order");
    let line = TableRef::new("shop", "orderLine");
    let customer = TableRef::new("crm", "customer");

    store.add_table(
        &order,
        &[
            ("id", "int"),
            ("customerFk", "int"),
            ("status", "varchar"),
            ("editorFk", "int"),
            ("updated", "timestamp"),
        ],
        &["id"],
    );
    store.add_table(
        &line,
        &[("id", "int"), ("orderFk", "int"), ("qty", "int"), ("editorFk", "int")],
        &["id"],
    );
    store.add_table(&customer, &[("id", "int"), ("name", "varchar")], &["id"]);
    store.add_foreign_key(&line, "orderFk", &order, "id");
    store.add_foreign_key(&order, "customerFk", &customer, "id");
    store.add_show_row(&customer, "id", "5", &[("name", "Acme")]);
    store.add_show_row(&customer, "id", "6", &[("name", "Globex")]);
    store
}

pub fn row<const N: usize>(columns: [(&str, ColumnValue); N]) -> Row {
    columns
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

pub fn int(value: i64) -> ColumnValue {
    ColumnValue::Int(value)
}

pub fn text(value: &str) -> ColumnValue {
    ColumnValue::Text(value.to_string())
}

pub fn order(id: i64, customer: i64, status: &str) -> Row {
    row([
        ("id", int(id)),
        ("customerFk", int(customer)),
        ("status", text(status)),
        ("editorFk", int(9)),
        ("updated", ColumnValue::Null),
    ])
}

pub fn order_line(id: i64, order: i64, qty: i64) -> Row {
    row([("id", int(id)), ("orderFk", int(order)), ("qty", int(qty)), ("editorFk", int(9))])
}

pub fn rotate(position: u64) -> StreamEvent {
    StreamEvent::Rotate {
        file: FILE.to_string(),
        position,
    }
}

pub fn table_maps(next_position: u64) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TableMap {
            table_id: ORDER_TABLE_ID,
            schema: "shop".to_string(),
            table: "order".to_string(),
            next_position,
        },
        StreamEvent::TableMap {
            table_id: LINE_TABLE_ID,
            schema: "shop".to_string(),
            table: "orderLine".to_string(),
            next_position,
        },
    ]
}

pub fn rows(action: Action, table_id: u64, change: RowChange, next_position: u64) -> StreamEvent {
    StreamEvent::Rows(RowsEvent {
        action,
        table_id,
        rows: vec![change],
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        next_position,
    })
}

pub fn insert_order(id: i64, next_position: u64) -> StreamEvent {
    rows(
        Action::Insert,
        ORDER_TABLE_ID,
        RowChange::inserted(order(id, 5, "open")),
        next_position,
    )
}

/// Polls `check` until it holds, panicking after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let polled = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if polled.is_err() {
        panic!("timed out waiting for {}", what);
    }
}
