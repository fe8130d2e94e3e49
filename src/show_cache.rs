//! Display values for foreign keys.
//!
//! Instances only hold raw ids. Before a batch is applied the cache collects
//! every referenced id the batch mentions, fetches the missing ones with one
//! query per referenced table, and annotates the instances with a `<column>$`
//! companion holding the referenced entity's display value. The whole cache
//! is dropped every `max_loops` flushes or every `life_secs`, whichever comes
//! first.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::capture::{ChangeRecord, QueuedOperation};
use crate::config::ShowCacheConfig;
use crate::model::loader::pick_show_field;
use crate::model::{SchemaMap, ShowMode, TableInfo, TableRef, SHOW_SUFFIX};
use crate::multimap::MultiMap;
use crate::store::{AuditStore, Catalog, ShowQuery};
use crate::stream::{ColumnValue, Row};
use crate::Result;

/// How to display rows of a referenced table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowTable {
    pub id_name: String,
    pub show_field: String,
}

pub struct ShowCache {
    config: ShowCacheConfig,
    show_fields: Vec<String>,
    tables: MultiMap<String, String, ShowTable>,
    cache: MultiMap<String, String, HashMap<String, String>>,
    loops: u32,
    last_flush: Instant,
}

impl ShowCache {
    pub fn new(config: ShowCacheConfig, show_fields: Vec<String>) -> Self {
        Self {
            config,
            show_fields,
            tables: MultiMap::new(),
            cache: MultiMap::new(),
            loops: 0,
            last_flush: Instant::now(),
        }
    }

    /// Display setup of a referenced table, if it can be displayed.
    pub fn show_table(&self, table: &TableRef) -> Option<&ShowTable> {
        self.tables.get(&table.schema, &table.name)
    }

    /// Discovers displayable foreign keys of every tracked table and returns
    /// a new schema map whose tables carry them in `relations`.
    ///
    /// Referenced tables without a single-column primary key or without a
    /// display column are left out, together with the relations pointing at
    /// them.
    pub async fn refresh_schema<C: Catalog + ?Sized>(
        &mut self,
        catalog: &mut C,
        schema_map: &SchemaMap,
    ) -> Result<SchemaMap> {
        self.tables.clear();
        self.cache.clear();

        let mut tables: Vec<(Arc<TableInfo>, BTreeMap<String, TableRef>)> = Vec::new();
        let mut referenced = BTreeSet::new();

        for info in schema_map.values() {
            let show_relation = match &info.show {
                ShowMode::Relation(column) => Some(column),
                _ => None,
            };
            let mut relations = BTreeMap::new();
            for fk in catalog.foreign_keys(&info.table).await? {
                let is_show_relation = show_relation == Some(&fk.column);
                if !info.is_captured(&fk.column) && !is_show_relation {
                    continue;
                }
                if info.relation.as_ref() == Some(&fk.column) && !is_show_relation {
                    continue;
                }
                referenced.insert(fk.referenced.clone());
                relations.insert(fk.column, fk.referenced);
            }
            tables.push((info.clone(), relations));
        }

        for table in &referenced {
            let mut keys = catalog.primary_keys(table).await?;
            if keys.len() != 1 {
                debug!(
                    table = %table,
                    keys = keys.len(),
                    "Referenced table without single primary key"
                );
                continue;
            }
            let id_name = keys.remove(0);
            let columns = catalog.columns(table).await?;
            let show_field = pick_show_field(&self.show_fields, |field| {
                field != id_name && columns.iter().any(|column| column.name == field)
            });

            match show_field {
                Some(show_field) => {
                    self.tables.insert(
                        table.schema.clone(),
                        table.name.clone(),
                        ShowTable { id_name, show_field },
                    );
                }
                None => debug!(table = %table, "Referenced table without display column"),
            }
        }

        let mut refreshed = SchemaMap::new();
        for (info, mut relations) in tables {
            relations.retain(|_, target| self.tables.contains(&target.schema, &target.name));
            let table = info.table.clone();
            refreshed.insert(
                table.schema,
                table.name,
                Arc::new(TableInfo {
                    relations,
                    ..(*info).clone()
                }),
            );
        }

        info!(
            referenced = referenced.len(),
            displayable = self.tables.len(),
            "Display relations loaded"
        );
        Ok(refreshed)
    }

    /// Fills display companions and display values of every record in `ops`.
    pub async fn get_values<S: AuditStore + ?Sized>(
        &mut self,
        store: &mut S,
        ops: &mut [QueuedOperation],
    ) -> Result<()> {
        let mut fetch: MultiMap<String, String, BTreeSet<String>> = MultiMap::new();
        for record in ops.iter().flat_map(|op| op.records.iter()) {
            for (target, id) in referenced_ids(record) {
                let cached = self
                    .cache
                    .get(&target.schema, &target.name)
                    .is_some_and(|values| values.contains_key(&id));
                if !cached {
                    fetch
                        .get_or_insert_with(
                            target.schema.clone(),
                            target.name.clone(),
                            BTreeSet::new,
                        )
                        .insert(id);
                }
            }
        }

        for (schema, table, ids) in fetch.iter() {
            let target = TableRef::new(schema.as_str(), table.as_str());
            let Some(show) = self.tables.get(schema, table) else {
                continue;
            };
            let ids: Vec<String> = ids.iter().cloned().collect();
            let rows = store
                .fetch_show_values(
                    ShowQuery {
                        table: &target,
                        id_name: &show.id_name,
                        show_field: &show.show_field,
                    },
                    &ids,
                )
                .await?;
            debug!(
                table = %target,
                requested = ids.len(),
                found = rows.len(),
                "Display values fetched"
            );

            self.cache
                .get_or_insert_with(schema.clone(), table.clone(), HashMap::new)
                .extend(rows);
        }

        for record in ops.iter_mut().flat_map(|op| op.records.iter_mut()) {
            let table = record.table.clone();
            if let Some(image) = record.new_image.as_mut() {
                self.annotate(&table, image);
            }
            if let Some(image) = record.old_image.as_mut() {
                self.annotate(&table, image);
            }
            record.display_value = match &table.show {
                ShowMode::None => None,
                ShowMode::Field(field) => record.row.get(field).and_then(ColumnValue::as_key),
                ShowMode::Relation(column) => self.lookup(&table, column, &record.row),
            };
        }

        Ok(())
    }

    /// Counts one flush cycle, dropping the cache first when it is due.
    pub fn start_cycle(&mut self) {
        let now = Instant::now();
        let stale = now.duration_since(self.last_flush) >= self.config.life();
        if self.loops >= self.config.max_loops || stale {
            debug!(loops = self.loops, "Display cache cleared");
            self.cache.clear();
            self.loops = 0;
            self.last_flush = now;
        }
        self.loops += 1;
    }

    fn annotate(&self, table: &TableInfo, image: &mut Row) {
        let companions: Vec<(String, String)> = image
            .keys()
            .filter_map(|column| {
                self.lookup(table, column, image)
                    .map(|value| (format!("{}{}", column, SHOW_SUFFIX), value))
            })
            .collect();
        for (column, value) in companions {
            image.insert(column, ColumnValue::Text(value));
        }
    }

    fn lookup(&self, table: &TableInfo, column: &str, row: &Row) -> Option<String> {
        let target = table.relations.get(column)?;
        let id = row.get(column)?.as_key()?;
        self.cache.get(&target.schema, &target.name)?.get(&id).cloned()
    }
}

/// `(referenced table, id)` pairs a record needs displayed.
fn referenced_ids(record: &ChangeRecord) -> Vec<(&TableRef, String)> {
    let table = &record.table;
    let mut ids = Vec::new();
    let mut collect = |row: &Row, column: &str| {
        if let (Some(target), Some(id)) = (
            table.relations.get(column),
            row.get(column).and_then(ColumnValue::as_key),
        ) {
            ids.push((target, id));
        }
    };

    for image in [&record.new_image, &record.old_image].into_iter().flatten() {
        for column in image.keys() {
            collect(image, column);
        }
    }
    if let ShowMode::Relation(column) = &table.show {
        collect(&record.row, column);
    }
    ids
}
