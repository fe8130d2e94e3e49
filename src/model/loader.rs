//! Builds [`TableInfo`] and [`LogInfo`] from log definitions and live catalog
//! metadata.
//!
//! Loading happens in two steps. [`ModelLoader::load`] turns configuration
//! into one draft per distinct table; [`ModelLoader::resolve`] completes the
//! drafts with columns, primary keys, display fields and relations read from
//! the [`Catalog`]. Any table that cannot be resolved aborts startup with
//! [`Error::Schema`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use super::{
    to_upper_camel_case, CastType, ColumnInfo, LogInfo, LogMap, SchemaMap, ShowMode, TableInfo,
    TableRef,
    SHOW_SUFFIX,
};
use crate::config::{LogConf, ModelConfig, TableConf};
use crate::multimap::MultiMap;
use crate::store::Catalog;
use crate::{Error, Result};

/// Configured table awaiting catalog resolution.
#[derive(Debug, Clone)]
pub struct TableDraft {
    pub table: TableRef,
    pub log: Arc<LogInfo>,
    pub is_main: bool,
    pub model_name: String,
    pub conf: TableConf,
}

/// Output of [`ModelLoader::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadedModel {
    pub logs: LogMap,
    pub tables: MultiMap<String, String, TableDraft>,
}

impl LoadedModel {
    /// Tracked table names per schema, as passed to the stream filter.
    pub fn include_filter(&self) -> BTreeMap<String, Vec<String>> {
        self.tables
            .groups()
            .map(|(schema, tables)| (schema.clone(), tables.keys().cloned().collect()))
            .collect()
    }
}

struct Resolved {
    columns: BTreeMap<String, ColumnInfo>,
    cast_types: HashMap<String, CastType>,
    id_name: String,
    show: ShowMode,
    user_field: Option<String>,
}

pub struct ModelLoader {
    model: ModelConfig,
    logs: BTreeMap<String, LogConf>,
    default_schema: String,
    exclude: HashSet<String>,
    exclude_regex: Option<Regex>,
}

impl ModelLoader {
    pub fn new(
        model: ModelConfig,
        logs: BTreeMap<String, LogConf>,
        default_schema: impl Into<String>,
    ) -> Result<Self> {
        let exclude_regex = match &model.exclude_regex {
            Some(pattern) => Some(
                Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("Invalid exclude_regex '{}': {}", pattern, e))
                })?,
            ),
            None => None,
        };

        Ok(Self {
            exclude: model.exclude.iter().cloned().collect(),
            exclude_regex,
            model,
            logs,
            default_schema: default_schema.into(),
        })
    }

    /// Parses log definitions into one draft per distinct `(schema, table)`.
    ///
    /// A table referenced by several logs belongs to the first one; later
    /// references only contribute their explicit settings.
    pub fn load(&self) -> LoadedModel {
        let mut model = LoadedModel::default();

        for (log_name, log_conf) in &self.logs {
            let schema = log_conf.schema.as_deref().unwrap_or(&self.default_schema);
            let main_conf = log_conf.main_table.clone().into_conf();
            let log = Arc::new(LogInfo {
                name: log_name.clone(),
                table: TableRef::parse(&log_conf.log_table, schema),
                main_table: TableRef::parse(&main_conf.name, schema),
            });
            model.logs.insert(log_name.clone(), log.clone());

            self.add_table(&mut model, main_conf, &log, schema, true);
            for entry in &log_conf.tables {
                self.add_table(&mut model, entry.clone().into_conf(), &log, schema, false);
            }
        }

        debug!(logs = model.logs.len(), tables = model.tables.len(), "Log definitions loaded");
        model
    }

    fn add_table(
        &self,
        model: &mut LoadedModel,
        conf: TableConf,
        log: &Arc<LogInfo>,
        schema: &str,
        is_main: bool,
    ) {
        let table = TableRef::parse(&conf.name, schema);

        if let Some(draft) = model.tables.get_mut(&table.schema, &table.name) {
            if is_main && !draft.is_main {
                warn!(
                    table = %table,
                    owner = %draft.log.name,
                    log = %log.name,
                    "Main table already tracked by another log, keeping first owner"
                );
            }
            merge_conf(&mut draft.conf, conf);
            if let Some(model_name) = &draft.conf.model_name {
                draft.model_name = model_name.clone();
            }
            return;
        }

        let model_name = match &conf.model_name {
            Some(name) => name.clone(),
            None if self.model.upper_case_table => to_upper_camel_case(&table.name),
            None => table.name.clone(),
        };

        model.tables.insert(
            table.schema.clone(),
            table.name.clone(),
            TableDraft {
                table,
                log: log.clone(),
                is_main,
                model_name,
                conf,
            },
        );
    }

    /// Completes every draft with catalog metadata.
    pub async fn resolve<C: Catalog + ?Sized>(
        &self,
        model: &LoadedModel,
        catalog: &mut C,
    ) -> Result<SchemaMap> {
        let mut resolved: MultiMap<String, String, Resolved> = MultiMap::new();

        for draft in model.tables.values() {
            let table = self.resolve_table(draft, catalog).await?;
            resolved.insert(draft.table.schema.clone(), draft.table.name.clone(), table);
        }

        let mut relations = HashMap::new();
        for draft in model.tables.values() {
            if draft.is_main {
                continue;
            }
            let relation = match &draft.conf.relation {
                Some(relation) => relation.clone(),
                None => {
                    let main = &draft.log.main_table;
                    let main_id = resolved
                        .get(&main.schema, &main.name)
                        .map(|main| main.id_name.clone())
                        .ok_or_else(|| Error::Schema(format!("Main table not tracked: {}", main)))?;
                    self.find_relation(draft, &main_id, catalog).await?
                }
            };
            relations.insert(draft.table.clone(), relation);
        }

        let mut schema_map = SchemaMap::new();

        for draft in model.tables.values() {
            let relation = relations.remove(&draft.table);
            let Some(table) = resolved.remove(&draft.table.schema, &draft.table.name) else {
                continue;
            };

            debug!(
                table = %draft.table,
                model = %draft.model_name,
                id = %table.id_name,
                relation = ?relation,
                show = ?table.show,
                columns = table.columns.len(),
                "Table resolved"
            );

            schema_map.insert(
                draft.table.schema.clone(),
                draft.table.name.clone(),
                Arc::new(TableInfo {
                    table: draft.table.clone(),
                    log: draft.log.clone(),
                    model_name: draft.model_name.clone(),
                    is_main: draft.is_main,
                    columns: table.columns,
                    cast_types: table.cast_types,
                    id_name: table.id_name,
                    relation,
                    show: table.show,
                    user_field: table.user_field,
                    relations: BTreeMap::new(),
                }),
            );
        }

        info!(tables = schema_map.len(), "Schema resolved");
        Ok(schema_map)
    }

    async fn resolve_table<C: Catalog + ?Sized>(
        &self,
        draft: &TableDraft,
        catalog: &mut C,
    ) -> Result<Resolved> {
        let conf = &draft.conf;
        let user_field = conf.user_field.clone().or_else(|| self.model.user_field.clone());
        let local_exclude: HashSet<&str> = conf.exclude.iter().map(String::as_str).collect();

        let mut columns = BTreeMap::new();
        let mut cast_types: HashMap<String, CastType> = conf.types.clone();

        for column in catalog.columns(&draft.table).await? {
            let excluded = local_exclude.contains(column.name.as_str())
                || self.exclude.contains(&column.name)
                || self.exclude_regex.as_ref().is_some_and(|re| re.is_match(&column.name))
                || user_field.as_deref() == Some(column.name.as_str());
            if excluded {
                continue;
            }

            if let Some(cast) = self.model.cast_types.get(&column.data_type) {
                cast_types.entry(column.name.clone()).or_insert(*cast);
            }
            columns.insert(
                column.name,
                ColumnInfo {
                    data_type: column.data_type,
                    default: column.default,
                },
            );
        }

        if columns.is_empty() {
            return Err(Error::Schema(format!("No columns found for table: {}", draft.table)));
        }

        let id_name = match &conf.id_name {
            Some(id_name) => id_name.clone(),
            None => {
                let mut keys = catalog.primary_keys(&draft.table).await?;
                match keys.len() {
                    0 => {
                        return Err(Error::Schema(format!(
                            "Primary key not found for table: {}",
                            draft.table
                        )))
                    }
                    1 => keys.remove(0),
                    _ => {
                        return Err(Error::Schema(format!(
                            "Only one column primary key is supported: {}",
                            draft.table
                        )))
                    }
                }
            }
        };

        let show = match &conf.show_field {
            Some(field) => match field.strip_suffix(SHOW_SUFFIX) {
                Some(relation) => ShowMode::Relation(relation.to_string()),
                None => ShowMode::Field(field.clone()),
            },
            None if draft.is_main && !self.model.show_main => ShowMode::None,
            None => pick_show_field(&self.model.show_fields, |field| columns.contains_key(field))
                .map(ShowMode::Field)
                .unwrap_or(ShowMode::None),
        };

        Ok(Resolved {
            columns,
            cast_types,
            id_name,
            show,
            user_field,
        })
    }

    async fn find_relation<C: Catalog + ?Sized>(
        &self,
        draft: &TableDraft,
        main_id: &str,
        catalog: &mut C,
    ) -> Result<String> {
        let main = &draft.log.main_table;
        let mut relations: Vec<String> = catalog
            .foreign_keys(&draft.table)
            .await?
            .into_iter()
            .filter(|fk| &fk.referenced == main && fk.referenced_column == main_id)
            .map(|fk| fk.column)
            .collect();

        match relations.len() {
            0 => Err(Error::Schema(format!(
                "No relation to main table {} found for table: {}",
                main, draft.table
            ))),
            1 => Ok(relations.remove(0)),
            _ => Err(Error::Schema(format!(
                "Multiple relations to main table {} found for table: {}",
                main, draft.table
            ))),
        }
    }
}

/// First candidate of `priority` accepted by `available`.
pub fn pick_show_field(priority: &[String], available: impl Fn(&str) -> bool) -> Option<String> {
    priority.iter().find(|field| available(field)).cloned()
}

fn merge_conf(current: &mut TableConf, other: TableConf) {
    if other.model_name.is_some() {
        current.model_name = other.model_name;
    }
    if other.id_name.is_some() {
        current.id_name = other.id_name;
    }
    if other.relation.is_some() {
        current.relation = other.relation;
    }
    if other.show_field.is_some() {
        current.show_field = other.show_field;
    }
    if other.user_field.is_some() {
        current.user_field = other.user_field;
    }
    for column in other.exclude {
        if !current.exclude.contains(&column) {
            current.exclude.push(column);
        }
    }
    current.types.extend(other.types);
}
