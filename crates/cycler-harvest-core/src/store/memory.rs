//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! All tables live in one struct behind a single `RwLock`, so every
//! operation (including [`Store::append_chunk`]) is atomic with respect to
//! every other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{
    Column, ColumnAppend, ColumnType, DataLabel, DataUnit, HarvestError, Harvester, MonitoredPath,
    NewColumnType, NewHarvestError, NewMonitoredPath, NewObservedFile, ObservedFile,
    TimeseriesValues,
};

use super::{seed_standard_catalogue, Store};

#[derive(Default)]
struct Tables {
    next_id: i64,
    harvesters: BTreeMap<i64, Harvester>,
    paths: BTreeMap<i64, MonitoredPath>,
    files: BTreeMap<i64, ObservedFile>,
    file_keys: HashMap<(i64, String), i64>,
    units: BTreeMap<i64, DataUnit>,
    column_types: BTreeMap<i64, ColumnType>,
    columns: BTreeMap<i64, Column>,
    values: HashMap<i64, TimeseriesValues>,
    labels: HashMap<i64, Vec<DataLabel>>,
    errors: Vec<HarvestError>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// A store pre-populated with the standard units and column types.
    pub async fn with_standard_catalogue() -> Result<Self> {
        let store = Self::new();
        seed_standard_catalogue(&store).await?;
        Ok(store)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn register_harvester(
        &self,
        name: &str,
        api_key: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Harvester> {
        let mut t = self.write()?;
        let harvester = Harvester {
            id: t.next_id(),
            name: name.to_string(),
            api_key: api_key.to_string(),
            created_at,
        };
        t.harvesters.insert(harvester.id, harvester.clone());
        Ok(harvester)
    }

    async fn get_harvester(&self, id: i64) -> Result<Option<Harvester>> {
        Ok(self.read()?.harvesters.get(&id).cloned())
    }

    async fn add_monitored_path(&self, path: &NewMonitoredPath) -> Result<MonitoredPath> {
        let mut t = self.write()?;
        if !t.harvesters.contains_key(&path.harvester_id) {
            bail!("harvester {} does not exist", path.harvester_id);
        }
        let stored = MonitoredPath {
            id: t.next_id(),
            harvester_id: path.harvester_id,
            path: path.path.clone(),
            pattern: path.pattern.clone(),
            stable_time: path.stable_time,
            active: true,
        };
        t.paths.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_monitored_path(&self, id: i64) -> Result<Option<MonitoredPath>> {
        Ok(self.read()?.paths.get(&id).cloned())
    }

    async fn list_monitored_paths(&self, harvester_id: Option<i64>) -> Result<Vec<MonitoredPath>> {
        Ok(self
            .read()?
            .paths
            .values()
            .filter(|p| harvester_id.map_or(true, |h| p.harvester_id == h))
            .cloned()
            .collect())
    }

    async fn find_or_insert_file(&self, file: &NewObservedFile) -> Result<(ObservedFile, bool)> {
        let mut t = self.write()?;
        let key = (file.harvester_id, file.path.clone());
        if let Some(id) = t.file_keys.get(&key).copied() {
            if let Some(existing) = t.files.get(&id) {
                return Ok((existing.clone(), false));
            }
        }
        let id = t.next_id();
        let created = file.clone().into_file(id);
        t.files.insert(id, created.clone());
        t.file_keys.insert(key, id);
        Ok((created, true))
    }

    async fn find_file(&self, harvester_id: i64, path: &str) -> Result<Option<ObservedFile>> {
        let t = self.read()?;
        Ok(t.file_keys
            .get(&(harvester_id, path.to_string()))
            .and_then(|id| t.files.get(id))
            .cloned())
    }

    async fn get_file(&self, id: i64) -> Result<Option<ObservedFile>> {
        Ok(self.read()?.files.get(&id).cloned())
    }

    async fn update_file(&self, file: &ObservedFile) -> Result<()> {
        let mut t = self.write()?;
        match t.files.get_mut(&file.id) {
            Some(stored) => {
                *stored = file.clone();
                Ok(())
            }
            None => bail!("file {} does not exist", file.id),
        }
    }

    async fn list_files(&self, harvester_id: Option<i64>) -> Result<Vec<ObservedFile>> {
        Ok(self
            .read()?
            .files
            .values()
            .filter(|f| harvester_id.map_or(true, |h| f.harvester_id == h))
            .cloned()
            .collect())
    }

    async fn lookup_or_insert_unit(
        &self,
        symbol: &str,
        name: &str,
        is_default: bool,
    ) -> Result<DataUnit> {
        let mut t = self.write()?;
        if let Some(unit) = t.units.values().find(|u| u.symbol == symbol) {
            return Ok(unit.clone());
        }
        let unit = DataUnit {
            id: t.next_id(),
            symbol: symbol.to_string(),
            name: name.to_string(),
            is_default,
        };
        t.units.insert(unit.id, unit.clone());
        Ok(unit)
    }

    async fn get_unit(&self, id: i64) -> Result<Option<DataUnit>> {
        Ok(self.read()?.units.get(&id).cloned())
    }

    async fn list_units(&self) -> Result<Vec<DataUnit>> {
        Ok(self.read()?.units.values().cloned().collect())
    }

    async fn lookup_or_insert_column_type(&self, column_type: &NewColumnType) -> Result<ColumnType> {
        let mut t = self.write()?;
        if !t.units.contains_key(&column_type.unit_id) {
            bail!("unit {} does not exist", column_type.unit_id);
        }
        if let Some(existing) = t
            .column_types
            .values()
            .find(|c| c.name == column_type.name && c.unit_id == column_type.unit_id)
        {
            return Ok(existing.clone());
        }
        let stored = ColumnType {
            id: t.next_id(),
            name: column_type.name.clone(),
            unit_id: column_type.unit_id,
            is_default: column_type.is_default,
            is_required: column_type.is_required,
            override_name: None,
        };
        t.column_types.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_column_type(&self, id: i64) -> Result<Option<ColumnType>> {
        Ok(self.read()?.column_types.get(&id).cloned())
    }

    async fn list_column_types(&self) -> Result<Vec<ColumnType>> {
        Ok(self.read()?.column_types.values().cloned().collect())
    }

    async fn file_columns(&self, file_id: i64) -> Result<Vec<Column>> {
        Ok(self
            .read()?
            .columns
            .values()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect())
    }

    async fn append_chunk(&self, file_id: i64, chunk: &[ColumnAppend]) -> Result<()> {
        let mut t = self.write()?;
        if !t.files.contains_key(&file_id) {
            bail!("file {} does not exist", file_id);
        }

        // Validate everything before touching any table.
        let mut targets = Vec::with_capacity(chunk.len());
        for append in chunk {
            let existing = t
                .columns
                .values()
                .find(|c| c.file_id == file_id && c.type_id == append.type_id);
            match existing {
                Some(column) if column.data_type != append.values.data_type() => bail!(
                    "column '{}' stores {} values, chunk sent {}",
                    column.name,
                    column.data_type,
                    append.values.data_type()
                ),
                Some(column) => targets.push(Some(column.id)),
                None => {
                    if !t.column_types.contains_key(&append.type_id) {
                        bail!("column type {} does not exist", append.type_id);
                    }
                    targets.push(None);
                }
            }
        }

        for (append, target) in chunk.iter().zip(targets) {
            let column_id = match target {
                Some(id) => id,
                None => {
                    let id = t.next_id();
                    t.columns.insert(
                        id,
                        Column {
                            id,
                            file_id,
                            type_id: append.type_id,
                            name: append.name.clone(),
                            data_type: append.values.data_type(),
                        },
                    );
                    id
                }
            };
            t.values
                .entry(column_id)
                .or_insert_with(|| TimeseriesValues::empty(append.values.data_type()))
                .extend_from(&append.values)?;
        }
        Ok(())
    }

    async fn column_values(&self, column_id: i64) -> Result<TimeseriesValues> {
        let t = self.read()?;
        let column = t
            .columns
            .get(&column_id)
            .ok_or_else(|| anyhow!("column {} does not exist", column_id))?;
        Ok(t.values
            .get(&column_id)
            .cloned()
            .unwrap_or_else(|| TimeseriesValues::empty(column.data_type)))
    }

    async fn column_length(&self, column_id: i64) -> Result<usize> {
        Ok(self
            .read()?
            .values
            .get(&column_id)
            .map_or(0, TimeseriesValues::len))
    }

    async fn last_value(&self, column_id: i64) -> Result<Option<Value>> {
        Ok(self
            .read()?
            .values
            .get(&column_id)
            .and_then(TimeseriesValues::last_json))
    }

    async fn clear_file_data(&self, file_id: i64) -> Result<()> {
        let mut t = self.write()?;
        let column_ids: Vec<i64> = t
            .columns
            .values()
            .filter(|c| c.file_id == file_id)
            .map(|c| c.id)
            .collect();
        for id in column_ids {
            t.columns.remove(&id);
            t.values.remove(&id);
        }
        t.labels.remove(&file_id);
        Ok(())
    }

    async fn append_data_labels(&self, file_id: i64, labels: &[DataLabel]) -> Result<()> {
        self.write()?
            .labels
            .entry(file_id)
            .or_default()
            .extend_from_slice(labels);
        Ok(())
    }

    async fn clear_data_labels(&self, file_id: i64) -> Result<()> {
        self.write()?.labels.remove(&file_id);
        Ok(())
    }

    async fn data_labels(&self, file_id: i64) -> Result<Vec<DataLabel>> {
        Ok(self
            .read()?
            .labels
            .get(&file_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_error(&self, error: &NewHarvestError) -> Result<HarvestError> {
        let mut t = self.write()?;
        let stored = HarvestError {
            id: t.next_id(),
            harvester_id: error.harvester_id,
            file_id: error.file_id,
            error: error.error.clone(),
            timestamp: error.timestamp,
        };
        t.errors.push(stored.clone());
        Ok(stored)
    }

    async fn latest_error(&self, file_id: i64) -> Result<Option<HarvestError>> {
        Ok(self
            .read()?
            .errors
            .iter()
            .rev()
            .find(|e| e.file_id == Some(file_id))
            .cloned())
    }
}
