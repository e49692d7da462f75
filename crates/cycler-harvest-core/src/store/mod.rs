//! Storage abstraction for harvest state and timeseries data.
//!
//! The [`Store`] trait covers everything the report handler and the
//! operator commands need: harvesters, monitored paths, observed files,
//! the shared unit/column-type catalogue, per-file columns with their
//! typed values, data labels and harvest errors.
//!
//! Implementations must be `Send + Sync` so a single store can serve many
//! concurrent report requests.
//!
//! # Uniqueness
//!
//! Natural keys are enforced by the store, not by callers:
//!
//! | Record | Key |
//! |--------|-----|
//! | observed file | `(harvester_id, path)` |
//! | unit | `symbol` |
//! | column type | `(name, unit_id)` |
//! | column | `(file_id, type_id)` |
//!
//! The `lookup_or_insert_*` and `find_or_insert_file` operations return the
//! existing record when the key is already taken, so racing creators all end
//! up with the same row.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::catalogue::{StandardColumn, STANDARD_UNITS};
use crate::models::{
    Column, ColumnAppend, ColumnType, DataLabel, DataUnit, FileState, HarvestError, Harvester,
    MonitoredPath, NewColumnType, NewHarvestError, NewMonitoredPath, NewObservedFile,
    ObservedFile, TimeseriesValues,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`register_harvester`](Store::register_harvester) | Create a harvester with its API key |
/// | [`find_or_insert_file`](Store::find_or_insert_file) | First observation of a file |
/// | [`update_file`](Store::update_file) | Persist state and metadata changes |
/// | [`lookup_or_insert_column_type`](Store::lookup_or_insert_column_type) | Get-or-create a catalogue entry |
/// | [`append_chunk`](Store::append_chunk) | Append one chunk of values atomically |
/// | [`clear_file_data`](Store::clear_file_data) | Drop all columns, values and labels of a file |
/// | [`record_error`](Store::record_error) | Record a harvest error |
#[async_trait]
pub trait Store: Send + Sync {
    async fn register_harvester(
        &self,
        name: &str,
        api_key: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Harvester>;

    async fn get_harvester(&self, id: i64) -> Result<Option<Harvester>>;

    async fn add_monitored_path(&self, path: &NewMonitoredPath) -> Result<MonitoredPath>;

    async fn get_monitored_path(&self, id: i64) -> Result<Option<MonitoredPath>>;

    /// Monitored paths, optionally restricted to one harvester, ordered by id.
    async fn list_monitored_paths(&self, harvester_id: Option<i64>) -> Result<Vec<MonitoredPath>>;

    /// Return the file for `(harvester_id, path)`, creating it if absent.
    ///
    /// The flag is `true` when this call created the record.
    async fn find_or_insert_file(&self, file: &NewObservedFile) -> Result<(ObservedFile, bool)>;

    async fn find_file(&self, harvester_id: i64, path: &str) -> Result<Option<ObservedFile>>;

    async fn get_file(&self, id: i64) -> Result<Option<ObservedFile>>;

    /// Overwrite every mutable field of an existing file.
    async fn update_file(&self, file: &ObservedFile) -> Result<()>;

    /// Files ordered by id, optionally restricted to one harvester.
    async fn list_files(&self, harvester_id: Option<i64>) -> Result<Vec<ObservedFile>>;

    /// Get-or-create a unit by symbol. An existing unit keeps its name and flag.
    async fn lookup_or_insert_unit(&self, symbol: &str, name: &str, is_default: bool)
        -> Result<DataUnit>;

    async fn get_unit(&self, id: i64) -> Result<Option<DataUnit>>;

    async fn list_units(&self) -> Result<Vec<DataUnit>>;

    async fn lookup_or_insert_column_type(&self, column_type: &NewColumnType) -> Result<ColumnType>;

    async fn get_column_type(&self, id: i64) -> Result<Option<ColumnType>>;

    async fn list_column_types(&self) -> Result<Vec<ColumnType>>;

    /// Columns of one file ordered by id.
    async fn file_columns(&self, file_id: i64) -> Result<Vec<Column>>;

    /// Create missing columns and append values to every listed column.
    ///
    /// Either every append is applied or none is. Fails without writing if a
    /// listed column already exists with a different data type.
    async fn append_chunk(&self, file_id: i64, chunk: &[ColumnAppend]) -> Result<()>;

    async fn column_values(&self, column_id: i64) -> Result<TimeseriesValues>;

    async fn column_length(&self, column_id: i64) -> Result<usize>;

    /// Last stored value of a column as JSON, `None` when empty.
    async fn last_value(&self, column_id: i64) -> Result<Option<Value>>;

    /// Remove the columns, values and data labels of a file.
    async fn clear_file_data(&self, file_id: i64) -> Result<()>;

    /// Add data labels after the ones already stored for a file.
    async fn append_data_labels(&self, file_id: i64, labels: &[DataLabel]) -> Result<()>;

    /// Remove all data labels of a file.
    async fn clear_data_labels(&self, file_id: i64) -> Result<()>;

    async fn data_labels(&self, file_id: i64) -> Result<Vec<DataLabel>>;

    async fn record_error(&self, error: &NewHarvestError) -> Result<HarvestError>;

    /// Most recent error attached to a file.
    async fn latest_error(&self, file_id: i64) -> Result<Option<HarvestError>>;
}

/// Insert the standard units and column types. Safe to run repeatedly.
pub async fn seed_standard_catalogue<S: Store + ?Sized>(store: &S) -> Result<()> {
    for (symbol, name) in STANDARD_UNITS {
        store.lookup_or_insert_unit(symbol, name, true).await?;
    }
    for column in StandardColumn::ALL {
        let unit = store
            .lookup_or_insert_unit(column.unit_symbol(), column.unit_symbol(), true)
            .await?;
        store
            .lookup_or_insert_column_type(&NewColumnType {
                name: column.name().to_string(),
                unit_id: unit.id,
                is_default: true,
                is_required: column.is_required(),
            })
            .await?;
    }
    Ok(())
}

/// Per-state file counts, in lifecycle order.
pub fn count_states(files: &[ObservedFile]) -> Vec<(FileState, usize)> {
    FileState::ALL
        .into_iter()
        .map(|state| (state, files.iter().filter(|f| f.state == state).count()))
        .collect()
}
