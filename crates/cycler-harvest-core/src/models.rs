//! Core data models shared by the harvester and the server.
//!
//! These types describe the monitored paths a harvester watches, the
//! server-side record of every observed file, the shared unit and column
//! type catalogue, and the typed timeseries values stored per column.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of an [`ObservedFile`].
///
/// Only the report handler moves a file between states, apart from the
/// operator reimport which forces [`FileState::RetryImport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Unstable,
    Growing,
    Stable,
    Importing,
    Imported,
    ImportFailed,
    RetryImport,
}

impl FileState {
    pub const ALL: [FileState; 7] = [
        FileState::Unstable,
        FileState::Growing,
        FileState::Stable,
        FileState::Importing,
        FileState::Imported,
        FileState::ImportFailed,
        FileState::RetryImport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Unstable => "UNSTABLE",
            FileState::Growing => "GROWING",
            FileState::Stable => "STABLE",
            FileState::Importing => "IMPORTING",
            FileState::Imported => "IMPORTED",
            FileState::ImportFailed => "IMPORT_FAILED",
            FileState::RetryImport => "RETRY_IMPORT",
        }
    }

    /// Whether a harvester seeing this state should start an import.
    pub fn wants_import(&self) -> bool {
        matches!(self, FileState::Stable | FileState::RetryImport)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown file state: '{}'", s))
    }
}

/// Scalar storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int,
    Str,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Str => "str",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" => Ok(DataType::Float),
            "int" => Ok(DataType::Int),
            "str" => Ok(DataType::Str),
            other => anyhow::bail!("unknown data type: '{}'", other),
        }
    }
}

/// A registered harvester agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Harvester {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

/// A directory a harvester watches, with a glob filter and stability window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredPath {
    pub id: i64,
    pub harvester_id: i64,
    pub path: String,
    /// Glob matched against paths relative to `path`.
    pub pattern: String,
    /// Seconds a file's size must stay unchanged before it may be imported.
    pub stable_time: u64,
    pub active: bool,
}

/// Input for creating a [`MonitoredPath`].
#[derive(Debug, Clone)]
pub struct NewMonitoredPath {
    pub harvester_id: i64,
    pub path: String,
    pub pattern: String,
    pub stable_time: u64,
}

/// Server-side record of one file seen by one harvester.
///
/// Unique per `(harvester_id, path)` and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedFile {
    pub id: i64,
    pub harvester_id: i64,
    pub path: String,
    pub last_observed_size: u64,
    pub last_observed_time: DateTime<Utc>,
    pub state: FileState,
    pub inferred_format: Option<String>,
    pub parser: Option<String>,
    pub name: Option<String>,
    pub num_rows: Option<i64>,
    pub first_sample_no: Option<i64>,
    pub last_sample_no: Option<i64>,
    pub test_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra_metadata: Value,
}

/// Input for the first observation of a file.
#[derive(Debug, Clone)]
pub struct NewObservedFile {
    pub harvester_id: i64,
    pub path: String,
    pub size: u64,
    pub observed_at: DateTime<Utc>,
}

impl NewObservedFile {
    /// The record a first observation creates: UNSTABLE, no metadata yet.
    pub fn into_file(self, id: i64) -> ObservedFile {
        ObservedFile {
            id,
            harvester_id: self.harvester_id,
            path: self.path,
            last_observed_size: self.size,
            last_observed_time: self.observed_at,
            state: FileState::Unstable,
            inferred_format: None,
            parser: None,
            name: None,
            num_rows: None,
            first_sample_no: None,
            last_sample_no: None,
            test_date: None,
            extra_metadata: Value::Object(Default::default()),
        }
    }
}

/// Canonical physical unit. Keyed by `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUnit {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    pub is_default: bool,
}

/// Canonical column definition bound to a unit. Keyed by `(name, unit_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnType {
    pub id: i64,
    pub name: String,
    pub unit_id: i64,
    pub is_default: bool,
    pub is_required: bool,
    pub override_name: Option<String>,
}

impl ColumnType {
    /// Name shown to operators.
    pub fn display_name(&self) -> &str {
        self.override_name.as_deref().unwrap_or(&self.name)
    }
}

/// Input for [`Store::lookup_or_insert_column_type`](crate::store::Store::lookup_or_insert_column_type).
#[derive(Debug, Clone)]
pub struct NewColumnType {
    pub name: String,
    pub unit_id: i64,
    pub is_default: bool,
    pub is_required: bool,
}

/// A column type instantiated within one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: i64,
    pub file_id: i64,
    pub type_id: i64,
    /// Literal header text in the source file (or the type name when synthesised).
    pub name: String,
    pub data_type: DataType,
}

/// Values to append to one column of a file, creating the column if needed.
#[derive(Debug, Clone)]
pub struct ColumnAppend {
    pub type_id: i64,
    pub name: String,
    pub values: TimeseriesValues,
}

/// Ordered values of one column. Row order is the sample order.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeseriesValues {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Str(Vec<String>),
}

impl TimeseriesValues {
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::Float => TimeseriesValues::Float(Vec::new()),
            DataType::Int => TimeseriesValues::Int(Vec::new()),
            DataType::Str => TimeseriesValues::Str(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TimeseriesValues::Float(_) => DataType::Float,
            TimeseriesValues::Int(_) => DataType::Int,
            TimeseriesValues::Str(_) => DataType::Str,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TimeseriesValues::Float(v) => v.len(),
            TimeseriesValues::Int(v) => v.len(),
            TimeseriesValues::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other` to the end of this sequence. Types must match.
    pub fn extend_from(&mut self, other: &TimeseriesValues) -> anyhow::Result<()> {
        match (self, other) {
            (TimeseriesValues::Float(a), TimeseriesValues::Float(b)) => a.extend_from_slice(b),
            (TimeseriesValues::Int(a), TimeseriesValues::Int(b)) => a.extend_from_slice(b),
            (TimeseriesValues::Str(a), TimeseriesValues::Str(b)) => a.extend_from_slice(b),
            (a, b) => anyhow::bail!(
                "cannot append {} values to a {} column",
                b.data_type(),
                a.data_type()
            ),
        }
        Ok(())
    }

    /// JSON value at `index`. Non-finite floats become `null`.
    pub fn json_at(&self, index: usize) -> Option<Value> {
        match self {
            TimeseriesValues::Float(v) => v.get(index).map(|x| Value::from(*x)),
            TimeseriesValues::Int(v) => v.get(index).map(|x| Value::from(*x)),
            TimeseriesValues::Str(v) => v.get(index).map(|x| Value::from(x.as_str())),
        }
    }

    pub fn last_json(&self) -> Option<Value> {
        self.len().checked_sub(1).and_then(|i| self.json_at(i))
    }

    /// Decode wire values, rejecting anything that is not of `data_type`.
    ///
    /// `null` is accepted in float columns and stored as NaN. Integral
    /// numbers are accepted in float columns; fractional numbers are
    /// rejected in int columns.
    pub fn from_json(data_type: DataType, values: &[Value]) -> Result<Self, String> {
        let bad = |i: usize, v: &Value| format!("value {} ({}) is not a {}", i, v, data_type);
        match data_type {
            DataType::Float => values
                .iter()
                .enumerate()
                .map(|(i, v)| match v {
                    Value::Null => Ok(f64::NAN),
                    Value::Number(n) => n.as_f64().ok_or_else(|| bad(i, v)),
                    _ => Err(bad(i, v)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(TimeseriesValues::Float),
            DataType::Int => values
                .iter()
                .enumerate()
                .map(|(i, v)| v.as_i64().ok_or_else(|| bad(i, v)))
                .collect::<Result<Vec<_>, _>>()
                .map(TimeseriesValues::Int),
            DataType::Str => values
                .iter()
                .enumerate()
                .map(|(i, v)| v.as_str().map(str::to_string).ok_or_else(|| bad(i, v)))
                .collect::<Result<Vec<_>, _>>()
                .map(TimeseriesValues::Str),
        }
    }
}

/// A labelled range of rows, e.g. one constant-current segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLabel {
    pub label: String,
    /// Half-open `[start, end)` row range.
    pub range: [u64; 2],
    pub info: String,
}

/// An error a harvester reported, or one raised while ingesting its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestError {
    pub id: i64,
    pub harvester_id: i64,
    pub file_id: Option<i64>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Input for [`Store::record_error`](crate::store::Store::record_error).
#[derive(Debug, Clone)]
pub struct NewHarvestError {
    pub harvester_id: i64,
    pub file_id: Option<i64>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}
