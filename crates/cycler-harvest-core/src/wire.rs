//! JSON wire types exchanged between harvesters and the server.
//!
//! A harvester sends every observation and upload step as a [`Report`] to
//! `POST /harvesters/{id}/report` and receives a [`ReportResponse`]:
//!
//! ```json
//! { "path": "/data/cell_01.mpr", "monitored_path_id": 3,
//!   "status": "success",
//!   "content": { "task": "file_size", "size": 20480 } }
//! ```
//!
//! Import steps nest a second tag inside `content`:
//! `{ "task": "import", "status": "begin" | "in_progress" | "complete" | "failed", ... }`.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{ColumnType, DataLabel, DataType, DataUnit, HarvestError, MonitoredPath, ObservedFile};

/// Top-level outcome flag of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// One message from a harvester about one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub path: String,
    pub monitored_path_id: i64,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ReportContent>,
}

impl Report {
    pub fn success(path: impl Into<String>, monitored_path_id: i64, content: ReportContent) -> Self {
        Self {
            path: path.into(),
            monitored_path_id,
            status: ReportStatus::Success,
            error: None,
            content: Some(content),
        }
    }

    pub fn file_size(path: impl Into<String>, monitored_path_id: i64, size: u64) -> Self {
        Self::success(path, monitored_path_id, ReportContent::FileSize { size })
    }

    pub fn import(path: impl Into<String>, monitored_path_id: i64, content: ImportContent) -> Self {
        Self::success(path, monitored_path_id, ReportContent::Import(content))
    }

    pub fn error(path: impl Into<String>, monitored_path_id: i64, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            monitored_path_id,
            status: ReportStatus::Error,
            error: Some(Value::String(error.into())),
            content: None,
        }
    }
}

/// The task a successful report carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ReportContent {
    FileSize { size: u64 },
    Import(ImportContent),
}

/// One step of the import protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImportContent {
    Begin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        test_date: Option<TestDate>,
        #[serde(default)]
        core_metadata: CoreMetadata,
        #[serde(default)]
        extra_metadata: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parser: Option<String>,
    },
    InProgress {
        #[serde(default)]
        data: Vec<ColumnPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_labels: Option<Vec<DataLabel>>,
    },
    Complete,
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Test start date, sent either as epoch seconds or as an ISO 8601 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestDate {
    Epoch(f64),
    Iso(String),
}

impl TestDate {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            TestDate::Epoch(secs) => {
                let millis = (secs * 1000.0).round() as i64;
                Utc.timestamp_millis_opt(millis).single()
            }
            TestDate::Iso(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
                        .ok()
                        .map(|naive| naive.and_utc())
                }),
        }
    }
}

impl From<DateTime<Utc>> for TestDate {
    fn from(dt: DateTime<Utc>) -> Self {
        TestDate::Iso(dt.to_rfc3339())
    }
}

/// Metadata every reader can declare about a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreMetadata {
    #[serde(rename = "Machine Type", default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(rename = "Dataset Name", default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_rows: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_sample_no: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample_no: Option<i64>,
}

/// Values for one column in an `in_progress` chunk.
///
/// The column is identified either by a known column type (`column_id`) or
/// by a unit (`unit_id` or `unit_symbol`) plus `column_name`, in which case
/// the server creates the column type on first sight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    pub data_type: DataType,
    pub values: Vec<Value>,
}

/// A column already stored for a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadColumn {
    pub name: String,
    /// Column type id.
    pub id: i64,
}

/// What the server already holds for a file; returned on `import: begin`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub columns: Vec<UploadColumn>,
    pub last_record_number: Option<i64>,
    /// Last stored value of every column, keyed by column type name.
    #[serde(default)]
    pub last_record: BTreeMap<String, Value>,
}

/// Server answer to a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<ObservedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_info: Option<UploadInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_error: Option<HarvestError>,
}

/// Configuration a harvester fetches before every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvesterConfig {
    pub harvester_id: i64,
    pub name: String,
    /// Seconds to sleep between cycles.
    pub sleep_time: u64,
    pub max_upload_bytes: usize,
    pub monitored_paths: Vec<MonitoredPath>,
    pub standard_units: Vec<DataUnit>,
    pub standard_columns: Vec<ColumnType>,
}

impl HarvesterConfig {
    /// Server id of the standard column type called `name`.
    pub fn column_type_id(&self, name: &str) -> Option<i64> {
        self.standard_columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    pub fn unit(&self, id: i64) -> Option<&DataUnit> {
        self.standard_units.iter().find(|u| u.id == id)
    }
}

/// Body of `POST /harvesters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
}

/// Answer to `POST /harvesters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: i64,
    pub name: String,
    pub api_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_size_report_shape() {
        let report = Report::file_size("/data/a.csv", 3, 100);
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "path": "/data/a.csv",
                "monitored_path_id": 3,
                "status": "success",
                "content": { "task": "file_size", "size": 100 }
            })
        );
    }

    #[test]
    fn test_nested_import_status_parses() {
        let report: Report = serde_json::from_value(json!({
            "path": "/data/a.csv",
            "monitored_path_id": 1,
            "status": "success",
            "content": { "task": "import", "status": "complete" }
        }))
        .unwrap();
        assert_eq!(
            report.content,
            Some(ReportContent::Import(ImportContent::Complete))
        );

        let begin: Report = serde_json::from_value(json!({
            "path": "/data/a.csv",
            "monitored_path_id": 1,
            "status": "success",
            "content": {
                "task": "import",
                "status": "begin",
                "test_date": 1700000000,
                "core_metadata": { "Machine Type": "Maccor", "num_rows": 12 },
                "extra_metadata": { "Procedure": "cc_cv" }
            }
        }))
        .unwrap();
        match begin.content {
            Some(ReportContent::Import(ImportContent::Begin {
                test_date,
                core_metadata,
                extra_metadata,
                ..
            })) => {
                assert_eq!(core_metadata.machine_type.as_deref(), Some("Maccor"));
                assert_eq!(core_metadata.num_rows, Some(12));
                assert_eq!(extra_metadata["Procedure"], json!("cc_cv"));
                assert_eq!(
                    test_date.unwrap().to_datetime().unwrap().timestamp(),
                    1_700_000_000
                );
            }
            other => panic!("expected begin, got {:?}", other),
        }
    }

    #[test]
    fn test_error_report_has_no_content() {
        let value = serde_json::to_value(Report::error("/x", 1, "unsupported format")).unwrap();
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["error"], json!("unsupported format"));
        assert!(value.get("content").is_none());
    }

    #[test]
    fn test_iso_test_date() {
        let date = TestDate::Iso("2024-03-01T12:00:00Z".into());
        assert_eq!(date.to_datetime().unwrap().to_rfc3339(), "2024-03-01T12:00:00+00:00");
        let naive = TestDate::Iso("2024-03-01T12:00:00".into());
        assert!(naive.to_datetime().is_some());
        assert!(TestDate::Iso("yesterday".into()).to_datetime().is_none());
    }
}
