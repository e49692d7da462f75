//! The server-side report handler.
//!
//! [`handle_report`] is the single entry point for harvester reports. It
//! validates the report against the harvester and monitored path, drives the
//! [`lifecycle`](crate::lifecycle) state machine and writes through a
//! [`Store`]. Operator actions ([`reimport`], [`file_detail`]) and the
//! harvester configuration endpoint live here too so that every state change
//! flows through one module.
//!
//! # Chunk ingestion
//!
//! An `import: in_progress` chunk is checked completely before anything is
//! written: equal value counts, no duplicate column types, a matching data
//! type for every existing column, every existing column present, and no new
//! column introduced once rows are stored. The validated chunk is then
//! appended with one [`Store::append_chunk`] call. Any failure moves the file
//! to IMPORT_FAILED and records a [`HarvestError`].

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalogue::StandardColumn;
use crate::error::ReportError;
use crate::lifecycle::{self, Transition};
use crate::models::{
    ColumnAppend, ColumnType, DataLabel, DataType, FileState, HarvestError, Harvester,
    MonitoredPath, NewColumnType, NewHarvestError, NewObservedFile, ObservedFile, TimeseriesValues,
};
use crate::store::Store;
use crate::wire::{
    ColumnPayload, CoreMetadata, HarvesterConfig, ImportContent, Report, ReportContent,
    ReportResponse, ReportStatus, TestDate, UploadColumn, UploadInfo,
};

/// Handle one report from `harvester`, observed by the server at `now`.
pub async fn handle_report<S: Store + ?Sized>(
    store: &S,
    harvester: &Harvester,
    report: &Report,
    now: DateTime<Utc>,
) -> Result<ReportResponse, ReportError> {
    let monitored = monitored_path_for(store, harvester, report).await?;

    match report.status {
        ReportStatus::Error => record_reported_error(store, harvester, report, now).await,
        ReportStatus::Success => match &report.content {
            None => Err(ReportError::BadRequest(
                "a success report must carry content".to_string(),
            )),
            Some(ReportContent::FileSize { size }) => {
                observe_file(store, harvester, &monitored, &report.path, *size, now).await
            }
            Some(ReportContent::Import(step)) => {
                let file = store
                    .find_file(harvester.id, &report.path)
                    .await?
                    .ok_or_else(|| {
                        ReportError::NotFound(format!(
                            "'{}' has not been observed by harvester {}",
                            report.path, harvester.id
                        ))
                    })?;
                handle_import(store, harvester, file, step, now).await
            }
        },
    }
}

async fn monitored_path_for<S: Store + ?Sized>(
    store: &S,
    harvester: &Harvester,
    report: &Report,
) -> Result<MonitoredPath, ReportError> {
    let monitored = store
        .get_monitored_path(report.monitored_path_id)
        .await?
        .filter(|p| p.harvester_id == harvester.id)
        .ok_or_else(|| {
            ReportError::NotFound(format!(
                "monitored path {} does not belong to harvester {}",
                report.monitored_path_id, harvester.id
            ))
        })?;
    if !Path::new(&report.path).starts_with(&monitored.path) {
        return Err(ReportError::BadRequest(format!(
            "'{}' is not inside monitored path '{}'",
            report.path, monitored.path
        )));
    }
    Ok(monitored)
}

async fn record_reported_error<S: Store + ?Sized>(
    store: &S,
    harvester: &Harvester,
    report: &Report,
    now: DateTime<Utc>,
) -> Result<ReportResponse, ReportError> {
    let text = match &report.error {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => "unspecified error".to_string(),
    };
    let file = store.find_file(harvester.id, &report.path).await?;

    // The same error for a file whose size has not changed since it was
    // recorded is not stored again.
    if let Some(file) = &file {
        if let Some(latest) = store.latest_error(file.id).await? {
            if latest.error == text && latest.timestamp >= file.last_observed_time {
                log::debug!("{}: error unchanged since {}", report.path, latest.timestamp);
                return Ok(ReportResponse {
                    file: Some(file.clone()),
                    upload_info: None,
                    recorded_error: Some(latest),
                });
            }
        }
    }

    let recorded = store
        .record_error(&NewHarvestError {
            harvester_id: harvester.id,
            file_id: file.as_ref().map(|f| f.id),
            error: text,
            timestamp: now,
        })
        .await?;
    log::warn!(
        "harvester {} reported an error for {}: {}",
        harvester.id,
        report.path,
        recorded.error
    );
    Ok(ReportResponse {
        file,
        upload_info: None,
        recorded_error: Some(recorded),
    })
}

async fn observe_file<S: Store + ?Sized>(
    store: &S,
    harvester: &Harvester,
    monitored: &MonitoredPath,
    path: &str,
    size: u64,
    now: DateTime<Utc>,
) -> Result<ReportResponse, ReportError> {
    let (mut file, created) = store
        .find_or_insert_file(&NewObservedFile {
            harvester_id: harvester.id,
            path: path.to_string(),
            size,
            observed_at: now,
        })
        .await?;

    if created {
        log::info!("new file {} ({} bytes)", path, size);
    } else {
        let (transition, dirty) = lifecycle::observe_size(&mut file, size, now, monitored.stable_time);
        if dirty {
            store.update_file(&file).await?;
        }
        log_transition(&file, transition);
    }

    Ok(ReportResponse {
        file: Some(file),
        ..Default::default()
    })
}

fn log_transition(file: &ObservedFile, transition: Transition) {
    if let Transition::Changed { from, to } = transition {
        log::info!("file {} ({}): {} -> {}", file.id, file.path, from, to);
    }
}

async fn handle_import<S: Store + ?Sized>(
    store: &S,
    harvester: &Harvester,
    mut file: ObservedFile,
    step: &ImportContent,
    now: DateTime<Utc>,
) -> Result<ReportResponse, ReportError> {
    match step {
        ImportContent::Begin {
            test_date,
            core_metadata,
            extra_metadata,
            parser,
        } => {
            let test_date = parse_test_date(test_date.as_ref())?;
            let transition = lifecycle::begin_import(&mut file)?;
            apply_metadata(&mut file, test_date, core_metadata, parser.as_deref());
            file.extra_metadata = Value::Object(extra_metadata.clone());
            store.update_file(&file).await?;
            log_transition(&file, transition);
            // Every upload resends the file's labels from the start.
            store.clear_data_labels(file.id).await?;

            let upload_info = upload_info(store, &file).await?;
            Ok(ReportResponse {
                file: Some(file),
                upload_info: Some(upload_info),
                recorded_error: None,
            })
        }
        ImportContent::InProgress { data, data_labels } => {
            if file.state != FileState::Importing {
                return Err(ReportError::Conflict(format!(
                    "cannot accept data for '{}' while it is {}",
                    file.path, file.state
                )));
            }
            let ingested = async {
                ingest_chunk(store, &file, data).await?;
                if let Some(labels) = data_labels {
                    ingest_labels(store, &file, labels).await?;
                }
                Ok::<(), ReportError>(())
            }
            .await;
            if let Err(err) = ingested {
                return Err(abort_import(store, harvester, file, err, now).await);
            }
            Ok(ReportResponse {
                file: Some(file),
                ..Default::default()
            })
        }
        ImportContent::Complete => {
            if file.state == FileState::Importing {
                if let Err(err) = check_equal_lengths(store, &file).await {
                    return Err(abort_import(store, harvester, file, err, now).await);
                }
            }
            let transition = lifecycle::complete_import(&mut file);
            if transition.changed() {
                store.update_file(&file).await?;
            }
            log_transition(&file, transition);
            Ok(ReportResponse {
                file: Some(file),
                ..Default::default()
            })
        }
        ImportContent::Failed { error } => {
            let transition = lifecycle::fail_import(&mut file);
            store.update_file(&file).await?;
            log_transition(&file, transition);
            let recorded = store
                .record_error(&NewHarvestError {
                    harvester_id: harvester.id,
                    file_id: Some(file.id),
                    error: error.clone().unwrap_or_else(|| "import failed".to_string()),
                    timestamp: now,
                })
                .await?;
            Ok(ReportResponse {
                file: Some(file),
                upload_info: None,
                recorded_error: Some(recorded),
            })
        }
    }
}

fn parse_test_date(date: Option<&TestDate>) -> Result<Option<DateTime<Utc>>, ReportError> {
    match date {
        None => Ok(None),
        Some(date) => date
            .to_datetime()
            .map(Some)
            .ok_or_else(|| ReportError::BadRequest(format!("unreadable test_date {:?}", date))),
    }
}

fn apply_metadata(
    file: &mut ObservedFile,
    test_date: Option<DateTime<Utc>>,
    core: &CoreMetadata,
    parser: Option<&str>,
) {
    file.test_date = test_date.or(file.test_date);
    if let Some(machine) = &core.machine_type {
        file.inferred_format = Some(machine.clone());
    }
    if let Some(name) = &core.dataset_name {
        file.name = Some(name.clone());
    }
    if let Some(parser) = parser {
        file.parser = Some(parser.to_string());
    }
    file.num_rows = core.num_rows;
    file.first_sample_no = core.first_sample_no;
    file.last_sample_no = core.last_sample_no;
}

/// What the store already holds for `file`, so a harvester can resume.
pub async fn upload_info<S: Store + ?Sized>(
    store: &S,
    file: &ObservedFile,
) -> Result<UploadInfo, ReportError> {
    let mut info = UploadInfo::default();
    for column in store.file_columns(file.id).await? {
        let column_type = store
            .get_column_type(column.type_id)
            .await?
            .ok_or_else(|| {
                ReportError::Storage(anyhow::anyhow!(
                    "column {} refers to missing column type {}",
                    column.id,
                    column.type_id
                ))
            })?;
        if let Some(last) = store.last_value(column.id).await? {
            if column_type.name == StandardColumn::SampleNumber.name() {
                info.last_record_number = last.as_i64();
            }
            info.last_record.insert(column_type.name.clone(), last);
        }
        info.columns.push(UploadColumn {
            name: column_type.name,
            id: column_type.id,
        });
    }
    Ok(info)
}

async fn resolve_column_type<S: Store + ?Sized>(
    store: &S,
    payload: &ColumnPayload,
) -> Result<ColumnType, ReportError> {
    if let Some(id) = payload.column_id {
        return store
            .get_column_type(id)
            .await?
            .ok_or_else(|| ReportError::NotFound(format!("column type {} does not exist", id)));
    }

    let name = payload.column_name.as_deref().ok_or_else(|| {
        ReportError::BadRequest("a column without column_id needs a column_name".to_string())
    })?;
    let unit = match (payload.unit_id, payload.unit_symbol.as_deref()) {
        (Some(unit_id), _) => store
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| ReportError::NotFound(format!("unit {} does not exist", unit_id)))?,
        (None, Some(symbol)) => store.lookup_or_insert_unit(symbol, symbol, false).await?,
        (None, None) => {
            return Err(ReportError::BadRequest(format!(
                "column '{}' needs a column_id, unit_id or unit_symbol",
                name
            )))
        }
    };
    Ok(store
        .lookup_or_insert_column_type(&NewColumnType {
            name: name.to_string(),
            unit_id: unit.id,
            is_default: false,
            is_required: false,
        })
        .await?)
}

async fn ingest_chunk<S: Store + ?Sized>(
    store: &S,
    file: &ObservedFile,
    data: &[ColumnPayload],
) -> Result<(), ReportError> {
    let Some(first) = data.first() else {
        return Ok(());
    };
    let rows = first.values.len();
    let existing = store.file_columns(file.id).await?;
    let stored_rows = match existing.first() {
        Some(column) => store.column_length(column.id).await?,
        None => 0,
    };

    let mut seen = HashSet::new();
    let mut appends = Vec::with_capacity(data.len());
    for payload in data {
        let column_type = resolve_column_type(store, payload).await?;
        let name = payload
            .column_name
            .clone()
            .unwrap_or_else(|| column_type.name.clone());
        if payload.values.len() != rows {
            return Err(ReportError::BadRequest(format!(
                "column '{}' has {} values, expected {}",
                name,
                payload.values.len(),
                rows
            )));
        }
        if !seen.insert(column_type.id) {
            return Err(ReportError::BadRequest(format!(
                "column type '{}' appears twice in one chunk",
                column_type.name
            )));
        }
        match existing.iter().find(|c| c.type_id == column_type.id) {
            Some(column) if column.data_type != payload.data_type => {
                return Err(ReportError::TypeMismatch {
                    column: column.name.clone(),
                    stored: column.data_type.to_string(),
                    sent: payload.data_type.to_string(),
                });
            }
            Some(_) => {}
            None if stored_rows > 0 => {
                return Err(ReportError::BadRequest(format!(
                    "column '{}' first sent after {} rows were stored",
                    name, stored_rows
                )));
            }
            None => {}
        }
        let values = TimeseriesValues::from_json(payload.data_type, &payload.values)
            .map_err(|e| ReportError::BadRequest(format!("column '{}': {}", name, e)))?;
        appends.push(ColumnAppend {
            type_id: column_type.id,
            name,
            values,
        });
    }

    if let Some(missing) = existing.iter().find(|c| !seen.contains(&c.type_id)) {
        return Err(ReportError::BadRequest(format!(
            "chunk omits stored column '{}'",
            missing.name
        )));
    }

    store.append_chunk(file.id, &appends).await?;
    log::debug!(
        "file {}: appended {} rows to {} columns",
        file.id,
        rows,
        appends.len()
    );
    Ok(())
}

async fn ingest_labels<S: Store + ?Sized>(
    store: &S,
    file: &ObservedFile,
    labels: &[DataLabel],
) -> Result<(), ReportError> {
    if let Some(bad) = labels.iter().find(|l| l.range[0] > l.range[1]) {
        return Err(ReportError::BadRequest(format!(
            "label '{}' has an inverted range {:?}",
            bad.label, bad.range
        )));
    }
    store.append_data_labels(file.id, labels).await?;
    Ok(())
}

async fn check_equal_lengths<S: Store + ?Sized>(
    store: &S,
    file: &ObservedFile,
) -> Result<(), ReportError> {
    let mut expected = None;
    for column in store.file_columns(file.id).await? {
        let len = store.column_length(column.id).await?;
        match expected {
            None => expected = Some(len),
            Some(n) if n != len => {
                return Err(ReportError::BadRequest(format!(
                    "column '{}' holds {} values but others hold {}",
                    column.name, len, n
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Move `file` to IMPORT_FAILED and record `err` against it.
///
/// Returns `err` wrapped in [`ReportError::ImportFailed`] so the harvester
/// knows the failure is already on record. If the store could not be
/// updated, `err` is returned as is.
async fn abort_import<S: Store + ?Sized>(
    store: &S,
    harvester: &Harvester,
    mut file: ObservedFile,
    err: ReportError,
    now: DateTime<Utc>,
) -> ReportError {
    let transition = lifecycle::fail_import(&mut file);
    if let Err(e) = store.update_file(&file).await {
        log::error!("could not mark file {} as failed: {:#}", file.id, e);
        return err;
    }
    log_transition(&file, transition);
    if let Err(e) = store
        .record_error(&NewHarvestError {
            harvester_id: harvester.id,
            file_id: Some(file.id),
            error: err.to_string(),
            timestamp: now,
        })
        .await
    {
        log::error!("could not record error for file {}: {:#}", file.id, e);
        return err;
    }
    log::warn!("import of {} failed: {}", file.path, err);
    ReportError::ImportFailed(Box::new(err))
}

/// Operator reimport: drop the file's data and force RETRY_IMPORT.
pub async fn reimport<S: Store + ?Sized>(
    store: &S,
    file_id: i64,
) -> Result<ObservedFile, ReportError> {
    let mut file = store
        .get_file(file_id)
        .await?
        .ok_or_else(|| ReportError::NotFound(format!("file {} does not exist", file_id)))?;
    store.clear_file_data(file.id).await?;
    let transition = lifecycle::force_retry(&mut file);
    store.update_file(&file).await?;
    log_transition(&file, transition);
    Ok(file)
}

/// Configuration served to a harvester before each cycle.
pub async fn harvester_config<S: Store + ?Sized>(
    store: &S,
    harvester: &Harvester,
    sleep_time: u64,
    max_upload_bytes: usize,
) -> Result<HarvesterConfig, ReportError> {
    let monitored_paths = store
        .list_monitored_paths(Some(harvester.id))
        .await?
        .into_iter()
        .filter(|p| p.active)
        .collect();
    let standard_units = store
        .list_units()
        .await?
        .into_iter()
        .filter(|u| u.is_default)
        .collect();
    let standard_columns = store
        .list_column_types()
        .await?
        .into_iter()
        .filter(|c| c.is_default)
        .collect();
    Ok(HarvesterConfig {
        harvester_id: harvester.id,
        name: harvester.name.clone(),
        sleep_time,
        max_upload_bytes,
        monitored_paths,
        standard_units,
        standard_columns,
    })
}

/// One column of a file as shown on its detail view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    pub type_name: String,
    pub type_id: i64,
    pub data_type: DataType,
    pub length: usize,
}

/// Everything an operator sees about one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDetail {
    pub file: ObservedFile,
    pub columns: Vec<ColumnSummary>,
    pub data_labels: Vec<DataLabel>,
    pub last_error: Option<HarvestError>,
}

pub async fn file_detail<S: Store + ?Sized>(
    store: &S,
    file_id: i64,
) -> Result<FileDetail, ReportError> {
    let file = store
        .get_file(file_id)
        .await?
        .ok_or_else(|| ReportError::NotFound(format!("file {} does not exist", file_id)))?;
    let mut columns = Vec::new();
    for column in store.file_columns(file.id).await? {
        let type_name = store
            .get_column_type(column.type_id)
            .await?
            .map(|t| t.display_name().to_string())
            .unwrap_or_default();
        columns.push(ColumnSummary {
            length: store.column_length(column.id).await?,
            name: column.name,
            type_name,
            type_id: column.type_id,
            data_type: column.data_type,
        });
    }
    Ok(FileDetail {
        data_labels: store.data_labels(file.id).await?,
        last_error: store.latest_error(file.id).await?,
        columns,
        file,
    })
}
