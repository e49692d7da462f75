//! The harvester's observation loop.
//!
//! Every cycle the harvester re-reads its settings file, fetches its
//! configuration from the server and then works in two phases:
//!
//! 1. **Observe**: scan every monitored path and report each file's size.
//!    The server answers with the file's state.
//! 2. **Import**: every file the server reported as `STABLE` or
//!    `RETRY_IMPORT` is parsed and uploaded.
//!
//! Failures stay per file: an unreadable directory, an unsupported format
//! or a failed import is logged and reported, and the cycle moves on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use cycler_harvest_core::models::{FileState, MonitoredPath};
use cycler_harvest_core::wire::{HarvesterConfig, ImportContent, Report, TestDate};

use crate::client::{ReportSink, ServerClient, ServerRejection};
use crate::config::HarvesterSettings;
use crate::readers::{load_metadata, open_reader, UnsupportedFormat};
use crate::resolver::resolve;
use crate::scanner::scan_monitored_path;
use crate::uploader::{upload_file, UploadSummary, UploadTarget};

/// How one import attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(UploadSummary),
    /// No reader accepts the file; reported as an error.
    Unsupported,
    /// The server would not begin an import (the file changed state).
    Skipped,
    /// The import failed and was reported as `import: failed`.
    Failed(String),
}

/// Counts for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub observed: usize,
    pub imported: usize,
    pub unsupported: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Run cycles until the process is stopped.
pub async fn run_forever(settings_path: &Path) -> Result<()> {
    loop {
        let sleep = match run_once(settings_path).await {
            Ok((summary, sleep_time)) => {
                log::info!(
                    "cycle done: {} observed, {} imported, {} failed, {} unsupported",
                    summary.observed,
                    summary.imported,
                    summary.failed,
                    summary.unsupported
                );
                sleep_time
            }
            Err(e) => {
                log::error!("cycle failed: {:#}", e);
                HarvesterSettings::load(settings_path)
                    .map(|s| s.retry_delay_secs)
                    .unwrap_or(10)
            }
        };
        tokio::time::sleep(Duration::from_secs(sleep.max(1))).await;
    }
}

/// One cycle with freshly loaded settings. Returns the server's sleep time.
pub async fn run_once(settings_path: &Path) -> Result<(CycleSummary, u64)> {
    let settings = HarvesterSettings::load(settings_path)?;
    let client = ServerClient::new(&settings)?;
    let config = client
        .fetch_config()
        .await
        .context("Failed to fetch harvester configuration")?;
    let summary = run_cycle(&client, &config).await?;
    Ok((summary, config.sleep_time))
}

pub async fn run_cycle<S: ReportSink + ?Sized>(
    sink: &S,
    config: &HarvesterConfig,
) -> Result<CycleSummary> {
    let mut summary = CycleSummary::default();
    let mut queue: Vec<(i64, PathBuf)> = Vec::new();

    for monitored in &config.monitored_paths {
        for (path, state) in observe_path(sink, monitored).await {
            summary.observed += 1;
            if state.wants_import() {
                queue.push((monitored.id, path));
            }
        }
    }

    for (monitored_path_id, path) in queue {
        match import_file(sink, config, monitored_path_id, &path).await {
            Ok(ImportOutcome::Imported(_)) => summary.imported += 1,
            Ok(ImportOutcome::Unsupported) => summary.unsupported += 1,
            Ok(ImportOutcome::Skipped) => summary.skipped += 1,
            Ok(ImportOutcome::Failed(_)) => summary.failed += 1,
            Err(e) => {
                log::error!("{}: {:#}", path.display(), e);
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Report the size of every file under `monitored`; returns each file's state.
async fn observe_path<S: ReportSink + ?Sized>(
    sink: &S,
    monitored: &MonitoredPath,
) -> Vec<(PathBuf, FileState)> {
    let files = match scan_monitored_path(monitored) {
        Ok(files) => files,
        Err(e) => {
            log::warn!("cannot scan {}: {:#}", monitored.path, e);
            return Vec::new();
        }
    };

    let mut states = Vec::with_capacity(files.len());
    for file in files {
        let path_str = file.path.to_string_lossy().to_string();
        let report = Report::file_size(&path_str, monitored.id, file.size);
        match sink.send(&report).await {
            Ok(response) => {
                if let Some(observed) = response.file {
                    log::debug!("{}: {} ({} bytes)", path_str, observed.state, file.size);
                    states.push((file.path, observed.state));
                }
            }
            Err(e) => log::warn!("size report for {} failed: {:#}", path_str, e),
        }
    }
    states
}

/// Parse and upload one file.
///
/// Only transport failures of the final `failed` report are returned as
/// errors; everything else ends in an [`ImportOutcome`].
pub async fn import_file<S: ReportSink + ?Sized>(
    sink: &S,
    config: &HarvesterConfig,
    monitored_path_id: i64,
    path: &Path,
) -> Result<ImportOutcome> {
    let path_str = path.to_string_lossy().to_string();

    let reader = match open_reader(path) {
        Ok(reader) => reader,
        Err(e) if e.downcast_ref::<UnsupportedFormat>().is_some() => {
            log::warn!("{}", e);
            sink.send(&Report::error(&path_str, monitored_path_id, e.to_string()))
                .await?;
            return Ok(ImportOutcome::Unsupported);
        }
        Err(e) => return fail(sink, &path_str, monitored_path_id, e).await,
    };

    let metadata = match load_metadata(reader.as_ref()) {
        Ok(metadata) => metadata,
        Err(e) => return fail(sink, &path_str, monitored_path_id, e).await,
    };

    let begin = Report::import(
        &path_str,
        monitored_path_id,
        ImportContent::Begin {
            test_date: metadata.test_date.map(TestDate::from),
            core_metadata: metadata.core.clone(),
            extra_metadata: metadata.extra.clone(),
            parser: Some(metadata.parser.clone()),
        },
    );
    let stored = match sink.send(&begin).await {
        Ok(response) => response.upload_info.unwrap_or_default(),
        Err(e) if is_conflict(&e) => {
            log::info!("{}: import not started: {:#}", path_str, e);
            return Ok(ImportOutcome::Skipped);
        }
        Err(e) => return fail(sink, &path_str, monitored_path_id, e).await,
    };
    if let Some(last) = stored.last_record_number {
        log::info!("{}: resuming after sample {}", path_str, last);
    }

    let uploaded = async {
        let plan = resolve(&metadata, &reader.standard_mapping(), config, &stored)?;
        let target = UploadTarget {
            path: &path_str,
            monitored_path_id,
            max_bytes: config.max_upload_bytes,
        };
        let summary = upload_file(sink, reader.as_ref(), &plan, &stored, target).await?;
        sink.send(&Report::import(&path_str, monitored_path_id, ImportContent::Complete))
            .await
            .context("completing import")?;
        Ok::<UploadSummary, anyhow::Error>(summary)
    }
    .await;

    match uploaded {
        Ok(summary) => Ok(ImportOutcome::Imported(summary)),
        Err(e) if is_recorded_failure(&e) => {
            // The server has already marked the file failed and recorded why.
            log::warn!("{}: server rejected upload: {:#}", path_str, e);
            Ok(ImportOutcome::Failed(format!("{:#}", e)))
        }
        Err(e) => fail(sink, &path_str, monitored_path_id, e).await,
    }
}

async fn fail<S: ReportSink + ?Sized>(
    sink: &S,
    path: &str,
    monitored_path_id: i64,
    err: anyhow::Error,
) -> Result<ImportOutcome> {
    let message = format!("{:#}", err);
    log::warn!("import of {} failed: {}", path, message);
    sink.send(&Report::import(
        path,
        monitored_path_id,
        ImportContent::Failed {
            error: Some(message.clone()),
        },
    ))
    .await
    .with_context(|| format!("reporting failed import of {}", path))?;
    Ok(ImportOutcome::Failed(message))
}

fn rejection(err: &anyhow::Error) -> Option<&ServerRejection> {
    err.chain().find_map(|e| e.downcast_ref::<ServerRejection>())
}

fn is_conflict(err: &anyhow::Error) -> bool {
    rejection(err).is_some_and(|r| r.status == 409)
}

/// The server answered `import_failed`: the file is already IMPORT_FAILED
/// with the error recorded.
fn is_recorded_failure(err: &anyhow::Error) -> bool {
    rejection(err).is_some_and(|r| r.code == "import_failed")
}

/// Register with the server and write the settings file.
pub async fn setup(server_url: &str, name: &str, settings_path: &Path) -> Result<HarvesterSettings> {
    // Keep transport options from an earlier setup, if any.
    let mut settings = match HarvesterSettings::load(settings_path) {
        Ok(previous) => HarvesterSettings {
            server_url: server_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            ..previous
        },
        Err(_) => HarvesterSettings::unregistered(server_url, name),
    };

    let registered = ServerClient::register(
        &settings.server_url,
        name,
        settings.registration_retries,
        Duration::from_secs(settings.retry_delay_secs),
        Duration::from_secs(settings.timeout_secs),
    )
    .await
    .with_context(|| format!("Failed to register with {}", settings.server_url))?;

    settings.harvester_id = registered.id;
    settings.name = registered.name;
    settings.api_key = registered.api_key;
    settings.save(settings_path)?;
    log::info!(
        "registered as harvester {} ({}), settings written to {}",
        settings.harvester_id,
        settings.name,
        settings_path.display()
    );
    Ok(settings)
}
