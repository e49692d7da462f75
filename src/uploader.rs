//! Chunked upload of one file's rows.
//!
//! Rows flow reader → [`RowCompleter`] → [`ChunkBuilder`]; every batch the
//! builder flushes is sent and acknowledged before the next row is read, so
//! the server never holds more than one unacknowledged chunk per file.
//! Data labels follow in `in_progress` reports without column data, split
//! under the same size limit.

use anyhow::{Context, Result};

use cycler_harvest_core::chunk::{label_reports, ChunkBuilder};
use cycler_harvest_core::wire::{Report, UploadInfo};

use crate::client::ReportSink;
use crate::completion::RowCompleter;
use crate::readers::FormatReader;
use crate::resolver::UploadPlan;

/// What one upload pass sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub rows_sent: usize,
    pub rows_skipped: usize,
    pub chunks: usize,
    pub labels: usize,
}

/// Where the rows go: the file's reported path and its monitored path.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    pub path: &'a str,
    pub monitored_path_id: i64,
    pub max_bytes: usize,
}

pub async fn upload_file<S: ReportSink + ?Sized>(
    sink: &S,
    reader: &dyn FormatReader,
    plan: &UploadPlan,
    stored: &UploadInfo,
    target: UploadTarget<'_>,
) -> Result<UploadSummary> {
    let mut builder = ChunkBuilder::new(
        target.path,
        target.monitored_path_id,
        plan.headers(),
        target.max_bytes,
    )?;
    let mut completer = RowCompleter::new(plan, stored);
    let mut summary = UploadSummary::default();

    for (index, row) in reader.rows()?.enumerate() {
        let row = row?;
        let Some(values) = completer.complete(index, &row)? else {
            summary.rows_skipped += 1;
            continue;
        };
        if let Some(report) = builder.push_row(values)? {
            send_chunk(sink, &report, &mut summary).await?;
        }
    }
    summary.rows_sent = builder.rows_flushed() + builder.pending_rows();
    if let Some(report) = builder.finish() {
        send_chunk(sink, &report, &mut summary).await?;
    }

    let labels = reader.data_labels()?;
    summary.labels = labels.len();
    for report in label_reports(target.path, target.monitored_path_id, labels, target.max_bytes)? {
        sink.send(&report).await.context("sending data labels")?;
    }

    log::info!(
        "{}: sent {} rows in {} chunks ({} already stored), {} labels",
        target.path,
        summary.rows_sent,
        summary.chunks,
        summary.rows_skipped,
        summary.labels
    );
    Ok(summary)
}

async fn send_chunk<S: ReportSink + ?Sized>(
    sink: &S,
    report: &Report,
    summary: &mut UploadSummary,
) -> Result<()> {
    sink.send(report)
        .await
        .with_context(|| format!("sending chunk {}", summary.chunks + 1))?;
    summary.chunks += 1;
    log::debug!("{}: chunk {} acknowledged", report.path, summary.chunks);
    Ok(())
}
