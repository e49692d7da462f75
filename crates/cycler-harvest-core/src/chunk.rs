//! Size-bounded batching of rows into `import: in_progress` reports.
//!
//! A [`ChunkBuilder`] accumulates per-column value lists and tracks the exact
//! serialized size of the report it would produce. Before a row is added it
//! checks whether the row still fits under `max_bytes`; if not, the current
//! batch is handed back as a finished [`Report`] and the row starts a new one.
//!
//! # Size accounting
//!
//! The report serialized with every column's `values` empty is measured once
//! (the *envelope*). Compact JSON renders an array as `[v1,v2,…]`, so each
//! value adds its own serialized length plus one comma when it is not the
//! first in its column. The running total therefore equals
//! `serde_json::to_vec(&report).len()` at every step without re-serializing.
//!
//! Data labels are batched the same way by [`label_reports`]: each report
//! carries an empty `data` list and as many labels as fit.
//!
//! # Example
//!
//! ```rust
//! use cycler_harvest_core::chunk::ChunkBuilder;
//! use cycler_harvest_core::models::DataType;
//! use cycler_harvest_core::wire::ColumnPayload;
//! use serde_json::json;
//!
//! let header = ColumnPayload {
//!     column_id: Some(1),
//!     unit_id: None,
//!     unit_symbol: None,
//!     column_name: None,
//!     data_type: DataType::Int,
//!     values: vec![],
//! };
//! let mut builder = ChunkBuilder::new("/data/a.csv", 1, vec![header], 4096).unwrap();
//! assert!(builder.push_row(vec![json!(1)]).unwrap().is_none());
//! let last = builder.finish().unwrap();
//! assert!(serde_json::to_vec(&last).unwrap().len() <= 4096);
//! ```

use anyhow::{bail, Result};
use serde_json::Value;

use crate::models::DataLabel;
use crate::wire::{ColumnPayload, ImportContent, Report};

/// Accumulates rows into reports no larger than `max_bytes` when serialized.
#[derive(Debug)]
pub struct ChunkBuilder {
    path: String,
    monitored_path_id: i64,
    max_bytes: usize,
    headers: Vec<ColumnPayload>,
    values: Vec<Vec<Value>>,
    envelope_bytes: usize,
    used_bytes: usize,
    rows: usize,
    rows_flushed: usize,
}

impl ChunkBuilder {
    /// Create a builder for one file. `headers` carry column identity and
    /// type; their `values` are ignored.
    ///
    /// Fails if an empty chunk for these columns already exceeds `max_bytes`.
    pub fn new(
        path: impl Into<String>,
        monitored_path_id: i64,
        headers: Vec<ColumnPayload>,
        max_bytes: usize,
    ) -> Result<Self> {
        let path = path.into();
        let headers: Vec<ColumnPayload> = headers
            .into_iter()
            .map(|mut h| {
                h.values.clear();
                h
            })
            .collect();
        let envelope = Report::import(
            path.clone(),
            monitored_path_id,
            ImportContent::InProgress {
                data: headers.clone(),
                data_labels: None,
            },
        );
        let envelope_bytes = serde_json::to_vec(&envelope)?.len();
        if envelope_bytes > max_bytes {
            bail!(
                "an empty chunk for {} columns is {} bytes, above the {} byte upload limit",
                headers.len(),
                envelope_bytes,
                max_bytes
            );
        }
        let values = vec![Vec::new(); headers.len()];
        Ok(Self {
            path,
            monitored_path_id,
            max_bytes,
            headers,
            values,
            envelope_bytes,
            used_bytes: envelope_bytes,
            rows: 0,
            rows_flushed: 0,
        })
    }

    /// Rows in the current, unflushed batch.
    pub fn pending_rows(&self) -> usize {
        self.rows
    }

    /// Rows handed out in finished reports so far.
    pub fn rows_flushed(&self) -> usize {
        self.rows_flushed
    }

    /// Serialized size of the current batch.
    pub fn current_bytes(&self) -> usize {
        self.used_bytes
    }

    fn row_cost(&self, row: &[Value]) -> Result<usize> {
        let mut cost = 0;
        for (column, value) in self.values.iter().zip(row) {
            cost += serde_json::to_string(value)?.len();
            if !column.is_empty() {
                cost += 1;
            }
        }
        Ok(cost)
    }

    /// Add one row (one value per header, in header order).
    ///
    /// Returns the finished report for the previous batch when this row did
    /// not fit. A row that does not fit even into an empty batch is an error.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<Option<Report>> {
        if row.len() != self.headers.len() {
            bail!(
                "row has {} values but the chunk has {} columns",
                row.len(),
                self.headers.len()
            );
        }

        let mut flushed = None;
        let mut cost = self.row_cost(&row)?;
        if self.used_bytes + cost > self.max_bytes {
            if self.rows == 0 {
                bail!(
                    "row {} alone serializes to {} bytes, above the {} byte upload limit",
                    self.rows_flushed + 1,
                    self.envelope_bytes + cost,
                    self.max_bytes
                );
            }
            flushed = self.take_report();
            cost = self.row_cost(&row)?;
            if self.used_bytes + cost > self.max_bytes {
                bail!(
                    "row {} alone serializes to {} bytes, above the {} byte upload limit",
                    self.rows_flushed + 1,
                    self.envelope_bytes + cost,
                    self.max_bytes
                );
            }
        }

        for (column, value) in self.values.iter_mut().zip(row) {
            column.push(value);
        }
        self.used_bytes += cost;
        self.rows += 1;
        Ok(flushed)
    }

    fn take_report(&mut self) -> Option<Report> {
        if self.rows == 0 {
            return None;
        }
        let data = self
            .headers
            .iter()
            .zip(self.values.iter_mut())
            .map(|(header, values)| ColumnPayload {
                values: std::mem::take(values),
                ..header.clone()
            })
            .collect();
        self.rows_flushed += self.rows;
        self.rows = 0;
        self.used_bytes = self.envelope_bytes;
        Some(Report::import(
            self.path.clone(),
            self.monitored_path_id,
            ImportContent::InProgress {
                data,
                data_labels: None,
            },
        ))
    }

    /// Hand out whatever is left as a final report.
    pub fn finish(mut self) -> Option<Report> {
        self.take_report()
    }
}

/// Split `labels` into `in_progress` reports no larger than `max_bytes`.
///
/// Labels keep their order. A label that does not fit into an otherwise
/// empty report is an error.
pub fn label_reports(
    path: &str,
    monitored_path_id: i64,
    labels: Vec<DataLabel>,
    max_bytes: usize,
) -> Result<Vec<Report>> {
    let report = |batch: Vec<DataLabel>| {
        Report::import(
            path,
            monitored_path_id,
            ImportContent::InProgress {
                data: Vec::new(),
                data_labels: Some(batch),
            },
        )
    };
    let envelope_bytes = serde_json::to_vec(&report(Vec::new()))?.len();

    let mut reports = Vec::new();
    let mut batch: Vec<DataLabel> = Vec::new();
    let mut used = envelope_bytes;
    for label in labels {
        let size = serde_json::to_vec(&label)?.len();
        if envelope_bytes + size > max_bytes {
            bail!(
                "label '{}' alone serializes to {} bytes, above the {} byte upload limit",
                label.label,
                envelope_bytes + size,
                max_bytes
            );
        }
        let comma = usize::from(!batch.is_empty());
        if used + comma + size > max_bytes {
            reports.push(report(std::mem::take(&mut batch)));
            used = envelope_bytes;
        }
        used += size + usize::from(!batch.is_empty());
        batch.push(label);
    }
    if !batch.is_empty() {
        reports.push(report(batch));
    }
    Ok(reports)
}
