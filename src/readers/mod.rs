//! Cycler file readers.
//!
//! Every supported instrument format implements [`FormatReader`]. A reader
//! is opened once per import attempt and exposes the file's native columns,
//! its metadata and a row iterator that always starts from the first row.
//! Readers never write anything; the resolver and completion steps turn
//! their rows into upload values.
//!
//! # Format detection
//!
//! [`open_reader`] reads the first bytes of a file and offers them to each
//! registered [`ReaderKind`] in turn:
//!
//! | Reader | Sniff | Typical extension |
//! |--------|-------|-------------------|
//! | `biologic_mpr` | `BIO-LOGIC MODULAR FILE` magic | `.mpr` |
//! | `maccor_txt` | `Today's Date` preamble | `.txt`, `.0xx` |
//! | `ivium_idf` | `QR=QR` signature line | `.idf` |
//! | `delimited` | printable text with a delimiter | `.csv`, `.tsv` |
//!
//! The first reader whose sniff accepts the header and whose constructor
//! succeeds wins. When none accepts the file the error is
//! [`UnsupportedFormat`], which the harvester reports instead of failing an
//! import.

pub mod biologic;
pub mod delimited;
pub mod ivium;
pub mod maccor;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use cycler_harvest_core::catalogue::StandardColumn;
use cycler_harvest_core::models::DataLabel;
use cycler_harvest_core::wire::CoreMetadata;

/// Bytes handed to each sniff function.
const SNIFF_BYTES: usize = 4096;

/// A single cell read from a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Parse a text cell: integers, then floats, then plain strings.
    pub fn parse(text: &str) -> Scalar {
        let text = text.trim();
        if text.is_empty() {
            return Scalar::Null;
        }
        if let Ok(value) = text.parse::<i64>() {
            return Scalar::Int(value);
        }
        match text.parse::<f64>() {
            Ok(value) => Scalar::Float(value),
            Err(_) => Scalar::Str(text.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, accepting floats that hold a whole number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            Scalar::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_))
    }

    /// Whether the cell carries information: not null, zero, empty or NaN.
    pub fn has_data(&self) -> bool {
        match self {
            Scalar::Null => false,
            Scalar::Int(v) => *v != 0,
            Scalar::Float(v) => *v != 0.0 && !v.is_nan(),
            Scalar::Str(s) => !s.is_empty(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Int(v) => Value::from(*v),
            Scalar::Float(v) => Value::from(*v),
            Scalar::Str(s) => Value::String(s.clone()),
        }
    }
}

/// One row, aligned with [`FormatReader::columns`].
pub type Row = Vec<Scalar>;

pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row>> + 'a>;

/// A column as the instrument names it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NativeColumn {
    pub name: String,
    pub unit: Option<String>,
}

impl NativeColumn {
    pub fn new(name: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            name: name.into(),
            unit: unit.map(str::to_string),
        }
    }

    /// Split a header such as `Voltage (V)`, `Ewe/V` or `Temp [°C]`.
    pub fn from_header(header: &str) -> Self {
        let (name, unit) = split_unit(header);
        Self {
            name: header.trim().to_string(),
            unit: unit.map(str::to_string).filter(|_| !name.is_empty()),
        }
    }
}

/// Unit embedded in a header, as `(base name, unit)`.
pub fn split_unit(header: &str) -> (&str, Option<&str>) {
    let header = header.trim();
    for (open, close) in [('(', ')'), ('[', ']')] {
        if let Some(stripped) = header.strip_suffix(close) {
            if let Some(start) = stripped.rfind(open) {
                let unit = stripped[start + 1..].trim();
                if !unit.is_empty() {
                    return (stripped[..start].trim(), Some(unit));
                }
            }
        }
    }
    if let Some((name, unit)) = header.rsplit_once('/') {
        let unit = unit.trim();
        if !name.trim().is_empty() && !unit.is_empty() && !unit.contains(' ') {
            return (name.trim(), Some(unit));
        }
    }
    (header, None)
}

/// A readable cycler file.
pub trait FormatReader: Send {
    /// Parser identifier recorded on the file.
    fn parser(&self) -> &'static str;

    /// Instrument family, sent as `Machine Type`.
    fn machine_type(&self) -> &'static str;

    fn columns(&self) -> &[NativeColumn];

    fn test_date(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn dataset_name(&self) -> Option<String> {
        None
    }

    fn extra_metadata(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Iterate all rows from the beginning of the file.
    fn rows(&self) -> Result<RowIter<'_>>;

    /// Native column index for each standard column this file provides.
    fn standard_mapping(&self) -> Vec<(usize, StandardColumn)> {
        keyword_mapping(self.columns())
    }

    /// Segment labels over row ranges. Most formats have none.
    fn data_labels(&self) -> Result<Vec<DataLabel>> {
        Ok(Vec::new())
    }
}

/// No registered reader accepts the file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported file format: {}", .0.display())]
pub struct UnsupportedFormat(pub PathBuf);

/// A registered reader: a cheap sniff plus a constructor that may fail.
pub struct ReaderKind {
    pub name: &'static str,
    pub sniff: fn(&Path, &[u8]) -> bool,
    pub open: fn(&Path) -> Result<Box<dyn FormatReader>>,
}

/// Readers in the order they are tried.
pub const READERS: &[ReaderKind] = &[
    ReaderKind {
        name: biologic::PARSER,
        sniff: biologic::sniff,
        open: biologic::open,
    },
    ReaderKind {
        name: maccor::PARSER,
        sniff: maccor::sniff,
        open: maccor::open,
    },
    ReaderKind {
        name: ivium::PARSER,
        sniff: ivium::sniff,
        open: ivium::open,
    },
    ReaderKind {
        name: delimited::PARSER,
        sniff: delimited::sniff,
        open: delimited::open,
    },
];

/// Open `path` with the first reader that accepts it.
///
/// A reader whose sniff matched but whose constructor failed does not stop
/// the search. If no reader succeeds, the first constructor error is
/// returned; if no sniff matched at all the error is [`UnsupportedFormat`].
pub fn open_reader(path: &Path) -> Result<Box<dyn FormatReader>> {
    let header = read_header(path)?;
    let mut first_failure: Option<anyhow::Error> = None;

    for kind in READERS {
        if !(kind.sniff)(path, &header) {
            continue;
        }
        match (kind.open)(path) {
            Ok(reader) => {
                log::debug!("{} opened with {}", path.display(), kind.name);
                return Ok(reader);
            }
            Err(e) => {
                log::debug!("{} rejected {}: {:#}", kind.name, path.display(), e);
                if first_failure.is_none() {
                    first_failure = Some(e.context(format!("{} reader", kind.name)));
                }
            }
        }
    }

    Err(first_failure.unwrap_or_else(|| UnsupportedFormat(path.to_path_buf()).into()))
}

fn read_header(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut header = Vec::with_capacity(SNIFF_BYTES);
    file.take(SNIFF_BYTES as u64).read_to_end(&mut header)?;
    Ok(header)
}

// ============ Native name mapping ============

/// Base names (unit stripped, case-insensitive) for each standard column.
const KEYWORDS: &[(StandardColumn, &[&str])] = &[
    (
        StandardColumn::SampleNumber,
        &["sample_number", "sample number", "rec#", "record", "data_point", "index"],
    ),
    (
        StandardColumn::ElapsedTime,
        &["elapsed_time_s", "time", "test_time", "testtime", "test time", "elapsed time", "total time"],
    ),
    (
        StandardColumn::Volts,
        &["volts", "voltage", "ewe", "e", "potential", "u"],
    ),
    (
        StandardColumn::Amps,
        &["amps", "current", "i", "<i>"],
    ),
    (
        StandardColumn::ChargeCapacity,
        &["charge_capacity", "capacity", "amp-hr", "(q-qo)", "q charge/discharge"],
    ),
    (
        StandardColumn::EnergyCapacity,
        &["energy_capacity", "energy", "watt-hr", "|energy|"],
    ),
    (
        StandardColumn::Temperature,
        &["temperature", "temp", "temp 1", "aux_temperature"],
    ),
    (StandardColumn::Power, &["power", "p", "watts"]),
    (
        StandardColumn::StepNumber,
        &["step_number", "step", "step index", "ns"],
    ),
    (
        StandardColumn::CycleNumber,
        &["cycle_number", "cycle", "cyc#", "cycle number", "cycle index"],
    ),
];

/// Standard column a native name stands for, if any.
pub fn standard_for(column: &NativeColumn) -> Option<StandardColumn> {
    let (base, _) = split_unit(&column.name);
    let base = base.trim().to_ascii_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, names)| names.contains(&base.as_str()))
        .map(|(standard, _)| *standard)
}

/// Map columns by keyword. The first column claiming a standard column wins.
pub fn keyword_mapping(columns: &[NativeColumn]) -> Vec<(usize, StandardColumn)> {
    let mut mapping: Vec<(usize, StandardColumn)> = Vec::new();
    for (index, column) in columns.iter().enumerate() {
        if let Some(standard) = standard_for(column) {
            if !mapping.iter().any(|(_, s)| *s == standard) {
                mapping.push((index, standard));
            }
        }
    }
    mapping
}

/// Sample number of a row: the mapped column's value, else its 1-based index.
pub fn sample_number(index: usize, row: &Row, sample_column: Option<usize>) -> Result<i64> {
    match sample_column {
        Some(col) => row
            .get(col)
            .and_then(Scalar::as_i64)
            .ok_or_else(|| anyhow::anyhow!("row {}: sample number is not an integer", index + 1)),
        None => Ok(index as i64 + 1),
    }
}

// ============ Metadata ============

/// Per-column facts gathered by a full scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub unit: Option<String>,
    pub has_data: bool,
    pub is_numeric: bool,
}

/// Everything `import: begin` needs to know about a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub parser: String,
    pub core: CoreMetadata,
    pub test_date: Option<DateTime<Utc>>,
    pub extra: Map<String, Value>,
    pub columns: Vec<ColumnInfo>,
}

/// Scan every row once to count rows and classify columns.
///
/// A column is numeric until a string cell appears, and has data once a
/// cell is non-null, non-zero, non-empty and not NaN. Each check stops
/// looking at a column once its answer can no longer change.
pub fn load_metadata(reader: &dyn FormatReader) -> Result<FileMetadata> {
    let columns = reader.columns();
    let sample_column = reader
        .standard_mapping()
        .into_iter()
        .find(|(_, s)| *s == StandardColumn::SampleNumber)
        .map(|(index, _)| index);

    let mut has_data = vec![false; columns.len()];
    let mut is_numeric = vec![true; columns.len()];
    let mut num_rows = 0i64;
    let mut first_sample = None;
    let mut last_sample = None;

    for (index, row) in reader.rows()?.enumerate() {
        let row = row?;
        if row.len() != columns.len() {
            anyhow::bail!(
                "row {} has {} fields, expected {}",
                index + 1,
                row.len(),
                columns.len()
            );
        }
        for (col, cell) in row.iter().enumerate() {
            if is_numeric[col] && matches!(cell, Scalar::Str(_)) {
                is_numeric[col] = false;
            }
            if !has_data[col] && cell.has_data() {
                has_data[col] = true;
            }
        }
        let sample = sample_number(index, &row, sample_column)?;
        first_sample.get_or_insert(sample);
        last_sample = Some(sample);
        num_rows += 1;
    }

    let columns = columns
        .iter()
        .enumerate()
        .map(|(i, c)| ColumnInfo {
            name: c.name.clone(),
            unit: c.unit.clone(),
            has_data: has_data[i],
            is_numeric: is_numeric[i],
        })
        .collect();

    Ok(FileMetadata {
        parser: reader.parser().to_string(),
        core: CoreMetadata {
            machine_type: Some(reader.machine_type().to_string()),
            dataset_name: reader.dataset_name(),
            num_rows: Some(num_rows),
            first_sample_no: first_sample,
            last_sample_no: last_sample,
        },
        test_date: reader.test_date(),
        extra: reader.extra_metadata(),
        columns,
    })
}

// ============ Segment labels ============

/// Builds one [`DataLabel`] per run of equal key values.
///
/// Feed rows in order with [`SegmentLabeller::push`]; a label closes when
/// the key changes and once more at [`SegmentLabeller::finish`]. The label
/// info describes the segment's last control value and its duration.
pub struct SegmentLabeller {
    control_unit: String,
    current: Option<Segment>,
    labels: Vec<DataLabel>,
}

struct Segment {
    label: String,
    start: u64,
    end: u64,
    start_time: f64,
    end_time: f64,
    control: Option<f64>,
}

impl SegmentLabeller {
    pub fn new(control_unit: impl Into<String>) -> Self {
        Self {
            control_unit: control_unit.into(),
            current: None,
            labels: Vec::new(),
        }
    }

    pub fn push(&mut self, row_index: u64, label: &str, time: f64, control: Option<f64>) {
        match &mut self.current {
            Some(segment) if segment.label == label => {
                segment.end = row_index + 1;
                segment.end_time = time;
                if control.is_some() {
                    segment.control = control;
                }
            }
            _ => {
                self.close();
                self.current = Some(Segment {
                    label: label.to_string(),
                    start: row_index,
                    end: row_index + 1,
                    start_time: time,
                    end_time: time,
                    control,
                });
            }
        }
    }

    fn close(&mut self) {
        if let Some(segment) = self.current.take() {
            let duration = segment.end_time - segment.start_time;
            let info = match segment.control {
                Some(control) => format!(
                    "{} {} for {:.1} s",
                    format_control(control),
                    self.control_unit,
                    duration
                ),
                None => format!("{:.1} s", duration),
            };
            self.labels.push(DataLabel {
                label: segment.label,
                range: [segment.start, segment.end],
                info,
            });
        }
    }

    pub fn finish(mut self) -> Vec<DataLabel> {
        self.close();
        self.labels
    }
}

fn format_control(value: f64) -> String {
    let text = format!("{:.4}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}
