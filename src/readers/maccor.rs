//! Maccor tab-delimited text exports.
//!
//! ```text
//! Today's Date<TAB>03/05/2024<TAB>Date of Test:<TAB>03/01/2024 09:30:00<TAB>Procedure:<TAB>cc_cv.000
//! Rec#<TAB>Cyc#<TAB>Step<TAB>TestTime<TAB>StepTime<TAB>Amp-hr<TAB>Watt-hr<TAB>Amps<TAB>Volts<TAB>State<TAB>ES<TAB>DPt Time
//! 1<TAB>0<TAB>1<TAB>0<TAB>0<TAB>0<TAB>0<TAB>0<TAB>3.2<TAB>R<TAB>0<TAB>03/01/2024 09:30:00
//! ```
//!
//! The first line holds tab-separated key/value pairs. The column header is
//! the first line starting with `Rec#`. Maccor writes current unsigned and
//! marks discharge with state `D`; the reader negates `Amps` on those rows.
//! Times may be plain seconds or `Nd HH:MM:SS.ss`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use cycler_harvest_core::models::DataLabel;

use super::{FormatReader, NativeColumn, Row, RowIter, Scalar, SegmentLabeller};

pub const PARSER: &str = "maccor_txt";

const PREAMBLE_MARKER: &str = "Today's Date";
const HEADER_MARKER: &str = "Rec#";
const DATE_FORMATS: &[&str] = &["%m/%d/%Y %H:%M:%S", "%m/%d/%Y %I:%M:%S %p", "%m/%d/%Y %H:%M"];

/// Columns whose unit the export leaves implicit.
const KNOWN_UNITS: &[(&str, &str)] = &[
    ("TestTime", "s"),
    ("StepTime", "s"),
    ("Amp-hr", "Ah"),
    ("Watt-hr", "Wh"),
    ("Amps", "A"),
    ("Volts", "V"),
    ("Temp 1", "degC"),
];

const TIME_COLUMNS: &[&str] = &["TestTime", "StepTime"];

pub fn sniff(_path: &Path, header: &[u8]) -> bool {
    let header = header.strip_prefix(b"\xef\xbb\xbf").unwrap_or(header);
    header.starts_with(PREAMBLE_MARKER.as_bytes())
}

pub fn open(path: &Path) -> Result<Box<dyn FormatReader>> {
    Ok(Box::new(MaccorReader::open(path)?))
}

pub struct MaccorReader {
    path: PathBuf,
    preamble: Map<String, Value>,
    test_date: Option<DateTime<Utc>>,
    columns: Vec<NativeColumn>,
    /// Lines before the first data row.
    data_start: usize,
    amps: Option<usize>,
    state: Option<usize>,
    time_columns: Vec<usize>,
}

impl MaccorReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let first = lines
            .next()
            .transpose()?
            .ok_or_else(|| anyhow::anyhow!("empty file"))?;
        let first = first.trim_start_matches('\u{feff}');
        if !first.starts_with(PREAMBLE_MARKER) {
            bail!("missing '{}' preamble", PREAMBLE_MARKER);
        }
        let preamble = parse_preamble(first);

        let mut data_start = 1;
        let header = loop {
            let line = lines
                .next()
                .transpose()?
                .ok_or_else(|| anyhow::anyhow!("no '{}' column header", HEADER_MARKER))?;
            data_start += 1;
            if line.starts_with(HEADER_MARKER) {
                break line;
            }
        };

        let columns: Vec<NativeColumn> = header
            .trim_end_matches(['\r', '\t'])
            .split('\t')
            .map(|name| {
                let name = name.trim();
                let unit = KNOWN_UNITS
                    .iter()
                    .find(|(known, _)| *known == name)
                    .map(|(_, unit)| *unit);
                NativeColumn::new(name, unit)
            })
            .collect();

        let index_of = |name: &str| columns.iter().position(|c| c.name == name);
        let test_date = preamble
            .get("Date of Test")
            .and_then(Value::as_str)
            .and_then(parse_date);

        Ok(Self {
            path: path.to_path_buf(),
            amps: index_of("Amps"),
            state: index_of("State"),
            time_columns: TIME_COLUMNS.iter().filter_map(|n| index_of(*n)).collect(),
            preamble,
            test_date,
            columns,
            data_start,
        })
    }

    fn parse_line(&self, line_no: usize, line: &str) -> Result<Row> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\t']).split('\t').collect();
        if fields.len() != self.columns.len() {
            bail!(
                "line {}: {} fields, header has {}",
                line_no,
                fields.len(),
                self.columns.len()
            );
        }
        let mut row: Row = Vec::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            let cell = if self.time_columns.contains(&index) {
                match parse_duration(field) {
                    Some(secs) => Scalar::Float(secs),
                    None => bail!("line {}: unreadable time '{}'", line_no, field),
                }
            } else {
                Scalar::parse(field)
            };
            row.push(cell);
        }
        if let (Some(amps), Some(state)) = (self.amps, self.state) {
            if row[state] == Scalar::Str("D".into()) {
                row[amps] = match &row[amps] {
                    Scalar::Int(v) => Scalar::Int(-v.abs()),
                    Scalar::Float(v) => Scalar::Float(-v.abs()),
                    other => other.clone(),
                };
            }
        }
        Ok(row)
    }
}

fn parse_preamble(line: &str) -> Map<String, Value> {
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let mut preamble = Map::new();
    for pair in fields.chunks(2) {
        let key = pair[0].trim_end_matches(':');
        if key.is_empty() {
            continue;
        }
        let value = pair.get(1).copied().unwrap_or_default();
        preamble.insert(key.to_string(), Value::String(value.to_string()));
    }
    preamble
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%m/%d/%Y")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|dt| dt.and_utc())
}

/// Seconds from `12.5` or `1d 02:03:04.50`.
fn parse_duration(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<f64>() {
        return Some(secs);
    }
    let (days, clock) = match text.split_once('d') {
        Some((days, clock)) => (days.trim().parse::<f64>().ok()?, clock.trim()),
        None => (0.0, text),
    };
    let mut parts = clock.split(':');
    let hours = parts.next()?.parse::<f64>().ok()?;
    let minutes = parts.next()?.parse::<f64>().ok()?;
    let seconds = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(days * 86_400.0 + hours * 3600.0 + minutes * 60.0 + seconds)
}

fn state_name(state: &str) -> &str {
    match state {
        "R" => "Rest",
        "C" => "Charge",
        "D" => "Discharge",
        "O" => "Other",
        "S" => "Stopped",
        other => other,
    }
}

impl FormatReader for MaccorReader {
    fn parser(&self) -> &'static str {
        PARSER
    }

    fn machine_type(&self) -> &'static str {
        "Maccor"
    }

    fn columns(&self) -> &[NativeColumn] {
        &self.columns
    }

    fn test_date(&self) -> Option<DateTime<Utc>> {
        self.test_date
    }

    fn dataset_name(&self) -> Option<String> {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
    }

    fn extra_metadata(&self) -> Map<String, Value> {
        self.preamble.clone()
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        let file = File::open(&self.path)?;
        let start = self.data_start;
        let rows = BufReader::new(file)
            .lines()
            .enumerate()
            .skip(start)
            .filter(|(_, line)| !matches!(line, Ok(text) if text.trim().is_empty()))
            .map(move |(index, line)| {
                let line = line?;
                self.parse_line(index + 1, &line)
            });
        Ok(Box::new(rows))
    }

    /// One label per run of equal `State`.
    fn data_labels(&self) -> Result<Vec<DataLabel>> {
        let Some(state) = self.state else {
            return Ok(Vec::new());
        };
        let time = self.time_columns.first().copied();
        let mut labeller = SegmentLabeller::new("A");
        for (index, row) in self.rows()?.enumerate() {
            let row = row?;
            let label = match &row[state] {
                Scalar::Str(s) => state_name(s).to_string(),
                other => other.to_json().to_string(),
            };
            let t = time.and_then(|t| row[t].as_f64()).unwrap_or(index as f64);
            let control = self.amps.and_then(|a| row[a].as_f64());
            labeller.push(index as u64, &label, t, control);
        }
        Ok(labeller.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::{load_metadata, open_reader};
    use cycler_harvest_core::catalogue::StandardColumn;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = "Today's Date\t03/05/2024\tDate of Test:\t03/01/2024 09:30:00\tProcedure:\tcc_cv.000\n\
Rec#\tCyc#\tStep\tTestTime\tStepTime\tAmp-hr\tWatt-hr\tAmps\tVolts\tState\tES\tDPt Time\n\
1\t0\t1\t0\t0\t0\t0\t0\t3.2\tR\t0\t03/01/2024 09:30:00\n\
2\t0\t1\t10\t10\t0\t0\t0\t3.2\tR\t0\t03/01/2024 09:30:10\n\
3\t1\t2\t0d 00:00:20.00\t0\t0.001\t0.003\t0.5\t3.4\tC\t0\t03/01/2024 09:30:20\n\
4\t1\t3\t30\t0\t0.002\t0.006\t0.5\t3.3\tD\t0\t03/01/2024 09:30:30\n";

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("cell_02.txt");
        fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn test_reads_preamble_and_rows() {
        let tmp = TempDir::new().unwrap();
        let reader = MaccorReader::open(&write_sample(&tmp)).unwrap();
        assert_eq!(
            reader.test_date().unwrap().to_rfc3339(),
            "2024-03-01T09:30:00+00:00"
        );
        assert_eq!(reader.extra_metadata()["Procedure"], Value::from("cc_cv.000"));

        let rows: Vec<Row> = reader.rows().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2][3], Scalar::Float(20.0));
        assert_eq!(rows[3][7], Scalar::Float(-0.5));
        assert_eq!(rows[2][7], Scalar::Float(0.5));

        let mapping = reader.standard_mapping();
        assert!(mapping.contains(&(0, StandardColumn::SampleNumber)));
        assert!(mapping.contains(&(3, StandardColumn::ElapsedTime)));
        assert!(mapping.contains(&(5, StandardColumn::ChargeCapacity)));
        assert!(mapping.contains(&(7, StandardColumn::Amps)));
    }

    #[test]
    fn test_labels_follow_state() {
        let tmp = TempDir::new().unwrap();
        let reader = MaccorReader::open(&write_sample(&tmp)).unwrap();
        let labels = reader.data_labels().unwrap();
        let names: Vec<_> = labels.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(names, vec!["Rest", "Charge", "Discharge"]);
        assert_eq!(labels[0].range, [0, 2]);
        assert_eq!(labels[0].info, "0 A for 10.0 s");
        assert_eq!(labels[2].info, "-0.5 A for 0.0 s");
    }

    #[test]
    fn test_ragged_row_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.txt");
        fs::write(&path, format!("{}5\t1\t2\n", SAMPLE)).unwrap();
        let reader = open_reader(&path).unwrap();
        assert_eq!(reader.parser(), PARSER);
        let err = load_metadata(reader.as_ref()).err().unwrap();
        assert!(err.to_string().contains("line 7"), "{}", err);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.5"), Some(12.5));
        assert_eq!(parse_duration("1d 01:00:00.50"), Some(90_000.5));
        assert_eq!(parse_duration("00:01:00"), Some(60.0));
        assert_eq!(parse_duration("soon"), None);
    }
}
