//! Ivium `.idf` text files.
//!
//! ```text
//! QR=QR
//! Title=cell_03 pulse
//! starttime=01/03/2024 09:30:00
//! Method=Chronoamperometry
//! primary_data
//! 3
//! 4
//!  0.000000E+00  1.000000E-03  3.200000E+00
//!  ...
//! ```
//!
//! The signature line is `QR=QR`. Settings are `key=value` lines up to the
//! `primary_data` marker, which is followed by the column count, the row
//! count and exactly that many whitespace-separated rows of time (s),
//! current (A) and potential (V).

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use super::{FormatReader, NativeColumn, Row, RowIter, Scalar};

pub const PARSER: &str = "ivium_idf";

const SIGNATURE: &str = "QR=QR";
const DATA_MARKER: &str = "primary_data";
const START_TIME_FORMATS: &[&str] = &["%d/%m/%Y %H:%M:%S", "%d/%m/%Y %H:%M:%S%.f"];

pub fn sniff(_path: &Path, header: &[u8]) -> bool {
    header.starts_with(SIGNATURE.as_bytes())
}

pub fn open(path: &Path) -> Result<Box<dyn FormatReader>> {
    Ok(Box::new(IviumReader::open(path)?))
}

pub struct IviumReader {
    path: PathBuf,
    settings: Map<String, Value>,
    columns: Vec<NativeColumn>,
    data_start: usize,
    n_rows: usize,
}

impl IviumReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let signature = next_line(&mut lines)?;
        if signature.trim() != SIGNATURE {
            bail!("missing '{}' signature", SIGNATURE);
        }

        let mut settings = Map::new();
        let mut consumed = 1;
        loop {
            let line = next_line(&mut lines)?;
            consumed += 1;
            let line = line.trim();
            if line == DATA_MARKER {
                break;
            }
            if let Some((key, value)) = line.split_once('=') {
                settings.insert(key.trim().to_string(), Value::String(value.trim().to_string()));
            }
        }

        let n_columns: usize = parse_count(&next_line(&mut lines)?, "column")?;
        let n_rows: usize = parse_count(&next_line(&mut lines)?, "row")?;
        consumed += 2;
        if n_columns != 3 {
            bail!("expected 3 data columns, file declares {}", n_columns);
        }

        Ok(Self {
            path: path.to_path_buf(),
            settings,
            columns: vec![
                NativeColumn::new("time/s", Some("s")),
                NativeColumn::new("I/A", Some("A")),
                NativeColumn::new("E/V", Some("V")),
            ],
            data_start: consumed,
            n_rows,
        })
    }
}

fn next_line(lines: &mut Lines<BufReader<File>>) -> Result<String> {
    lines
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("unexpected end of file before data"))
}

fn parse_count(line: &str, what: &str) -> Result<usize> {
    line.trim()
        .parse()
        .with_context(|| format!("unreadable {} count '{}'", what, line.trim()))
}

/// Yields exactly `remaining` rows and fails if the file ends early.
struct IdfRows {
    lines: std::iter::Skip<Lines<BufReader<File>>>,
    line_no: usize,
    remaining: usize,
    expected: usize,
    n_columns: usize,
}

impl Iterator for IdfRows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.line_no += 1;
        let line = match self.lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Some(Err(e.into())),
            None => {
                let found = self.expected - self.remaining - 1;
                self.remaining = 0;
                return Some(Err(anyhow::anyhow!(
                    "file declares {} rows but ends after {}",
                    self.expected,
                    found
                )));
            }
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != self.n_columns {
            return Some(Err(anyhow::anyhow!(
                "line {}: {} fields, expected {}",
                self.line_no,
                fields.len(),
                self.n_columns
            )));
        }
        let row = fields
            .into_iter()
            .map(|f| match f.parse::<f64>() {
                Ok(v) => Ok(Scalar::Float(v)),
                Err(_) => Err(anyhow::anyhow!("line {}: '{}' is not a number", self.line_no, f)),
            })
            .collect();
        Some(row)
    }
}

impl FormatReader for IviumReader {
    fn parser(&self) -> &'static str {
        PARSER
    }

    fn machine_type(&self) -> &'static str {
        "Ivium"
    }

    fn columns(&self) -> &[NativeColumn] {
        &self.columns
    }

    fn test_date(&self) -> Option<DateTime<Utc>> {
        let text = self.settings.get("starttime")?.as_str()?;
        START_TIME_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
            .map(|dt| dt.and_utc())
    }

    fn dataset_name(&self) -> Option<String> {
        self.settings
            .get("Title")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
            })
    }

    fn extra_metadata(&self) -> Map<String, Value> {
        self.settings.clone()
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(IdfRows {
            lines: BufReader::new(file).lines().skip(self.data_start),
            line_no: self.data_start,
            remaining: self.n_rows,
            expected: self.n_rows,
            n_columns: self.columns.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::{load_metadata, open_reader};
    use cycler_harvest_core::catalogue::StandardColumn;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = "QR=QR\nTitle=cell_03 pulse\nstarttime=01/03/2024 09:30:00\nMethod=Chronoamperometry\nprimary_data\n3\n3\n 0.0 1.0E-03 3.2\n 1.0 1.0E-03 3.25\n 2.0 -2.0E-03 3.1\n";

    #[test]
    fn test_reads_settings_and_rows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pulse.idf");
        fs::write(&path, SAMPLE).unwrap();

        let reader = open_reader(&path).unwrap();
        assert_eq!(reader.parser(), PARSER);
        assert_eq!(reader.dataset_name().as_deref(), Some("cell_03 pulse"));
        assert_eq!(
            reader.test_date().unwrap().to_rfc3339(),
            "2024-03-01T09:30:00+00:00"
        );
        let meta = load_metadata(reader.as_ref()).unwrap();
        assert_eq!(meta.core.num_rows, Some(3));
        assert_eq!(meta.extra["Method"], Value::from("Chronoamperometry"));

        let rows: Vec<Row> = reader.rows().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows[2], vec![Scalar::Float(2.0), Scalar::Float(-2.0e-3), Scalar::Float(3.1)]);
        assert_eq!(
            reader.standard_mapping(),
            vec![
                (0, StandardColumn::ElapsedTime),
                (1, StandardColumn::Amps),
                (2, StandardColumn::Volts),
            ]
        );
    }

    #[test]
    fn test_wrong_field_count_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.idf");
        fs::write(&path, SAMPLE.replace(" 1.0 1.0E-03 3.25", " 1.0 3.25")).unwrap();
        let reader = IviumReader::open(&path).unwrap();
        let err = load_metadata(&reader).err().unwrap();
        assert!(err.to_string().contains("line 9"), "{}", err);
    }

    #[test]
    fn test_short_file_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.idf");
        fs::write(&path, SAMPLE.replace("primary_data\n3\n3\n", "primary_data\n3\n5\n")).unwrap();
        let reader = IviumReader::open(&path).unwrap();
        let err = load_metadata(&reader).err().unwrap();
        assert!(err.to_string().contains("declares 5 rows but ends after 3"), "{}", err);
    }
}
