//! Generic delimited text (CSV, TSV, semicolon separated).
//!
//! Tried last. The delimiter is whichever of `,`, tab or `;` occurs most in
//! the first line. That line is a header when any of its fields is not a
//! number; otherwise columns are named `column_1`, `column_2`, ...

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use super::{FormatReader, NativeColumn, Row, RowIter, Scalar};

pub const PARSER: &str = "delimited";

const DELIMITERS: &[u8] = b",\t;";

pub fn sniff(_path: &Path, header: &[u8]) -> bool {
    if header.contains(&0) {
        return false;
    }
    let text = String::from_utf8_lossy(header);
    let Some(first) = text.lines().next() else {
        return false;
    };
    !first.contains('\u{fffd}') && detect_delimiter(first).is_some()
}

pub fn open(path: &Path) -> Result<Box<dyn FormatReader>> {
    Ok(Box::new(DelimitedReader::open(path)?))
}

fn detect_delimiter(line: &str) -> Option<u8> {
    DELIMITERS
        .iter()
        .map(|d| (*d, line.bytes().filter(|b| b == d).count()))
        .filter(|(_, count)| *count > 0)
        .max_by_key(|(_, count)| *count)
        .map(|(d, _)| d)
}

pub struct DelimitedReader {
    path: PathBuf,
    delimiter: u8,
    has_header: bool,
    columns: Vec<NativeColumn>,
}

impl DelimitedReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut line = Vec::new();
        BufReader::new(file)
            .read_until(b'\n', &mut line)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let first_line = String::from_utf8_lossy(&line);
        let delimiter = detect_delimiter(first_line.trim_end())
            .ok_or_else(|| anyhow::anyhow!("no delimiter in first line"))?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(line.as_slice());
        let first = reader
            .records()
            .next()
            .transpose()?
            .ok_or_else(|| anyhow::anyhow!("empty file"))?;
        if first.len() < 2 {
            bail!("only one field in the first record");
        }

        let has_header = first
            .iter()
            .any(|field| !matches!(Scalar::parse(field), Scalar::Int(_) | Scalar::Float(_) | Scalar::Null));
        let columns = if has_header {
            first.iter().map(NativeColumn::from_header).collect()
        } else {
            (1..=first.len())
                .map(|i| NativeColumn::new(format!("column_{}", i), None))
                .collect()
        };

        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            has_header,
            columns,
        })
    }
}

impl FormatReader for DelimitedReader {
    fn parser(&self) -> &'static str {
        PARSER
    }

    fn machine_type(&self) -> &'static str {
        "Delimited"
    }

    fn columns(&self) -> &[NativeColumn] {
        &self.columns
    }

    fn dataset_name(&self) -> Option<String> {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
    }

    fn extra_metadata(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert(
            "delimiter".into(),
            Value::String((self.delimiter as char).to_string()),
        );
        extra.insert("has_header".into(), Value::Bool(self.has_header));
        extra
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        let file = File::open(&self.path)?;
        let reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(self.has_header)
            .flexible(true)
            .from_reader(file);
        let width = self.columns.len();
        let rows = reader.into_records().map(move |record| {
            let record = record?;
            if record.len() != width {
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                bail!("line {}: {} fields, header has {}", line, record.len(), width);
            }
            Ok(record.iter().map(Scalar::parse).collect::<Row>())
        });
        Ok(Box::new(rows))
    }
}
