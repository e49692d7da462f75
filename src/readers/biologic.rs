//! BioLogic EC-Lab `.mpr` binary files.
//!
//! An MPR file is a 52-byte magic header followed by a sequence of modules.
//! Each module starts with the ASCII marker `MODULE` and a fixed header:
//!
//! | Field | Size | Notes |
//! |-------|------|-------|
//! | short name | 10 | space padded, e.g. `VMP data  ` |
//! | long name | 25 | space padded |
//! | length | 4 | little-endian `u32`, bytes of module data |
//! | version | 4 | little-endian `u32` |
//! | date | 8 | `MM/DD/YY` |
//!
//! The `VMP data` module holds the samples: a `u32` point count, a `u8`
//! column count and the column ids (`u8` in version 0, `u16` little-endian
//! from version 2), then fixed-width little-endian records starting at
//! offset 100 (v0), 405 (v2) or 406 (v3). Column id 1 and the other flag ids
//! share a single bit-packed byte per record.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Map, Value};

use cycler_harvest_core::models::DataLabel;

use super::{FormatReader, NativeColumn, Row, RowIter, Scalar, SegmentLabeller};

pub const PARSER: &str = "biologic_mpr";

const MAGIC_TEXT: &[u8] = b"BIO-LOGIC MODULAR FILE\x1a";
const MAGIC_LEN: usize = 52;
const MODULE_MARKER: &[u8] = b"MODULE";
const MODULE_HEADER_LEN: usize = 10 + 25 + 4 + 4 + 8;
const DATA_MODULE: &str = "VMP data";

/// The full 52-byte file header.
pub fn magic() -> [u8; MAGIC_LEN] {
    let mut header = [b' '; MAGIC_LEN];
    header[..MAGIC_TEXT.len()].copy_from_slice(MAGIC_TEXT);
    header[48..].fill(0);
    header
}

pub fn sniff(_path: &Path, header: &[u8]) -> bool {
    header.starts_with(MAGIC_TEXT)
}

pub fn open(path: &Path) -> Result<Box<dyn FormatReader>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let dataset = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string());
    Ok(Box::new(MprReader::parse(bytes, dataset)?))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Dtype {
    U1,
    U2,
    U4,
    F4,
    F8,
}

impl Dtype {
    fn size(self) -> usize {
        match self {
            Dtype::U1 => 1,
            Dtype::U2 => 2,
            Dtype::U4 | Dtype::F4 => 4,
            Dtype::F8 => 8,
        }
    }
}

/// Bit-packed flags sharing the flags byte: `(id, name, mask)`.
const FLAG_COLUMNS: &[(u16, &str, u8)] = &[
    (1, "mode", 0x03),
    (2, "ox/red", 0x04),
    (3, "error", 0x08),
    (21, "control changes", 0x10),
    (31, "Ns changes", 0x20),
    (65, "counter inc.", 0x80),
];

/// Data columns: `(id, header, unit, dtype)`.
const DATA_COLUMNS: &[(u16, &str, Option<&str>, Dtype)] = &[
    (4, "time/s", Some("s"), Dtype::F8),
    (5, "control/V/mA", None, Dtype::F4),
    (6, "Ewe/V", Some("V"), Dtype::F4),
    (7, "dq/mA.h", Some("mA.h"), Dtype::F8),
    (8, "I/mA", Some("mA"), Dtype::F4),
    (9, "Ece/V", Some("V"), Dtype::F4),
    (11, "<I>/mA", Some("mA"), Dtype::F8),
    (13, "(Q-Qo)/mA.h", Some("mA.h"), Dtype::F8),
    (16, "Analog IN 1/V", Some("V"), Dtype::F4),
    (19, "control/V", Some("V"), Dtype::F4),
    (20, "control/mA", Some("mA"), Dtype::F4),
    (23, "dQ/mA.h", Some("mA.h"), Dtype::F8),
    (24, "cycle number", None, Dtype::F8),
    (26, "Rapp/Ohm", Some("Ohm"), Dtype::F4),
    (32, "freq/Hz", Some("Hz"), Dtype::F4),
    (33, "|Ewe|/V", Some("V"), Dtype::F4),
    (34, "|I|/A", Some("A"), Dtype::F4),
    (35, "Phase(Z)/deg", Some("deg"), Dtype::F4),
    (36, "|Z|/Ohm", Some("Ohm"), Dtype::F4),
    (37, "Re(Z)/Ohm", Some("Ohm"), Dtype::F4),
    (38, "-Im(Z)/Ohm", Some("Ohm"), Dtype::F4),
    (39, "I Range", None, Dtype::U2),
    (69, "R/Ohm", Some("Ohm"), Dtype::F4),
    (70, "P/W", Some("W"), Dtype::F4),
    (74, "|Energy|/W.h", Some("W.h"), Dtype::F8),
    (75, "Analog OUT/V", Some("V"), Dtype::F4),
    (76, "<I> avg/mA", Some("mA"), Dtype::F4),
    (77, "<Ewe>/V", Some("V"), Dtype::F4),
    (123, "Energy charge/W.h", Some("W.h"), Dtype::F8),
    (124, "Energy discharge/W.h", Some("W.h"), Dtype::F8),
    (125, "Capacitance charge/µF", Some("µF"), Dtype::F8),
    (126, "Capacitance discharge/µF", Some("µF"), Dtype::F8),
    (131, "Ns", None, Dtype::U2),
    (163, "|Estack|/V", Some("V"), Dtype::F4),
    (168, "Rcmp/Ohm", Some("Ohm"), Dtype::F4),
    (169, "Cs/µF", Some("µF"), Dtype::F4),
    (172, "Cp/µF", Some("µF"), Dtype::F4),
    (434, "(Q-Qo)/C", Some("C"), Dtype::F4),
    (435, "dQ/C", Some("C"), Dtype::F4),
    (438, "step time/s", Some("s"), Dtype::F8),
    (441, "<Ecv>/V", Some("V"), Dtype::F4),
    (462, "Temperature/°C", Some("°C"), Dtype::F4),
    (467, "Q charge/discharge/mA.h", Some("mA.h"), Dtype::F8),
    (468, "half cycle", None, Dtype::U4),
    (469, "z cycle", None, Dtype::U4),
];

#[derive(Debug, Clone, Copy)]
enum Field {
    Flag { offset: usize, mask: u8 },
    Value { offset: usize, dtype: Dtype },
}

#[derive(Debug, Clone)]
struct Module {
    short_name: String,
    long_name: String,
    version: u32,
    date: String,
    start: usize,
    end: usize,
}

/// A parsed MPR file held in memory.
pub struct MprReader {
    bytes: Vec<u8>,
    modules: Vec<Module>,
    data_version: u32,
    columns: Vec<NativeColumn>,
    fields: Vec<Field>,
    n_points: usize,
    records_start: usize,
    record_size: usize,
    test_date: Option<DateTime<Utc>>,
    dataset: Option<String>,
}

impl MprReader {
    pub fn parse(bytes: Vec<u8>, dataset: Option<String>) -> Result<Self> {
        if bytes.len() < MAGIC_LEN || bytes[..MAGIC_LEN] != magic() {
            bail!("missing BIO-LOGIC MODULAR FILE header");
        }
        let modules = parse_modules(&bytes)?;
        let data = modules
            .iter()
            .find(|m| m.short_name == DATA_MODULE)
            .ok_or_else(|| anyhow::anyhow!("no '{}' module", DATA_MODULE))?
            .clone();
        let body = &bytes[data.start..data.end];
        if body.len() < 5 {
            bail!("'{}' module is too short", DATA_MODULE);
        }

        let n_points = u32::from_le_bytes(take(body, 0)) as usize;
        let n_columns = body[4] as usize;
        let (ids, records_offset) = match data.version {
            0 => {
                let ids: Vec<u16> = body
                    .get(5..5 + n_columns)
                    .ok_or_else(|| anyhow::anyhow!("column ids run past module end"))?
                    .iter()
                    .map(|&id| id as u16)
                    .collect();
                (ids, 100)
            }
            2 | 3 => {
                let raw = body
                    .get(5..5 + 2 * n_columns)
                    .ok_or_else(|| anyhow::anyhow!("column ids run past module end"))?;
                let ids: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                (ids, if data.version == 3 { 406 } else { 405 })
            }
            other => bail!("unsupported '{}' module version {}", DATA_MODULE, other),
        };

        let (columns, fields, record_size) = layout(&ids)?;
        let available = body.len().saturating_sub(records_offset);
        if n_points
            .checked_mul(record_size)
            .map_or(true, |needed| needed > available)
        {
            bail!(
                "{} records of {} bytes do not fit in {} bytes of data",
                n_points,
                record_size,
                available
            );
        }

        let test_date = parse_module_date(&data.date);

        Ok(Self {
            data_version: data.version,
            records_start: data.start + records_offset,
            modules,
            columns,
            fields,
            n_points,
            record_size,
            test_date,
            dataset,
            bytes,
        })
    }

    fn decode(&self, index: usize) -> Row {
        let record = &self.bytes[self.records_start + index * self.record_size..][..self.record_size];
        self.fields
            .iter()
            .map(|field| match *field {
                Field::Flag { offset, mask } => {
                    let bits = record[offset] & mask;
                    Scalar::Int((bits >> mask.trailing_zeros()) as i64)
                }
                Field::Value { offset, dtype } => match dtype {
                    Dtype::U1 => Scalar::Int(record[offset] as i64),
                    Dtype::U2 => Scalar::Int(u16::from_le_bytes(take(record, offset)) as i64),
                    Dtype::U4 => Scalar::Int(u32::from_le_bytes(take(record, offset)) as i64),
                    Dtype::F4 => Scalar::Float(f32::from_le_bytes(take(record, offset)) as f64),
                    Dtype::F8 => Scalar::Float(f64::from_le_bytes(take(record, offset))),
                },
            })
            .collect()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

fn take<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

fn padded_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

fn parse_modules(bytes: &[u8]) -> Result<Vec<Module>> {
    let mut modules = Vec::new();
    let mut offset = MAGIC_LEN;
    while offset < bytes.len() {
        if bytes.get(offset..offset + MODULE_MARKER.len()) != Some(MODULE_MARKER) {
            bail!("expected MODULE marker at byte {}", offset);
        }
        let header_start = offset + MODULE_MARKER.len();
        let header = bytes
            .get(header_start..header_start + MODULE_HEADER_LEN)
            .ok_or_else(|| anyhow::anyhow!("truncated module header at byte {}", offset))?;
        let length = u32::from_le_bytes(take(header, 35)) as usize;
        let start = header_start + MODULE_HEADER_LEN;
        let end = start + length;
        if end > bytes.len() {
            bail!(
                "module at byte {} declares {} bytes but only {} remain",
                offset,
                length,
                bytes.len() - start
            );
        }
        modules.push(Module {
            short_name: padded_text(&header[..10]),
            long_name: padded_text(&header[10..35]),
            version: u32::from_le_bytes(take(header, 39)),
            date: padded_text(&header[43..51]),
            start,
            end,
        });
        offset = end;
    }
    Ok(modules)
}

fn layout(ids: &[u16]) -> Result<(Vec<NativeColumn>, Vec<Field>, usize)> {
    let mut columns = Vec::with_capacity(ids.len());
    let mut fields = Vec::with_capacity(ids.len());
    let mut flags_offset: Option<usize> = None;
    let mut size = 0usize;

    for &id in ids {
        if let Some((_, name, mask)) = FLAG_COLUMNS.iter().find(|(fid, _, _)| *fid == id) {
            let offset = *flags_offset.get_or_insert_with(|| {
                size += 1;
                size - 1
            });
            columns.push(NativeColumn::new(*name, None));
            fields.push(Field::Flag { offset, mask: *mask });
            continue;
        }
        let Some((_, name, unit, dtype)) = DATA_COLUMNS.iter().find(|(did, ..)| *did == id) else {
            bail!("unknown column id {}", id);
        };
        columns.push(NativeColumn::new(*name, *unit));
        fields.push(Field::Value {
            offset: size,
            dtype: *dtype,
        });
        size += dtype.size();
    }
    Ok((columns, fields, size))
}

fn parse_module_date(text: &str) -> Option<DateTime<Utc>> {
    let normalised = text.replace(['-', '.'], "/");
    NaiveDate::parse_from_str(&normalised, "%m/%d/%y")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn mode_name(mode: i64) -> &'static str {
    match mode {
        1 => "CC",
        2 => "CV",
        3 => "Rest",
        _ => "Unknown",
    }
}

impl FormatReader for MprReader {
    fn parser(&self) -> &'static str {
        PARSER
    }

    fn machine_type(&self) -> &'static str {
        "BioLogic"
    }

    fn columns(&self) -> &[NativeColumn] {
        &self.columns
    }

    fn test_date(&self) -> Option<DateTime<Utc>> {
        self.test_date
    }

    fn dataset_name(&self) -> Option<String> {
        self.dataset.clone()
    }

    fn extra_metadata(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("data_version".into(), json!(self.data_version));
        extra.insert(
            "modules".into(),
            Value::Array(
                self.modules
                    .iter()
                    .map(|m| {
                        json!({
                            "name": m.short_name,
                            "description": m.long_name,
                            "version": m.version,
                            "date": m.date,
                        })
                    })
                    .collect(),
            ),
        );
        extra
    }

    fn rows(&self) -> Result<RowIter<'_>> {
        Ok(Box::new((0..self.n_points).map(move |i| Ok(self.decode(i)))))
    }

    /// One label per step (`Ns`), or per control mode when `Ns` is absent.
    fn data_labels(&self) -> Result<Vec<DataLabel>> {
        let step = self.column_index("Ns");
        let mode = self.column_index("mode");
        let Some(key) = step.or(mode) else {
            return Ok(Vec::new());
        };
        let time = self.column_index("time/s");
        let (control, unit) = match self.column_index("I/mA") {
            Some(i) => (Some(i), "mA"),
            None => (self.column_index("control/V/mA"), ""),
        };

        let mut labeller = SegmentLabeller::new(unit);
        for (index, row) in self.rows()?.enumerate() {
            let row = row?;
            let key_value = row[key].as_i64().unwrap_or_default();
            let label = if step.is_some() {
                format!("Ns {}", key_value)
            } else {
                mode_name(key_value).to_string()
            };
            let t = time.and_then(|t| row[t].as_f64()).unwrap_or(index as f64);
            let c = control.and_then(|c| row[c].as_f64());
            labeller.push(index as u64, &label, t, c);
        }
        Ok(labeller.finish())
    }
}
