//! Column resolution: decide which columns of a file are uploaded and how
//! the server will know them.
//!
//! Each native column falls into one of three groups:
//!
//! - **known**: a standard column (or one already stored for this file)
//!   whose column type id the harvester has; sent as `column_id`.
//! - **new standard**: maps to a standard column the server has no type for
//!   yet; sent as the standard name plus its unit symbol.
//! - **extra**: no standard meaning; sent under its native name with the
//!   unit parsed from its header (or the name itself when it has none).
//!
//! A column is uploaded when it carries data or stands for a required
//! standard column. `Sample_number` is synthesised from the row index when
//! the file has none, and `Charge_capacity` is integrated from current and
//! time when the file provides those but no capacity column.

use anyhow::{bail, Result};

use cycler_harvest_core::catalogue::{conversion_multiplier, StandardColumn};
use cycler_harvest_core::models::DataType;
use cycler_harvest_core::wire::{ColumnPayload, HarvesterConfig, UploadInfo};

use crate::readers::{ColumnInfo, FileMetadata};

/// Where an uploaded column's values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Native column at this index.
    Native(usize),
    /// Row index plus one.
    SampleIndex,
    /// Trapezoidal integral of `Amps` over `Elapsed_time_s`, in Ah.
    IntegratedCharge,
}

/// One column of the upload.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedColumn {
    pub source: Source,
    /// Column type name on the server, the key of `last_record`.
    pub key: String,
    pub standard: Option<StandardColumn>,
    pub data_type: DataType,
    /// Factor converting native values into the standard unit.
    pub multiplier: f64,
    /// Identity sent with every chunk; `values` stays empty.
    pub header: ColumnPayload,
}

/// The ordered set of columns an import uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPlan {
    pub columns: Vec<PlannedColumn>,
    /// Native column holding sample numbers, if the file has one.
    pub sample_column: Option<usize>,
}

impl UploadPlan {
    pub fn headers(&self) -> Vec<ColumnPayload> {
        self.columns.iter().map(|c| c.header.clone()).collect()
    }

    /// Plan position of the column for `standard`.
    pub fn position(&self, standard: StandardColumn) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.standard == Some(standard))
    }
}

/// `catalogue` is consulted for standard columns only, so an extra column
/// that happens to share a standard name never lands in the standard type.
fn identity(
    key: &str,
    stored: &UploadInfo,
    catalogue: Option<&HarvesterConfig>,
    unit_symbol: &str,
    data_type: DataType,
) -> ColumnPayload {
    let known = stored
        .columns
        .iter()
        .find(|c| c.name == key)
        .map(|c| c.id)
        .or_else(|| catalogue.and_then(|config| config.column_type_id(key)));
    match known {
        Some(id) => ColumnPayload {
            column_id: Some(id),
            unit_id: None,
            unit_symbol: None,
            column_name: Some(key.to_string()),
            data_type,
            values: Vec::new(),
        },
        None => ColumnPayload {
            column_id: None,
            unit_id: None,
            unit_symbol: Some(unit_symbol.to_string()),
            column_name: Some(key.to_string()),
            data_type,
            values: Vec::new(),
        },
    }
}

fn planned_standard(
    source: Source,
    standard: StandardColumn,
    multiplier: f64,
    stored: &UploadInfo,
    config: &HarvesterConfig,
) -> PlannedColumn {
    PlannedColumn {
        source,
        key: standard.name().to_string(),
        standard: Some(standard),
        data_type: standard.data_type(),
        multiplier,
        header: identity(
            standard.name(),
            stored,
            Some(config),
            standard.unit_symbol(),
            standard.data_type(),
        ),
    }
}

fn planned_extra(index: usize, info: &ColumnInfo, stored: &UploadInfo) -> PlannedColumn {
    let data_type = if info.is_numeric {
        DataType::Float
    } else {
        DataType::Str
    };
    let unit = info.unit.as_deref().unwrap_or(&info.name);
    PlannedColumn {
        source: Source::Native(index),
        key: info.name.clone(),
        standard: None,
        data_type,
        multiplier: 1.0,
        header: identity(&info.name, stored, None, unit, data_type),
    }
}

/// Build the upload plan for a file.
///
/// Fails when a required standard column can neither be read nor
/// synthesised, or when the server already stores a column this file no
/// longer provides.
pub fn resolve(
    metadata: &FileMetadata,
    mapping: &[(usize, StandardColumn)],
    config: &HarvesterConfig,
    stored: &UploadInfo,
) -> Result<UploadPlan> {
    let mut columns: Vec<PlannedColumn> = Vec::new();
    let mut sample_column = None;

    for (index, info) in metadata.columns.iter().enumerate() {
        let standard = mapping
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, s)| *s);
        let already_stored = stored.columns.iter().any(|c| {
            c.name == info.name || standard.is_some_and(|s| s.name() == c.name)
        });
        let wanted = info.has_data || already_stored || standard.is_some_and(|s| s.is_required());
        if !wanted {
            log::debug!("skipping empty column '{}'", info.name);
            continue;
        }

        let planned = match standard {
            Some(s) => match info.unit.as_deref() {
                None => Some(planned_standard(Source::Native(index), s, 1.0, stored, config)),
                Some(unit) => match conversion_multiplier(unit, s.unit_symbol()) {
                    Some(m) => Some(planned_standard(Source::Native(index), s, m, stored, config)),
                    None => {
                        log::warn!(
                            "column '{}' looks like {} but its unit '{}' does not convert to '{}'",
                            info.name,
                            s.name(),
                            unit,
                            s.unit_symbol()
                        );
                        None
                    }
                },
            },
            None => None,
        };

        match planned {
            Some(p) => {
                if p.standard == Some(StandardColumn::SampleNumber) {
                    sample_column = Some(index);
                }
                columns.push(p);
            }
            None => columns.push(planned_extra(index, info, stored)),
        }
    }

    let mut plan = UploadPlan {
        columns,
        sample_column,
    };

    if plan.position(StandardColumn::SampleNumber).is_none() {
        plan.columns.insert(
            0,
            planned_standard(Source::SampleIndex, StandardColumn::SampleNumber, 1.0, stored, config),
        );
    }
    if plan.position(StandardColumn::ChargeCapacity).is_none()
        && plan.position(StandardColumn::Amps).is_some()
        && plan.position(StandardColumn::ElapsedTime).is_some()
    {
        plan.columns.push(planned_standard(
            Source::IntegratedCharge,
            StandardColumn::ChargeCapacity,
            1.0,
            stored,
            config,
        ));
    }

    for required in StandardColumn::ALL.into_iter().filter(|s| s.is_required()) {
        if plan.position(required).is_none() {
            bail!("file has no column for required '{}'", required.name());
        }
    }
    if let Some(missing) = stored
        .columns
        .iter()
        .find(|c| !plan.columns.iter().any(|p| p.key == c.name))
    {
        bail!(
            "server stores column '{}' which this file no longer provides",
            missing.name
        );
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycler_harvest_core::models::ColumnType;
    use cycler_harvest_core::wire::{CoreMetadata, UploadColumn};
    use serde_json::Map;

    fn config() -> HarvesterConfig {
        let standard_columns = StandardColumn::ALL
            .iter()
            .enumerate()
            .map(|(i, s)| ColumnType {
                id: i as i64 + 1,
                name: s.name().to_string(),
                unit_id: 1,
                is_default: true,
                is_required: s.is_required(),
                override_name: None,
            })
            .collect();
        HarvesterConfig {
            harvester_id: 1,
            name: "h".into(),
            sleep_time: 10,
            max_upload_bytes: 100_000,
            monitored_paths: vec![],
            standard_units: vec![],
            standard_columns,
        }
    }

    fn info(name: &str, unit: Option<&str>, has_data: bool, is_numeric: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            unit: unit.map(str::to_string),
            has_data,
            is_numeric,
        }
    }

    fn metadata(columns: Vec<ColumnInfo>) -> FileMetadata {
        FileMetadata {
            parser: "test".into(),
            core: CoreMetadata::default(),
            test_date: None,
            extra: Map::new(),
            columns,
        }
    }

    #[test]
    fn test_classifies_known_extra_and_synthesised_columns() {
        let meta = metadata(vec![
            info("time/s", Some("s"), true, true),
            info("Ewe/V", Some("V"), true, true),
            info("I/mA", Some("mA"), true, true),
            info("humidity", None, true, true),
            info("comment", None, true, false),
            info("unused", None, false, true),
        ]);
        let mapping = vec![
            (0, StandardColumn::ElapsedTime),
            (1, StandardColumn::Volts),
            (2, StandardColumn::Amps),
        ];
        let plan = resolve(&meta, &mapping, &config(), &UploadInfo::default()).unwrap();
        let keys: Vec<_> = plan.columns.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "Sample_number",
                "Elapsed_time_s",
                "Volts",
                "Amps",
                "humidity",
                "comment",
                "Charge_capacity"
            ]
        );
        assert_eq!(plan.columns[0].source, Source::SampleIndex);
        assert_eq!(plan.columns[3].multiplier, 1e-3);
        assert_eq!(plan.columns[3].header.column_id, Some(4));

        let humidity = &plan.columns[4].header;
        assert_eq!(humidity.column_id, None);
        assert_eq!(humidity.unit_symbol.as_deref(), Some("humidity"));
        assert_eq!(humidity.data_type, DataType::Float);
        assert_eq!(plan.columns[5].data_type, DataType::Str);
        assert_eq!(plan.columns[6].source, Source::IntegratedCharge);
    }

    #[test]
    fn test_missing_required_column_fails() {
        let meta = metadata(vec![info("time/s", Some("s"), true, true)]);
        let mapping = vec![(0, StandardColumn::ElapsedTime)];
        let err = resolve(&meta, &mapping, &config(), &UploadInfo::default()).unwrap_err();
        assert!(err.to_string().contains("Volts"));
    }

    #[test]
    fn test_stored_extra_column_is_referenced_by_id() {
        let meta = metadata(vec![
            info("t", Some("s"), true, true),
            info("v", Some("V"), true, true),
            info("i", Some("A"), true, true),
            info("humidity", Some("%"), true, true),
        ]);
        let mapping = vec![
            (0, StandardColumn::ElapsedTime),
            (1, StandardColumn::Volts),
            (2, StandardColumn::Amps),
        ];
        let stored = UploadInfo {
            columns: vec![UploadColumn {
                name: "humidity".into(),
                id: 42,
            }],
            last_record_number: Some(10),
            ..Default::default()
        };
        let plan = resolve(&meta, &mapping, &config(), &stored).unwrap();
        let humidity = plan.columns.iter().find(|c| c.key == "humidity").unwrap();
        assert_eq!(humidity.header.column_id, Some(42));
    }

    #[test]
    fn test_unconvertible_unit_becomes_extra() {
        let meta = metadata(vec![
            info("time", Some("s"), true, true),
            info("voltage", Some("V"), true, true),
            info("current", Some("furlong"), true, true),
            info("amps", Some("A"), true, true),
        ]);
        let mapping = vec![
            (0, StandardColumn::ElapsedTime),
            (1, StandardColumn::Volts),
            (2, StandardColumn::Amps),
        ];
        let plan = resolve(&meta, &mapping, &config(), &UploadInfo::default());
        // "current" is demoted; nothing else claims Amps.
        assert!(plan.unwrap_err().to_string().contains("Amps"));
    }
}
