//! Row completion: turn reader rows into upload values.
//!
//! [`RowCompleter`] walks the rows of a file in order and produces one JSON
//! value per planned column: native values scaled into the standard unit,
//! synthesised sample numbers and an integrated charge capacity.
//!
//! When the server already holds rows for the file, every row whose sample
//! number is at or below `last_record_number` is skipped, and the charge
//! integral continues from the stored last `Charge_capacity`, `Amps` and
//! `Elapsed_time_s`. An interrupted and resumed import therefore uploads
//! exactly the values an uninterrupted one would.

use anyhow::{bail, Result};
use serde_json::Value;

use cycler_harvest_core::catalogue::StandardColumn;
use cycler_harvest_core::models::DataType;
use cycler_harvest_core::wire::UploadInfo;

use crate::readers::{sample_number, Row, Scalar};
use crate::resolver::{PlannedColumn, Source, UploadPlan};

#[derive(Debug, Clone, Copy)]
struct ChargeState {
    time: f64,
    amps: f64,
    charge: f64,
}

pub struct RowCompleter<'a> {
    plan: &'a UploadPlan,
    resume_after: Option<i64>,
    amps: Option<usize>,
    time: Option<usize>,
    charge: Option<ChargeState>,
}

impl<'a> RowCompleter<'a> {
    pub fn new(plan: &'a UploadPlan, stored: &UploadInfo) -> Self {
        let native = |standard: StandardColumn| {
            plan.position(standard)
                .filter(|&p| matches!(plan.columns[p].source, Source::Native(_)))
        };
        let charge = stored.last_record_number.and_then(|_| {
            let value = |standard: StandardColumn| {
                stored
                    .last_record
                    .get(standard.name())
                    .and_then(Value::as_f64)
            };
            Some(ChargeState {
                time: value(StandardColumn::ElapsedTime)?,
                amps: value(StandardColumn::Amps)?,
                charge: value(StandardColumn::ChargeCapacity)?,
            })
        });
        Self {
            plan,
            resume_after: stored.last_record_number,
            amps: native(StandardColumn::Amps),
            time: native(StandardColumn::ElapsedTime),
            charge,
        }
    }

    /// Values for row `index`, or `None` when the server already has it.
    pub fn complete(&mut self, index: usize, row: &Row) -> Result<Option<Vec<Value>>> {
        let sample = sample_number(index, row, self.plan.sample_column)?;
        if self.resume_after.is_some_and(|last| sample <= last) {
            return Ok(None);
        }

        let mut values = Vec::with_capacity(self.plan.columns.len());
        for column in &self.plan.columns {
            let value = match column.source {
                Source::Native(native) => native_value(index, column, &row[native])?,
                Source::SampleIndex => Value::from(sample),
                Source::IntegratedCharge => Value::from(self.integrate(row)),
            };
            values.push(value);
        }
        Ok(Some(values))
    }

    fn scaled(&self, position: Option<usize>, row: &Row) -> Option<f64> {
        let column = &self.plan.columns[position?];
        let Source::Native(native) = column.source else {
            return None;
        };
        row[native]
            .as_f64()
            .map(|v| v * column.multiplier)
            .filter(|v| v.is_finite())
    }

    fn integrate(&mut self, row: &Row) -> f64 {
        let (Some(time), Some(amps)) = (self.scaled(self.time, row), self.scaled(self.amps, row)) else {
            return self.charge.map(|c| c.charge).unwrap_or(0.0);
        };
        let charge = match self.charge {
            Some(prev) => prev.charge + (prev.amps + amps) / 2.0 * (time - prev.time) / 3600.0,
            None => 0.0,
        };
        self.charge = Some(ChargeState { time, amps, charge });
        charge
    }
}

fn native_value(index: usize, column: &PlannedColumn, cell: &Scalar) -> Result<Value> {
    match column.data_type {
        DataType::Float => match cell {
            Scalar::Null => Ok(Value::Null),
            Scalar::Str(s) => bail!(
                "row {}: '{}' in column '{}' is not a number",
                index + 1,
                s,
                column.key
            ),
            other => Ok(Value::from(other.as_f64().unwrap_or(f64::NAN) * column.multiplier)),
        },
        DataType::Int => match cell.as_f64().map(|v| v * column.multiplier) {
            Some(v) if v.is_finite() && v.fract() == 0.0 => Ok(Value::from(v as i64)),
            _ => bail!(
                "row {}: column '{}' needs an integer, found {:?}",
                index + 1,
                column.key,
                cell
            ),
        },
        DataType::Str => Ok(match cell {
            Scalar::Null => Value::String(String::new()),
            Scalar::Str(s) => Value::String(s.clone()),
            other => Value::String(other.to_json().to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycler_harvest_core::wire::ColumnPayload;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn column(source: Source, standard: Option<StandardColumn>, key: &str, data_type: DataType, multiplier: f64) -> PlannedColumn {
        PlannedColumn {
            source,
            key: key.into(),
            standard,
            data_type,
            multiplier,
            header: ColumnPayload {
                column_id: None,
                unit_id: None,
                unit_symbol: Some(String::new()),
                column_name: Some(key.into()),
                data_type,
                values: vec![],
            },
        }
    }

    fn plan() -> UploadPlan {
        UploadPlan {
            columns: vec![
                column(Source::SampleIndex, Some(StandardColumn::SampleNumber), "Sample_number", DataType::Int, 1.0),
                column(Source::Native(0), Some(StandardColumn::ElapsedTime), "Elapsed_time_s", DataType::Float, 1.0),
                column(Source::Native(1), Some(StandardColumn::Amps), "Amps", DataType::Float, 1e-3),
                column(Source::Native(2), None, "State", DataType::Str, 1.0),
                column(Source::IntegratedCharge, Some(StandardColumn::ChargeCapacity), "Charge_capacity", DataType::Float, 1.0),
            ],
            sample_column: None,
        }
    }

    fn rows() -> Vec<Row> {
        vec![
            vec![Scalar::Int(0), Scalar::Float(1000.0), Scalar::Str("C".into())],
            vec![Scalar::Int(1800), Scalar::Float(1000.0), Scalar::Str("C".into())],
            vec![Scalar::Int(3600), Scalar::Float(3000.0), Scalar::Str("C".into())],
            vec![Scalar::Int(7200), Scalar::Float(-1000.0), Scalar::Str("D".into())],
        ]
    }

    #[test]
    fn test_completes_rows_with_integrated_charge() {
        let plan = plan();
        let mut completer = RowCompleter::new(&plan, &UploadInfo::default());
        let out: Vec<Vec<Value>> = rows()
            .iter()
            .enumerate()
            .map(|(i, r)| completer.complete(i, r).unwrap().unwrap())
            .collect();
        assert_eq!(out[0][0], json!(1));
        assert_eq!(out[0][3], json!("C"));
        let charge: Vec<f64> = out.iter().map(|r| r[4].as_f64().unwrap()).collect();
        for (got, want) in charge.iter().zip([0.0, 0.5, 1.5, 2.5]) {
            assert!((got - want).abs() < 1e-9, "{:?}", charge);
        }
    }

    #[test]
    fn test_resumed_completion_matches_uninterrupted() {
        let plan = plan();
        let rows = rows();
        let mut full = RowCompleter::new(&plan, &UploadInfo::default());
        let all: Vec<Vec<Value>> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| full.complete(i, r).unwrap().unwrap())
            .collect();

        let mut last_record = BTreeMap::new();
        for (p, value) in plan.columns.iter().zip(&all[1]) {
            last_record.insert(p.key.clone(), value.clone());
        }
        let stored = UploadInfo {
            columns: vec![],
            last_record_number: Some(2),
            last_record,
        };
        let mut resumed = RowCompleter::new(&plan, &stored);
        let tail: Vec<Vec<Value>> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| resumed.complete(i, r).unwrap())
            .collect();
        assert_eq!(tail, all[2..].to_vec());
    }

    #[test]
    fn test_non_integer_in_int_column_fails() {
        let plan = UploadPlan {
            columns: vec![column(Source::Native(0), Some(StandardColumn::CycleNumber), "Cycle_number", DataType::Int, 1.0)],
            sample_column: None,
        };
        let mut completer = RowCompleter::new(&plan, &UploadInfo::default());
        assert_eq!(
            completer.complete(0, &vec![Scalar::Float(2.0)]).unwrap(),
            Some(vec![json!(2)])
        );
        assert!(completer.complete(1, &vec![Scalar::Float(2.5)]).is_err());
    }
}
