//! Standard unit and column-type catalogue plus unit conversion.
//!
//! The server seeds these definitions into its store at migration time and
//! hands them to harvesters with their configuration. Readers map native
//! column names onto [`StandardColumn`]s; the harvester then resolves each
//! standard column to the server's id by name.

use crate::models::DataType;

/// Standard units as `(symbol, name)`.
pub const STANDARD_UNITS: &[(&str, &str)] = &[
    ("", "Unitless"),
    ("s", "Time"),
    ("V", "Volts"),
    ("A", "Amps"),
    ("Ah", "Amp hours"),
    ("Wh", "Watt hours"),
    ("W", "Watts"),
    ("degC", "Celsius"),
    ("Ohm", "Ohms"),
];

/// Canonical columns every harvester and the server agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StandardColumn {
    SampleNumber,
    ElapsedTime,
    Volts,
    Amps,
    ChargeCapacity,
    EnergyCapacity,
    Temperature,
    Power,
    StepNumber,
    CycleNumber,
}

impl StandardColumn {
    pub const ALL: [StandardColumn; 10] = [
        StandardColumn::SampleNumber,
        StandardColumn::ElapsedTime,
        StandardColumn::Volts,
        StandardColumn::Amps,
        StandardColumn::ChargeCapacity,
        StandardColumn::EnergyCapacity,
        StandardColumn::Temperature,
        StandardColumn::Power,
        StandardColumn::StepNumber,
        StandardColumn::CycleNumber,
    ];

    /// Catalogue name, also used as the column name when synthesised.
    pub fn name(&self) -> &'static str {
        match self {
            StandardColumn::SampleNumber => "Sample_number",
            StandardColumn::ElapsedTime => "Elapsed_time_s",
            StandardColumn::Volts => "Volts",
            StandardColumn::Amps => "Amps",
            StandardColumn::ChargeCapacity => "Charge_capacity",
            StandardColumn::EnergyCapacity => "Energy_capacity",
            StandardColumn::Temperature => "Temperature",
            StandardColumn::Power => "Power",
            StandardColumn::StepNumber => "Step_number",
            StandardColumn::CycleNumber => "Cycle_number",
        }
    }

    pub fn unit_symbol(&self) -> &'static str {
        match self {
            StandardColumn::SampleNumber
            | StandardColumn::StepNumber
            | StandardColumn::CycleNumber => "",
            StandardColumn::ElapsedTime => "s",
            StandardColumn::Volts => "V",
            StandardColumn::Amps => "A",
            StandardColumn::ChargeCapacity => "Ah",
            StandardColumn::EnergyCapacity => "Wh",
            StandardColumn::Temperature => "degC",
            StandardColumn::Power => "W",
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            StandardColumn::SampleNumber
            | StandardColumn::StepNumber
            | StandardColumn::CycleNumber => DataType::Int,
            _ => DataType::Float,
        }
    }

    /// Required columns must be present (or derivable) for an import to succeed.
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            StandardColumn::SampleNumber
                | StandardColumn::ElapsedTime
                | StandardColumn::Volts
                | StandardColumn::Amps
        )
    }

    pub fn from_name(name: &str) -> Option<StandardColumn> {
        StandardColumn::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Map a unit alias onto the catalogue symbol, e.g. `"mA.h"` → `"mAh"`.
pub fn normalise_unit(symbol: &str) -> &str {
    match symbol.trim() {
        "sec" | "secs" | "Sec" => "s",
        "mA.h" | "mA h" | "mA·h" => "mAh",
        "A.h" | "A h" | "A-hr" | "Amp-hr" => "Ah",
        "mW.h" | "mW h" => "mWh",
        "W.h" | "W h" | "W-hr" | "Watt-hr" => "Wh",
        "µA" | "μA" => "uA",
        "°C" | "degree C" | "deg C" => "degC",
        "Ω" | "ohm" | "Ohms" => "Ohm",
        other => other,
    }
}

/// Multiplier that converts a value in `from` into `to`, if known.
///
/// Identity conversions (after alias normalisation) return `1.0`.
pub fn conversion_multiplier(from: &str, to: &str) -> Option<f64> {
    let from = normalise_unit(from);
    let to = normalise_unit(to);
    if from == to {
        return Some(1.0);
    }
    let factor = match (from, to) {
        ("ms", "s") => 1e-3,
        ("min", "s") => 60.0,
        ("h", "s") => 3600.0,
        ("mV", "V") => 1e-3,
        ("mA", "A") => 1e-3,
        ("uA", "A") => 1e-6,
        ("mAh", "Ah") => 1e-3,
        ("mWh", "Wh") => 1e-3,
        ("kW", "W") => 1e3,
        ("mW", "W") => 1e-3,
        _ => return None,
    };
    Some(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_standard_column_unit_is_a_standard_unit() {
        for column in StandardColumn::ALL {
            assert!(
                STANDARD_UNITS
                    .iter()
                    .any(|(symbol, _)| *symbol == column.unit_symbol()),
                "{} has no standard unit",
                column.name()
            );
            assert_eq!(StandardColumn::from_name(column.name()), Some(column));
        }
    }

    #[test]
    fn test_conversion_multipliers() {
        assert_eq!(conversion_multiplier("mA", "A"), Some(1e-3));
        assert_eq!(conversion_multiplier("mA.h", "Ah"), Some(1e-3));
        assert_eq!(conversion_multiplier("°C", "degC"), Some(1.0));
        assert_eq!(conversion_multiplier("V", "V"), Some(1.0));
        assert_eq!(conversion_multiplier("h", "s"), Some(3600.0));
        assert_eq!(conversion_multiplier("V", "A"), None);
    }

    #[test]
    fn test_required_columns() {
        let required: Vec<_> = StandardColumn::ALL
            .into_iter()
            .filter(|c| c.is_required())
            .map(|c| c.name())
            .collect();
        assert_eq!(
            required,
            vec!["Sample_number", "Elapsed_time_s", "Volts", "Amps"]
        );
    }
}
