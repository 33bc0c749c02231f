//! Millilitre and US fluid ounce conversions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ML_TO_OZ: f64 = 0.033_814;
const OZ_TO_ML: f64 = 29.5735;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("unknown volume unit: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeUnit {
    #[default]
    Ml,
    Oz,
}

impl VolumeUnit {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ml => "ml",
            Self::Oz => "oz",
        }
    }
}

impl fmt::Display for VolumeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeUnit {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ml" => Ok(Self::Ml),
            "oz" => Ok(Self::Oz),
            other => Err(UnitError::Unknown(other.to_string())),
        }
    }
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Rounded to one decimal place. Non-positive and non-finite input yields 0.
#[must_use]
pub fn ml_to_oz(ml: f64) -> f64 {
    if !ml.is_finite() || ml <= 0.0 {
        return 0.0;
    }
    round_to_tenth(ml * ML_TO_OZ)
}

/// Rounded to a whole millilitre. Non-positive and non-finite input yields 0.
#[must_use]
pub fn oz_to_ml(oz: f64) -> f64 {
    if !oz.is_finite() || oz <= 0.0 {
        return 0.0;
    }
    (oz * OZ_TO_ML).round()
}

#[must_use]
pub fn convert_volume(volume: f64, from: VolumeUnit, to: VolumeUnit) -> f64 {
    match (from, to) {
        (VolumeUnit::Ml, VolumeUnit::Oz) => ml_to_oz(volume),
        (VolumeUnit::Oz, VolumeUnit::Ml) => oz_to_ml(volume),
        _ => volume,
    }
}

/// Ounces keep one decimal, millilitres are shown whole.
#[must_use]
pub fn format_volume(value: f64, unit: VolumeUnit) -> String {
    if !value.is_finite() || value < 0.0 {
        return "0".into();
    }
    match unit {
        VolumeUnit::Oz => format!("{value:.1}"),
        VolumeUnit::Ml => format!("{}", value.round()),
    }
}

/// Lenient parse of user input. Invalid or negative input yields 0.
#[must_use]
pub fn parse_volume(value: &str, unit: VolumeUnit) -> f64 {
    let parsed = match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => v,
        _ => return 0.0,
    };
    match unit {
        VolumeUnit::Oz => round_to_tenth(parsed),
        VolumeUnit::Ml => parsed.round(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_conversions() {
        assert!((ml_to_oz(250.0) - 8.5).abs() < 1e-9);
        assert!((ml_to_oz(500.0) - 16.9).abs() < 1e-9);
        assert!((oz_to_ml(8.5) - 251.0).abs() < 1e-9);
        assert!((oz_to_ml(16.9) - 500.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_input_is_zero() {
        assert_eq!(ml_to_oz(0.0), 0.0);
        assert_eq!(ml_to_oz(-100.0), 0.0);
        assert_eq!(oz_to_ml(-10.0), 0.0);
        assert_eq!(oz_to_ml(f64::NAN), 0.0);
    }

    #[test]
    fn formatting() {
        assert_eq!(format_volume(250.4, VolumeUnit::Ml), "250");
        assert_eq!(format_volume(8.45, VolumeUnit::Oz), "8.4");
        assert_eq!(format_volume(8.0, VolumeUnit::Oz), "8.0");
        assert_eq!(format_volume(-3.0, VolumeUnit::Ml), "0");
    }

    #[test]
    fn parsing() {
        assert_eq!(parse_volume(" 250.6 ", VolumeUnit::Ml), 251.0);
        assert!((parse_volume("8.46", VolumeUnit::Oz) - 8.5).abs() < 1e-9);
        assert_eq!(parse_volume("abc", VolumeUnit::Ml), 0.0);
        assert_eq!(parse_volume("-5", VolumeUnit::Oz), 0.0);
    }

    #[test]
    fn convert_same_unit_is_identity() {
        assert_eq!(convert_volume(123.0, VolumeUnit::Ml, VolumeUnit::Ml), 123.0);
        assert!((convert_volume(250.0, VolumeUnit::Ml, VolumeUnit::Oz) - 8.5).abs() < 1e-9);
    }

    #[test]
    fn unit_parses_from_str() {
        assert_eq!("OZ".parse::<VolumeUnit>(), Ok(VolumeUnit::Oz));
        assert_eq!(
            "cups".parse::<VolumeUnit>(),
            Err(UnitError::Unknown("cups".into()))
        );
    }

    proptest! {
        #[test]
        fn ml_round_trip_within_rounding(ml in 1u32..=5000) {
            let back = oz_to_ml(ml_to_oz(f64::from(ml)));
            prop_assert!((back - f64::from(ml)).abs() <= 2.0);
        }

        #[test]
        fn oz_round_trip_within_rounding(tenths in 1u32..=1700) {
            let oz = f64::from(tenths) / 10.0;
            let back = ml_to_oz(oz_to_ml(oz));
            prop_assert!((back - oz).abs() <= 0.1 + 1e-9);
        }
    }
}
