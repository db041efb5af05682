//! Product-specific temperature correction tables.
//!
//! An alternative to the ASTM 54B formula for products whose supplier
//! publishes a factor table. Lookup follows the calibration policy: linear
//! interpolation inside the table and linear extrapolation from the two
//! nearest entries outside it, with the factor clamped to stay positive.

use crate::error::{Result, TankError};
use crate::volume::linear;
use serde::{Deserialize, Serialize};

/// Smallest factor an extrapolated lookup may return
const MIN_FACTOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEntry {
    pub temperature_c: f64,
    pub factor: f64,
}

/// Temperature → volume correction factor, sorted by temperature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCorrectionTable")]
pub struct CorrectionTable {
    id: String,
    entries: Vec<CorrectionEntry>,
}

#[derive(Deserialize)]
struct RawCorrectionTable {
    id: String,
    entries: Vec<CorrectionEntry>,
}

impl TryFrom<RawCorrectionTable> for CorrectionTable {
    type Error = TankError;

    fn try_from(raw: RawCorrectionTable) -> Result<Self> {
        Self::new(raw.id, raw.entries)
    }
}

impl CorrectionTable {
    pub fn new(id: impl Into<String>, entries: impl IntoIterator<Item = CorrectionEntry>) -> Result<Self> {
        let id = id.into();
        let mut entries: Vec<CorrectionEntry> = entries.into_iter().collect();

        if entries.is_empty() {
            return Err(TankError::Validation(format!("correction table '{}' is empty", id)));
        }
        if entries
            .iter()
            .any(|e| !e.temperature_c.is_finite() || !(e.factor > 0.0) || !e.factor.is_finite())
        {
            return Err(TankError::Validation(format!(
                "correction table '{}' contains a non-finite temperature or non-positive factor",
                id
            )));
        }

        entries.sort_by(|a, b| a.temperature_c.total_cmp(&b.temperature_c));
        if entries.windows(2).any(|w| w[0].temperature_c == w[1].temperature_c) {
            return Err(TankError::Validation(format!(
                "correction table '{}' has duplicate temperatures",
                id
            )));
        }

        Ok(Self { id, entries })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entries(&self) -> &[CorrectionEntry] {
        &self.entries
    }

    /// Correction factor at `temperature_c`
    pub fn factor_at(&self, temperature_c: f64) -> Result<f64> {
        if !temperature_c.is_finite() {
            return Err(TankError::Validation(format!(
                "temperature {} is not finite",
                temperature_c
            )));
        }

        let entries = &self.entries;
        if entries.len() == 1 {
            return Ok(entries[0].factor);
        }

        let upper = entries.partition_point(|e| e.temperature_c <= temperature_c);
        let (lo, hi) = match upper {
            0 => (entries[0], entries[1]),
            n if n >= entries.len() => (entries[n - 2], entries[n - 1]),
            n => (entries[n - 1], entries[n]),
        };

        let factor = linear(lo.temperature_c, lo.factor, hi.temperature_c, hi.factor, temperature_c);
        Ok(factor.max(MIN_FACTOR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CorrectionTable {
        CorrectionTable::new(
            "diesel-supplier",
            [
                CorrectionEntry { temperature_c: 15.0, factor: 1.0 },
                CorrectionEntry { temperature_c: 25.0, factor: 0.99 },
                CorrectionEntry { temperature_c: 5.0, factor: 1.01 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_interpolates_between_entries() {
        let table = table();
        assert_eq!(table.factor_at(15.0).unwrap(), 1.0);
        assert!((table.factor_at(20.0).unwrap() - 0.995).abs() < 1e-12);
        assert!((table.factor_at(10.0).unwrap() - 1.005).abs() < 1e-12);
    }

    #[test]
    fn test_extrapolates_outside_range() {
        let table = table();
        assert!((table.factor_at(35.0).unwrap() - 0.98).abs() < 1e-12);
        assert!((table.factor_at(-5.0).unwrap() - 1.02).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(CorrectionTable::new("empty", []).is_err());
        assert!(CorrectionTable::new(
            "neg",
            [CorrectionEntry { temperature_c: 15.0, factor: -1.0 }]
        )
        .is_err());
        assert!(CorrectionTable::new(
            "dup",
            [
                CorrectionEntry { temperature_c: 15.0, factor: 1.0 },
                CorrectionEntry { temperature_c: 15.0, factor: 0.9 },
            ]
        )
        .is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let yaml = "id: t\nentries:\n  - { temperature_c: 30, factor: 0.98 }\n  - { temperature_c: 10, factor: 1.0 }\n";
        let table: CorrectionTable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.entries()[0].temperature_c, 10.0);

        let bad = "id: t\nentries: []\n";
        assert!(serde_yaml::from_str::<CorrectionTable>(bad).is_err());
    }
}
