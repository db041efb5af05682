//! Per-tank calibration tables.
//!
//! A calibration table maps sensor height (mm) to contained volume (litres),
//! established by physical gauging. Tables are produced by an external import
//! pipeline and replaced wholesale on re-import; once built they are immutable.

use crate::error::{DataQualityWarning, Result, TankError};
use crate::registry::TankId;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::warn;

/// Tables with fewer points than this are reported as sparse
pub const MIN_RECOMMENDED_POINTS: usize = 10;

/// One gauged `(height, volume)` pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Sensor height in millimetres
    pub height_mm: f64,
    /// Contained volume in litres
    pub volume_liters: f64,
}

impl CalibrationPoint {
    pub fn new(height_mm: f64, volume_liters: f64) -> Self {
        Self {
            height_mm,
            volume_liters,
        }
    }
}

impl From<(f64, f64)> for CalibrationPoint {
    fn from((height_mm, volume_liters): (f64, f64)) -> Self {
        Self::new(height_mm, volume_liters)
    }
}

/// Ordered, validated calibration curve for a single tank.
///
/// Invariant: heights are strictly increasing. Volumes should be
/// non-decreasing; a violation is recorded as a warning, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationTable {
    tank_id: TankId,
    points: Vec<CalibrationPoint>,
    fingerprint: u64,
}

impl CalibrationTable {
    /// Build a table from imported points, sorting by height.
    pub fn new(tank_id: impl Into<TankId>, points: impl IntoIterator<Item = CalibrationPoint>) -> Result<Self> {
        let tank_id = tank_id.into();
        let mut points: Vec<CalibrationPoint> = points.into_iter().collect();

        if points.is_empty() {
            return Err(TankError::Validation(format!(
                "calibration table for tank {} has no points",
                tank_id
            )));
        }

        if let Some(bad) = points
            .iter()
            .find(|p| !p.height_mm.is_finite() || !p.volume_liters.is_finite())
        {
            return Err(TankError::Validation(format!(
                "calibration table for tank {} contains non-finite point ({}, {})",
                tank_id, bad.height_mm, bad.volume_liters
            )));
        }

        points.sort_by(|a, b| a.height_mm.total_cmp(&b.height_mm));

        for pair in points.windows(2) {
            if pair[1].height_mm <= pair[0].height_mm {
                return Err(TankError::Validation(format!(
                    "calibration table for tank {} has duplicate height {} mm",
                    tank_id, pair[1].height_mm
                )));
            }
        }

        let fingerprint = fingerprint(&tank_id, &points);
        let table = Self {
            tank_id,
            points,
            fingerprint,
        };

        for warning in table.quality_warnings() {
            warn!("Calibration for tank {}: {}", table.tank_id, warning);
        }

        Ok(table)
    }

    /// Convenience constructor from raw `(height_mm, volume_liters)` pairs
    pub fn from_pairs(tank_id: impl Into<TankId>, pairs: &[(f64, f64)]) -> Result<Self> {
        Self::new(tank_id, pairs.iter().copied().map(CalibrationPoint::from))
    }

    pub fn tank_id(&self) -> &TankId {
        &self.tank_id
    }

    /// Points sorted by ascending height
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Content hash; changes whenever the table is re-imported with different data.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn min_height(&self) -> f64 {
        self.points[0].height_mm
    }

    pub fn max_height(&self) -> f64 {
        self.points[self.points.len() - 1].height_mm
    }

    /// Non-fatal data-quality findings for this table
    pub fn quality_warnings(&self) -> Vec<DataQualityWarning> {
        let mut warnings = Vec::new();

        if self.points.len() < MIN_RECOMMENDED_POINTS {
            warnings.push(DataQualityWarning::SparseCalibration {
                points: self.points.len(),
                recommended: MIN_RECOMMENDED_POINTS,
            });
        }

        for pair in self.points.windows(2) {
            if pair[1].volume_liters < pair[0].volume_liters {
                warnings.push(DataQualityWarning::NonMonotonicVolume {
                    height_mm: pair[1].height_mm,
                });
            }
        }

        warnings
    }
}

fn fingerprint(tank_id: &TankId, points: &[CalibrationPoint]) -> u64 {
    let mut hasher = DefaultHasher::new();
    tank_id.hash(&mut hasher);
    for point in points {
        point.height_mm.to_bits().hash(&mut hasher);
        point.volume_liters.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_sorted_by_height() {
        let table =
            CalibrationTable::from_pairs("T1", &[(200.0, 1500.0), (0.0, 0.0), (100.0, 750.0)])
                .unwrap();
        let heights: Vec<f64> = table.points().iter().map(|p| p.height_mm).collect();
        assert_eq!(heights, vec![0.0, 100.0, 200.0]);
        assert_eq!(table.min_height(), 0.0);
        assert_eq!(table.max_height(), 200.0);
    }

    #[test]
    fn test_rejects_empty_and_duplicate_heights() {
        assert!(matches!(
            CalibrationTable::from_pairs("T1", &[]),
            Err(TankError::Validation(_))
        ));
        assert!(matches!(
            CalibrationTable::from_pairs("T1", &[(10.0, 1.0), (10.0, 2.0)]),
            Err(TankError::Validation(_))
        ));
        assert!(matches!(
            CalibrationTable::from_pairs("T1", &[(f64::NAN, 1.0)]),
            Err(TankError::Validation(_))
        ));
    }

    #[test]
    fn test_quality_warnings() {
        let table =
            CalibrationTable::from_pairs("T1", &[(0.0, 0.0), (100.0, 800.0), (200.0, 750.0)])
                .unwrap();
        let warnings = table.quality_warnings();
        assert!(warnings.contains(&DataQualityWarning::SparseCalibration {
            points: 3,
            recommended: MIN_RECOMMENDED_POINTS
        }));
        assert!(warnings.contains(&DataQualityWarning::NonMonotonicVolume { height_mm: 200.0 }));

        let dense: Vec<(f64, f64)> = (0..12).map(|i| (i as f64 * 10.0, i as f64 * 75.0)).collect();
        let table = CalibrationTable::from_pairs("T2", &dense).unwrap();
        assert!(table.quality_warnings().is_empty());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = CalibrationTable::from_pairs("T1", &[(0.0, 0.0), (100.0, 750.0)]).unwrap();
        let b = CalibrationTable::from_pairs("T1", &[(100.0, 750.0), (0.0, 0.0)]).unwrap();
        let c = CalibrationTable::from_pairs("T1", &[(0.0, 0.0), (100.0, 760.0)]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
