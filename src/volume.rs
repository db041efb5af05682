//! Height ↔ volume conversion over a calibration table.
//!
//! Three-case policy, shared by both directions:
//!
//! ```text
//! query within tolerance of a point  -> that point        (Exact)
//! query between two points           -> linear interp.    (Interpolated)
//! query outside the table            -> linear extrap.    (Extrapolated)
//!                                       from the two nearest points;
//!                                       clamped at zero below, unclamped above
//! ```
//!
//! Tanks can legitimately exceed their nominal maximum transiently, so there is
//! no upper clamp.
//!
//! A fixed-step lookup cache (default 1 mm) is built per table on demand and
//! shared across workers through a [`DashMap`]. Cached queries round to the
//! nearest step; anything outside the table range falls back to the direct
//! calculation.

use crate::calibration::{CalibrationPoint, CalibrationTable};
use crate::config::VolumeConfig;
use crate::registry::TankId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// How a result was obtained from the calibration table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    Exact,
    Interpolated,
    Extrapolated,
}

/// Volume for one height query. Produced per query, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeResult {
    pub volume_m3: f64,
    pub volume_liters: f64,
    /// `true` unless the query hit a calibration point
    pub interpolated: bool,
    pub accuracy: Accuracy,
}

impl VolumeResult {
    fn new(volume_liters: f64, accuracy: Accuracy) -> Self {
        Self {
            volume_m3: volume_liters / 1000.0,
            volume_liters,
            interpolated: accuracy != Accuracy::Exact,
            accuracy,
        }
    }

    pub fn is_extrapolated(&self) -> bool {
        self.accuracy == Accuracy::Extrapolated
    }
}

/// Height for one volume query
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeightResult {
    pub height_mm: f64,
    pub accuracy: Accuracy,
}

/// Straight line through `(x0, y0)` and `(x1, y1)` evaluated at `x`.
/// A vertical segment yields `y0`.
pub(crate) fn linear(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    let dx = x1 - x0;
    if dx == 0.0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / dx
}

struct LookupCache {
    fingerprint: u64,
    min_height: f64,
    max_height: f64,
    step: f64,
    entries: Vec<VolumeResult>,
}

impl LookupCache {
    fn get(&self, height_mm: f64) -> Option<VolumeResult> {
        if !height_mm.is_finite() || height_mm < self.min_height || height_mm > self.max_height {
            return None;
        }
        let index = ((height_mm - self.min_height) / self.step).round() as usize;
        self.entries.get(index).copied()
    }
}

/// Stateless apart from the lookup cache; one instance serves every tank.
pub struct VolumeCalculator {
    exact_tolerance: f64,
    cache_step_mm: f64,
    max_cache_entries: usize,
    cache: DashMap<TankId, Arc<LookupCache>>,
}

impl VolumeCalculator {
    pub fn new(config: &VolumeConfig) -> Self {
        Self {
            exact_tolerance: config.exact_match_tolerance,
            cache_step_mm: config.cache_step_mm,
            max_cache_entries: config.max_cache_entries,
            cache: DashMap::new(),
        }
    }

    /// Volume contained at `height_mm`, computed directly from the table.
    pub fn volume_from_height(&self, height_mm: f64, table: &CalibrationTable) -> VolumeResult {
        let points = table.points();

        if let Some(point) = points
            .iter()
            .find(|p| (p.height_mm - height_mm).abs() <= self.exact_tolerance)
        {
            return VolumeResult::new(point.volume_liters, Accuracy::Exact);
        }

        let first = points[0];
        let last = points[points.len() - 1];

        if height_mm < first.height_mm {
            let volume = if points.len() >= 2 {
                let second = points[1];
                linear(
                    first.height_mm,
                    first.volume_liters,
                    second.height_mm,
                    second.volume_liters,
                    height_mm,
                )
                .max(0.0)
            } else {
                first.volume_liters
            };
            return VolumeResult::new(volume, Accuracy::Extrapolated);
        }

        if height_mm > last.height_mm {
            let volume = if points.len() >= 2 {
                let before = points[points.len() - 2];
                linear(
                    before.height_mm,
                    before.volume_liters,
                    last.height_mm,
                    last.volume_liters,
                    height_mm,
                )
            } else {
                last.volume_liters
            };
            return VolumeResult::new(volume, Accuracy::Extrapolated);
        }

        let upper = points.partition_point(|p| p.height_mm <= height_mm);
        if upper == 0 || upper >= points.len() {
            // Only reachable with a non-finite query
            return VolumeResult::new(first.volume_liters, Accuracy::Extrapolated);
        }
        let (lo, hi) = (points[upper - 1], points[upper]);
        let volume = linear(lo.height_mm, lo.volume_liters, hi.height_mm, hi.volume_liters, height_mm);
        VolumeResult::new(volume, Accuracy::Interpolated)
    }

    /// Inverse of [`volume_from_height`](Self::volume_from_height), sorted by volume.
    pub fn height_from_volume(&self, volume_liters: f64, table: &CalibrationTable) -> HeightResult {
        let mut points: Vec<CalibrationPoint> = table.points().to_vec();
        points.sort_by(|a, b| a.volume_liters.total_cmp(&b.volume_liters));

        if let Some(point) = points
            .iter()
            .find(|p| (p.volume_liters - volume_liters).abs() <= self.exact_tolerance)
        {
            return HeightResult {
                height_mm: point.height_mm,
                accuracy: Accuracy::Exact,
            };
        }

        let first = points[0];
        let last = points[points.len() - 1];

        let extrapolated = |height_mm: f64| HeightResult {
            height_mm,
            accuracy: Accuracy::Extrapolated,
        };

        if volume_liters < first.volume_liters {
            if points.len() < 2 {
                return extrapolated(first.height_mm);
            }
            let second = points[1];
            let height = linear(
                first.volume_liters,
                first.height_mm,
                second.volume_liters,
                second.height_mm,
                volume_liters,
            );
            return extrapolated(height.max(0.0));
        }

        if volume_liters > last.volume_liters {
            if points.len() < 2 {
                return extrapolated(last.height_mm);
            }
            let before = points[points.len() - 2];
            return extrapolated(linear(
                before.volume_liters,
                before.height_mm,
                last.volume_liters,
                last.height_mm,
                volume_liters,
            ));
        }

        let upper = points.partition_point(|p| p.volume_liters <= volume_liters);
        if upper == 0 || upper >= points.len() {
            return extrapolated(first.height_mm);
        }
        let (lo, hi) = (points[upper - 1], points[upper]);
        HeightResult {
            height_mm: linear(lo.volume_liters, lo.height_mm, hi.volume_liters, hi.height_mm, volume_liters),
            accuracy: Accuracy::Interpolated,
        }
    }

    /// Volume via the per-table lookup cache, building it on first use.
    ///
    /// Queries outside the table range, or tables too large to cache, use the
    /// direct calculation.
    pub fn cached_volume_from_height(&self, height_mm: f64, table: &CalibrationTable) -> VolumeResult {
        match self.cache_for(table).and_then(|cache| cache.get(height_mm)) {
            Some(result) => {
                trace!("Volume cache hit for tank {} at {} mm", table.tank_id(), height_mm);
                result
            }
            None => self.volume_from_height(height_mm, table),
        }
    }

    /// Drop the cached lookup for one tank (called on calibration re-import)
    pub fn invalidate(&self, tank_id: &TankId) {
        self.cache.remove(tank_id);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_tables(&self) -> usize {
        self.cache.len()
    }

    fn cache_for(&self, table: &CalibrationTable) -> Option<Arc<LookupCache>> {
        let existing = self.cache.get(table.tank_id()).map(|entry| entry.value().clone());
        if let Some(cache) = existing {
            if cache.fingerprint == table.fingerprint() {
                return Some(cache);
            }
        }

        let cache = Arc::new(self.build_cache(table)?);
        self.cache.insert(table.tank_id().clone(), cache.clone());
        Some(cache)
    }

    fn build_cache(&self, table: &CalibrationTable) -> Option<LookupCache> {
        if self.cache_step_mm <= 0.0 {
            return None;
        }
        let span = table.max_height() - table.min_height();
        let slots = (span / self.cache_step_mm).floor() + 1.0;
        if !slots.is_finite() || slots > self.max_cache_entries as f64 {
            debug!(
                "Calibration for tank {} needs {} cache entries (limit {}), using direct lookup",
                table.tank_id(),
                slots,
                self.max_cache_entries
            );
            return None;
        }
        let count = slots as usize;

        let entries = (0..count)
            .map(|i| {
                let height = table.min_height() + i as f64 * self.cache_step_mm;
                self.volume_from_height(height, table)
            })
            .collect();

        debug!("Built {}-entry volume cache for tank {}", count, table.tank_id());
        Some(LookupCache {
            fingerprint: table.fingerprint(),
            min_height: table.min_height(),
            max_height: table.max_height(),
            step: self.cache_step_mm,
            entries,
        })
    }
}

impl Default for VolumeCalculator {
    fn default() -> Self {
        Self::new(&VolumeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CalibrationTable {
        CalibrationTable::from_pairs("T1", &[(0.0, 0.0), (100.0, 750.0), (200.0, 1500.0)]).unwrap()
    }

    #[test]
    fn test_reference_table_cases() {
        let calc = VolumeCalculator::default();
        let table = table();

        let mid = calc.volume_from_height(50.0, &table);
        assert_eq!(mid.volume_liters, 375.0);
        assert_eq!(mid.accuracy, Accuracy::Interpolated);
        assert!(mid.interpolated);

        let exact = calc.volume_from_height(100.0, &table);
        assert_eq!(exact.volume_liters, 750.0);
        assert_eq!(exact.accuracy, Accuracy::Exact);
        assert!(!exact.interpolated);

        let above = calc.volume_from_height(250.0, &table);
        assert!(above.volume_liters > 1500.0);
        assert_eq!(above.volume_liters, 1875.0);
        assert_eq!(above.accuracy, Accuracy::Extrapolated);
        assert_eq!(above.volume_m3, 1.875);
    }

    #[test]
    fn test_exact_match_tolerance() {
        let calc = VolumeCalculator::default();
        let result = calc.volume_from_height(100.05, &table());
        assert_eq!(result.accuracy, Accuracy::Exact);
        assert_eq!(result.volume_liters, 750.0);

        let result = calc.volume_from_height(100.5, &table());
        assert_eq!(result.accuracy, Accuracy::Interpolated);
    }

    #[test]
    fn test_below_minimum_clamps_to_zero() {
        let calc = VolumeCalculator::default();
        let table =
            CalibrationTable::from_pairs("T1", &[(100.0, 500.0), (200.0, 1500.0)]).unwrap();

        let result = calc.volume_from_height(80.0, &table);
        assert_eq!(result.accuracy, Accuracy::Extrapolated);
        assert_eq!(result.volume_liters, 300.0);

        let result = calc.volume_from_height(10.0, &table);
        assert_eq!(result.volume_liters, 0.0);
    }

    #[test]
    fn test_single_point_table() {
        let calc = VolumeCalculator::default();
        let table = CalibrationTable::from_pairs("T1", &[(100.0, 500.0)]).unwrap();
        assert_eq!(calc.volume_from_height(20.0, &table).volume_liters, 500.0);
        assert_eq!(calc.volume_from_height(300.0, &table).volume_liters, 500.0);
        assert_eq!(
            calc.volume_from_height(300.0, &table).accuracy,
            Accuracy::Extrapolated
        );
    }

    #[test]
    fn test_height_from_volume_mirrors_policy() {
        let calc = VolumeCalculator::default();
        let table = table();

        let h = calc.height_from_volume(375.0, &table);
        assert_eq!(h.height_mm, 50.0);
        assert_eq!(h.accuracy, Accuracy::Interpolated);

        let h = calc.height_from_volume(1500.0, &table);
        assert_eq!(h.height_mm, 200.0);
        assert_eq!(h.accuracy, Accuracy::Exact);

        let h = calc.height_from_volume(1875.0, &table);
        assert_eq!(h.height_mm, 250.0);
        assert_eq!(h.accuracy, Accuracy::Extrapolated);

        let offset =
            CalibrationTable::from_pairs("T2", &[(100.0, 500.0), (200.0, 1500.0)]).unwrap();
        let h = calc.height_from_volume(0.0, &offset);
        assert_eq!(h.height_mm, 50.0);
        let h = calc.height_from_volume(-10_000.0, &offset);
        assert_eq!(h.height_mm, 0.0);
    }

    #[test]
    fn test_cache_matches_direct_on_grid() {
        let calc = VolumeCalculator::default();
        let table = table();

        for height in [0.0, 1.0, 50.0, 99.0, 100.0, 150.0, 200.0] {
            assert_eq!(
                calc.cached_volume_from_height(height, &table),
                calc.volume_from_height(height, &table)
            );
        }
        assert_eq!(calc.cached_tables(), 1);

        // Rounds to nearest step
        let rounded = calc.cached_volume_from_height(50.3, &table);
        assert_eq!(rounded.volume_liters, 375.0);

        // Outside the table falls back to direct extrapolation
        let above = calc.cached_volume_from_height(250.0, &table);
        assert_eq!(above.volume_liters, 1875.0);
    }

    #[test]
    fn test_cache_rebuilt_on_reimport() {
        let calc = VolumeCalculator::default();
        let original = table();
        assert_eq!(calc.cached_volume_from_height(100.0, &original).volume_liters, 750.0);

        let reimported =
            CalibrationTable::from_pairs("T1", &[(0.0, 0.0), (100.0, 800.0), (200.0, 1600.0)])
                .unwrap();
        assert_eq!(calc.cached_volume_from_height(100.0, &reimported).volume_liters, 800.0);
        assert_eq!(calc.cached_tables(), 1);

        calc.invalidate(reimported.tank_id());
        assert_eq!(calc.cached_tables(), 0);
    }

    #[test]
    fn test_oversized_table_not_cached() {
        let config = VolumeConfig {
            max_cache_entries: 10,
            ..VolumeConfig::default()
        };
        let calc = VolumeCalculator::new(&config);
        let result = calc.cached_volume_from_height(50.0, &table());
        assert_eq!(result.volume_liters, 375.0);
        assert_eq!(calc.cached_tables(), 0);
    }

    #[test]
    fn test_tiny_cache_step_uses_direct_lookup() {
        for step in [1e-300, f64::MIN_POSITIVE] {
            let config = VolumeConfig {
                cache_step_mm: step,
                ..VolumeConfig::default()
            };
            let calc = VolumeCalculator::new(&config);
            assert_eq!(calc.cached_volume_from_height(50.0, &table()).volume_liters, 375.0);
            assert_eq!(calc.cached_tables(), 0);
        }
    }
}
