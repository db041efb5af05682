//! Mass from volume, with optional temperature correction.
//!
//! Exactly one correction path applies per product, chosen by its
//! [`CorrectionSource`]:
//!
//! - `Astm54b`: density corrected by the ASTM 54B VCF, mass via
//!   [`calculate_metric_tons`] (rounded to 3 decimals)
//! - `Table`: density scaled by the factor from a registered
//!   [`CorrectionTable`]
//! - none, or no temperature reading: `volume_m3 · density / 1000`

use crate::astm::{self, calculate_metric_tons, calculate_vcf};
use crate::catalog::{CorrectionSource, Product};
use crate::correction::CorrectionTable;
use crate::error::{DataQualityWarning, Result, TankError};
use crate::volume::VolumeResult;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Plausible density band for any stored liquid (kg/m³)
pub const PLAUSIBLE_DENSITY_MIN: f64 = 500.0;
pub const PLAUSIBLE_DENSITY_MAX: f64 = 2000.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MassResult {
    pub mass_metric_tons: f64,
    /// Density actually applied, after any correction (kg/m³)
    pub density_used: f64,
    pub temperature_corrected: bool,
    pub astm_correction_applied: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DataQualityWarning>,
}

impl MassResult {
    fn uncorrected(volume: &VolumeResult, density: f64) -> Self {
        Self {
            mass_metric_tons: volume.volume_m3 * density / 1000.0,
            density_used: density,
            temperature_corrected: false,
            astm_correction_applied: false,
            warnings: Vec::new(),
        }
    }
}

/// Aggregate over a set of tanks
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MassSummary {
    pub total_mass_tons: f64,
    /// Arithmetic mean of the densities used
    pub average_density: f64,
    pub corrected_count: usize,
    pub tank_count: usize,
}

#[derive(Debug, Default)]
pub struct MassCalculator {
    correction_tables: HashMap<String, CorrectionTable>,
}

impl MassCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a correction table under its id
    pub fn register_table(&mut self, table: CorrectionTable) {
        debug!("Registered correction table '{}'", table.id());
        self.correction_tables.insert(table.id().to_string(), table);
    }

    pub fn table(&self, id: &str) -> Option<&CorrectionTable> {
        self.correction_tables.get(id)
    }

    /// Mass for one tank. Data-quality findings are attached to the result.
    pub fn mass_from_volume(
        &self,
        volume: &VolumeResult,
        base_density: f64,
        temperature_c: Option<f64>,
        product: Option<&Product>,
    ) -> Result<MassResult> {
        if !base_density.is_finite() || base_density <= 0.0 {
            return Err(TankError::Validation(format!(
                "density {} must be positive",
                base_density
            )));
        }

        let source = product.and_then(Product::correction_source);
        let mut result = match (temperature_c, source) {
            (Some(temperature), Some(CorrectionSource::Astm54b)) => {
                let vcf = calculate_vcf(base_density, temperature)?;
                MassResult {
                    mass_metric_tons: calculate_metric_tons(volume.volume_liters, base_density, temperature)?,
                    density_used: base_density * vcf,
                    temperature_corrected: true,
                    astm_correction_applied: true,
                    warnings: Vec::new(),
                }
            }
            (Some(temperature), Some(CorrectionSource::Table { id })) => match self.table(id) {
                Some(table) => {
                    let density = base_density * table.factor_at(temperature)?;
                    MassResult {
                        mass_metric_tons: volume.volume_m3 * density / 1000.0,
                        density_used: density,
                        temperature_corrected: true,
                        astm_correction_applied: false,
                        warnings: Vec::new(),
                    }
                }
                None => {
                    warn!("Correction table '{}' not registered, mass left uncorrected", id);
                    let mut result = MassResult::uncorrected(volume, base_density);
                    result
                        .warnings
                        .push(DataQualityWarning::MissingCorrectionTable { id: id.clone() });
                    result
                }
            },
            _ => MassResult::uncorrected(volume, base_density),
        };

        let findings = validate_mass(volume, &result);
        result.warnings.extend(findings);
        Ok(result)
    }
}

/// Non-fatal checks on a computed mass
pub fn validate_mass(volume: &VolumeResult, mass: &MassResult) -> Vec<DataQualityWarning> {
    let mut warnings = Vec::new();

    let density = mass.density_used;
    if !(PLAUSIBLE_DENSITY_MIN..=PLAUSIBLE_DENSITY_MAX).contains(&density) {
        warnings.push(DataQualityWarning::DensityOutOfRange {
            density,
            min: PLAUSIBLE_DENSITY_MIN,
            max: PLAUSIBLE_DENSITY_MAX,
        });
    }

    if volume.is_extrapolated() {
        warnings.push(DataQualityWarning::MassFromExtrapolatedVolume);
    }

    if !mass.temperature_corrected && (astm::DENSITY_MIN..=astm::DENSITY_MAX).contains(&density) {
        warnings.push(DataQualityWarning::CorrectionNotApplied { density });
    }

    warnings
}

/// Total mass, mean density and correction counts over `results`
pub fn summarize<'a>(results: impl IntoIterator<Item = &'a MassResult>) -> MassSummary {
    let mut summary = MassSummary::default();
    let mut density_sum = 0.0;

    for result in results {
        summary.total_mass_tons += result.mass_metric_tons;
        density_sum += result.density_used;
        summary.tank_count += 1;
        if result.temperature_corrected {
            summary.corrected_count += 1;
        }
    }

    if summary.tank_count > 0 {
        summary.average_density = density_sum / summary.tank_count as f64;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::CorrectionEntry;
    use crate::volume::Accuracy;

    fn volume(liters: f64, accuracy: Accuracy) -> VolumeResult {
        VolumeResult {
            volume_m3: liters / 1000.0,
            volume_liters: liters,
            interpolated: accuracy != Accuracy::Exact,
            accuracy,
        }
    }

    fn product(correction: Option<CorrectionSource>) -> Product {
        Product {
            id: "mgo".into(),
            name: "Marine Gas Oil".into(),
            density_15c_vacuum: 839.0,
            supports_temperature_correction: correction.is_some(),
            correction,
        }
    }

    #[test]
    fn test_uncorrected_mass() {
        let calc = MassCalculator::new();
        let result = calc
            .mass_from_volume(&volume(10_000.0, Accuracy::Interpolated), 1000.0, None, None)
            .unwrap();
        assert_eq!(result.mass_metric_tons, 10.0);
        assert!(!result.temperature_corrected);
        assert!(!result.astm_correction_applied);
        assert!(result.warnings.contains(&DataQualityWarning::CorrectionNotApplied { density: 1000.0 }));
    }

    #[test]
    fn test_temperature_without_support_is_uncorrected() {
        let calc = MassCalculator::new();
        let result = calc
            .mass_from_volume(&volume(1000.0, Accuracy::Exact), 839.0, Some(32.5), Some(&product(None)))
            .unwrap();
        assert!(!result.temperature_corrected);
        assert!((result.mass_metric_tons - 0.839).abs() < 1e-12);
    }

    #[test]
    fn test_astm_path() {
        let calc = MassCalculator::new();
        let product = product(Some(CorrectionSource::Astm54b));
        let result = calc
            .mass_from_volume(&volume(1000.0, Accuracy::Exact), 839.0, Some(32.5), Some(&product))
            .unwrap();
        assert_eq!(result.mass_metric_tons, 0.827);
        assert!(result.temperature_corrected);
        assert!(result.astm_correction_applied);
        assert!((result.density_used - 839.0 * 0.98515).abs() < 1e-9);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_astm_path_propagates_validation() {
        let calc = MassCalculator::new();
        let product = product(Some(CorrectionSource::Astm54b));
        let result = calc.mass_from_volume(&volume(1000.0, Accuracy::Exact), 839.0, Some(200.0), Some(&product));
        assert!(matches!(result, Err(TankError::Validation(_))));
    }

    #[test]
    fn test_table_path() {
        let mut calc = MassCalculator::new();
        calc.register_table(
            CorrectionTable::new(
                "mgo-table",
                [
                    CorrectionEntry { temperature_c: 15.0, factor: 1.0 },
                    CorrectionEntry { temperature_c: 35.0, factor: 0.98 },
                ],
            )
            .unwrap(),
        );
        let product = product(Some(CorrectionSource::Table { id: "mgo-table".into() }));
        let result = calc
            .mass_from_volume(&volume(1000.0, Accuracy::Exact), 800.0, Some(25.0), Some(&product))
            .unwrap();
        assert!(result.temperature_corrected);
        assert!(!result.astm_correction_applied);
        assert!((result.density_used - 792.0).abs() < 1e-9);
        assert!((result.mass_metric_tons - 0.792).abs() < 1e-9);
    }

    #[test]
    fn test_missing_table_falls_back() {
        let calc = MassCalculator::new();
        let product = product(Some(CorrectionSource::Table { id: "absent".into() }));
        let result = calc
            .mass_from_volume(&volume(1000.0, Accuracy::Exact), 839.0, Some(25.0), Some(&product))
            .unwrap();
        assert!(!result.temperature_corrected);
        assert!(result
            .warnings
            .contains(&DataQualityWarning::MissingCorrectionTable { id: "absent".into() }));
    }

    #[test]
    fn test_validation_warnings() {
        let calc = MassCalculator::new();
        let result = calc
            .mass_from_volume(&volume(1000.0, Accuracy::Extrapolated), 2500.0, None, None)
            .unwrap();
        assert!(result.warnings.contains(&DataQualityWarning::MassFromExtrapolatedVolume));
        assert!(result.warnings.iter().any(|w| matches!(w, DataQualityWarning::DensityOutOfRange { .. })));
        assert!(!result.warnings.iter().any(|w| matches!(w, DataQualityWarning::CorrectionNotApplied { .. })));

        assert!(matches!(
            calc.mass_from_volume(&volume(1000.0, Accuracy::Exact), 0.0, None, None),
            Err(TankError::Validation(_))
        ));
    }

    #[test]
    fn test_summary() {
        let results = vec![
            MassResult {
                mass_metric_tons: 10.0,
                density_used: 800.0,
                temperature_corrected: true,
                astm_correction_applied: true,
                warnings: vec![],
            },
            MassResult {
                mass_metric_tons: 5.0,
                density_used: 900.0,
                temperature_corrected: false,
                astm_correction_applied: false,
                warnings: vec![],
            },
        ];
        let summary = summarize(&results);
        assert_eq!(summary.total_mass_tons, 15.0);
        assert_eq!(summary.average_density, 850.0);
        assert_eq!(summary.corrected_count, 1);
        assert_eq!(summary.tank_count, 2);

        assert_eq!(summarize(Vec::<MassResult>::new().iter()), MassSummary::default());
    }
}
