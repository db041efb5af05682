//! ASTM 54B volume correction for generalized petroleum products.
//!
//! ## Physics Background
//!
//! Petroleum expands with temperature. Volumes and densities are therefore
//! reported at the 15 °C reference; the Volume Correction Factor (VCF) maps an
//! observed volume back to the reference:
//!
//! ```text
//! dT    = T_observed - 15.0
//! alpha = K0 / d² + K1 / d        (band-dependent, see below)
//! VCF   = exp(-alpha · dT · (1 + 0.8 · alpha · dT))
//! ```
//!
//! Thermal expansion coefficient bands by density at 15 °C (kg/m³):
//!
//! ```text
//! d ≤ 770          (346.42278 + 0.43884·d) / d²     gasolines
//! 770 < d < 778    -0.0033612 + 2680.32 / d²        transition zone
//! 778 ≤ d < 839    594.5418 / d²                    jet fuels
//! d ≥ 839          (186.9696 + 0.48618·d) / d²      fuel oils
//! ```
//!
//! Every function here is pure and deterministic. Inputs outside their domain
//! fail with [`TankError::Validation`] before any arithmetic happens; internal
//! values outside sanity bounds fail with [`TankError::Computation`].

use crate::error::{Result, TankError};

/// Reference temperature for standard volumes (°C)
pub const REFERENCE_TEMPERATURE_C: f64 = 15.0;

/// Accepted density range at 15 °C (kg/m³)
pub const DENSITY_MIN: f64 = 600.0;
pub const DENSITY_MAX: f64 = 1100.0;

/// Accepted observed temperature range (°C)
pub const TEMPERATURE_MIN_C: f64 = -50.0;
pub const TEMPERATURE_MAX_C: f64 = 150.0;

/// Upper sanity bound for alpha (1/°C)
pub const ALPHA_MAX: f64 = 0.01;

/// Upper sanity bound for VCF
pub const VCF_MAX: f64 = 2.0;

/// Buoyancy correction between vacuum and air density (kg/L)
pub const AIR_BUOYANCY_CORRECTION: f64 = 0.0011;

const GASOLINE_MAX: f64 = 770.0;
const TRANSITION_MAX: f64 = 778.0;
const JET_MAX: f64 = 839.0;

pub fn validate_density(density: f64) -> Result<()> {
    if !(DENSITY_MIN..=DENSITY_MAX).contains(&density) {
        return Err(TankError::out_of_range("density", density, DENSITY_MIN, DENSITY_MAX));
    }
    Ok(())
}

pub fn validate_temperature(temperature_c: f64) -> Result<()> {
    if !(TEMPERATURE_MIN_C..=TEMPERATURE_MAX_C).contains(&temperature_c) {
        return Err(TankError::out_of_range(
            "temperature",
            temperature_c,
            TEMPERATURE_MIN_C,
            TEMPERATURE_MAX_C,
        ));
    }
    Ok(())
}

/// Thermal expansion coefficient (1/°C) for a product of the given density at 15 °C.
pub fn calculate_alpha(density_15c: f64) -> Result<f64> {
    validate_density(density_15c)?;

    let d = density_15c;
    let d2 = d * d;
    let alpha = if d <= GASOLINE_MAX {
        (346.42278 + 0.43884 * d) / d2
    } else if d < TRANSITION_MAX {
        -0.0033612 + 2680.32 / d2
    } else if d < JET_MAX {
        594.5418 / d2
    } else {
        (186.9696 + 0.48618 * d) / d2
    };

    if !alpha.is_finite() || alpha <= 0.0 || alpha > ALPHA_MAX {
        return Err(TankError::Computation(format!(
            "alpha {} for density {} outside (0, {}]",
            alpha, density_15c, ALPHA_MAX
        )));
    }
    Ok(alpha)
}

/// Volume Correction Factor, rounded to 5 decimal places.
pub fn calculate_vcf(density_15c: f64, observed_temp_c: f64) -> Result<f64> {
    validate_temperature(observed_temp_c)?;
    let alpha = calculate_alpha(density_15c)?;

    let dt = observed_temp_c - REFERENCE_TEMPERATURE_C;
    let vcf = (-alpha * dt * (1.0 + 0.8 * alpha * dt)).exp();

    if !vcf.is_finite() || vcf <= 0.0 || vcf > VCF_MAX {
        return Err(TankError::Computation(format!(
            "VCF {} for density {} at {} °C outside (0, {}]",
            vcf, density_15c, observed_temp_c, VCF_MAX
        )));
    }
    Ok(round_to(vcf, 5))
}

/// Convert a vacuum density (kg/L) to its in-air equivalent.
pub fn convert_vacuum_to_air(density_vacuum: f64) -> Result<f64> {
    if !(density_vacuum > 0.0) {
        return Err(TankError::Validation(format!(
            "vacuum density {} must be positive",
            density_vacuum
        )));
    }
    let density_air = density_vacuum - AIR_BUOYANCY_CORRECTION;
    if density_air <= 0.0 {
        return Err(TankError::Computation(format!(
            "air density {} from vacuum density {} is not positive",
            density_air, density_vacuum
        )));
    }
    Ok(density_air)
}

/// Temperature-corrected mass in metric tons, rounded to 3 decimal places.
pub fn calculate_metric_tons(volume_liters: f64, density_15c: f64, temperature_c: f64) -> Result<f64> {
    if !(volume_liters >= 0.0) {
        return Err(TankError::Validation(format!(
            "volume {} L must be non-negative",
            volume_liters
        )));
    }
    let vcf = calculate_vcf(density_15c, temperature_c)?;
    let mass_kg = (volume_liters / 1000.0) * density_15c * vcf;
    Ok(round_to(mass_kg / 1000.0, 3))
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
