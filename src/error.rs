use crate::registry::TankId;
use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type.
///
/// `Validation` and `Computation` are raised by the calculators; a failure for
/// one tank never aborts processing of other tanks in the same batch.
#[derive(Error, Debug)]
pub enum TankError {
    /// Input outside a defined numeric domain (density, temperature, quantity,
    /// configuration percentages). Raised before any computation proceeds.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An intermediate or final value violated its sanity bound
    /// (non-finite, alpha or VCF out of range).
    #[error("Computation error: {0}")]
    Computation(String),

    /// Persisted configuration failed to parse or validate
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Reading or command addressed to a tank the registry does not know
    #[error("Tank not found: {0}")]
    TankNotFound(TankId),

    /// Alarm command for a tank without a configured operation
    #[error("No active operation for tank {0}")]
    NoActiveOperation(TankId),

    /// A notification receiver was dropped
    #[error("Notification channel closed")]
    ChannelClosed,

    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while exporting or importing JSON configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TankError {
    /// Shorthand for a validation failure on a named quantity
    pub(crate) fn out_of_range(what: &str, value: f64, min: f64, max: f64) -> Self {
        TankError::Validation(format!(
            "{} {} outside range [{}, {}]",
            what, value, min, max
        ))
    }
}

/// Convenient alias over [`Result`] using [`TankError`]
pub type Result<T> = std::result::Result<T, TankError>;

/// Non-fatal data-quality findings carried inside result objects.
///
/// These are never returned as `Err`; callers decide whether to surface them.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityWarning {
    #[error("volume extrapolated outside calibration range at height {height_mm} mm")]
    ExtrapolatedVolume { height_mm: f64 },

    #[error("calibration table has only {points} points (recommended at least {recommended})")]
    SparseCalibration { points: usize, recommended: usize },

    #[error("calibration volume decreases at height {height_mm} mm")]
    NonMonotonicVolume { height_mm: f64 },

    #[error("density {density} kg/m3 outside plausible range [{min}, {max}]")]
    DensityOutOfRange { density: f64, min: f64, max: f64 },

    #[error("mass computed from an extrapolated volume")]
    MassFromExtrapolatedVolume,

    #[error("no temperature correction applied for correctable density {density} kg/m3")]
    CorrectionNotApplied { density: f64 },

    #[error("correction table '{id}' is not registered")]
    MissingCorrectionTable { id: String },

    #[error("mass not computed: {reason}")]
    MassUnavailable { reason: String },

    #[error("flow rate confidence {confidence:.2} below {threshold:.2}")]
    LowFlowConfidence { confidence: f64, threshold: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TankError::out_of_range("density", 1200.0, 600.0, 1100.0);
        assert_eq!(
            err.to_string(),
            "Validation error: density 1200 outside range [600, 1100]"
        );

        let err = TankError::TankNotFound(TankId::from("T1"));
        assert_eq!(err.to_string(), "Tank not found: T1");
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let warning = DataQualityWarning::SparseCalibration {
            points: 3,
            recommended: 10,
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["kind"], "sparse_calibration");
        assert_eq!(json["points"], 3);
    }
}
