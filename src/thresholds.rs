//! Operation thresholds.
//!
//! Offsets are percentages of the operation quantity, never of the target:
//!
//! ```text
//! loading    pre = target - q·pre%    warn = target + q·warn%    alarm = target + q·alarm%
//! unloading  pre = target + q·pre%    warn = target - q·warn%    alarm = target - q·alarm%
//! ```

use crate::config::AlarmConfig;
use crate::error::{Result, TankError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Loading,
    Unloading,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Loading => write!(f, "loading"),
            OperationType::Unloading => write!(f, "unloading"),
        }
    }
}

/// Absolute volume thresholds (litres) for one configured operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationThresholds {
    pub operation_type: OperationType,
    pub operation_quantity: f64,
    pub initial_volume: f64,
    pub target_volume: f64,
    pub pre_alarm_volume: f64,
    pub overshoot_warning_volume: f64,
    pub overshoot_alarm_volume: f64,
}

impl OperationThresholds {
    /// Signed progress from the initial volume in the operation's direction
    pub fn transferred(&self, current_volume: f64) -> f64 {
        match self.operation_type {
            OperationType::Loading => current_volume - self.initial_volume,
            OperationType::Unloading => self.initial_volume - current_volume,
        }
    }

    /// Signed distance past the target in the operation's direction
    pub fn past_target(&self, current_volume: f64) -> f64 {
        match self.operation_type {
            OperationType::Loading => current_volume - self.target_volume,
            OperationType::Unloading => self.target_volume - current_volume,
        }
    }
}

/// Turn an operation setup into absolute thresholds.
pub fn compute_thresholds(
    operation_type: OperationType,
    operation_quantity: f64,
    initial_volume: f64,
    config: &AlarmConfig,
) -> Result<OperationThresholds> {
    if !operation_quantity.is_finite() || operation_quantity <= 0.0 {
        return Err(TankError::Validation(format!(
            "operation quantity {} must be positive",
            operation_quantity
        )));
    }
    if !initial_volume.is_finite() || initial_volume < 0.0 {
        return Err(TankError::Validation(format!(
            "initial volume {} must be non-negative",
            initial_volume
        )));
    }

    let offset = |pct: f64| operation_quantity * pct / 100.0;
    let pre = offset(config.pre_alarm_pct);
    let warn = offset(config.overshoot_warning_pct);
    let alarm = offset(config.overshoot_alarm_pct);

    let thresholds = match operation_type {
        OperationType::Loading => {
            let target = initial_volume + operation_quantity;
            OperationThresholds {
                operation_type,
                operation_quantity,
                initial_volume,
                target_volume: target,
                pre_alarm_volume: (target - pre).max(0.0),
                overshoot_warning_volume: target + warn,
                overshoot_alarm_volume: target + alarm,
            }
        }
        OperationType::Unloading => {
            let target = (initial_volume - operation_quantity).max(0.0);
            OperationThresholds {
                operation_type,
                operation_quantity,
                initial_volume,
                target_volume: target,
                pre_alarm_volume: target + pre,
                overshoot_warning_volume: (target - warn).max(0.0),
                overshoot_alarm_volume: (target - alarm).max(0.0),
            }
        }
    };

    Ok(thresholds)
}
