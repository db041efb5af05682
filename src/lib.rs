//! ULLAGE - Tank gauging calculations and operation alarm engine
//!
//! The calculation core of a shipboard tank monitoring system. For each gauge
//! reading it derives the contained volume from the tank's calibration curve,
//! the temperature-corrected mass (ASTM 54B or a product correction table),
//! the flow rate and its trend, and drives the loading/unloading alarm state
//! machine with its escalation and auto-reset timers.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use ullage::{CalibrationTable, ConfigHandle, Engine, InMemoryCatalog, ManualScheduler, TankRegistry};
//!
//! let engine = Engine::new(
//!     ConfigHandle::default(),
//!     Arc::new(InMemoryCatalog::new()),
//!     Arc::new(ManualScheduler::new()),
//! );
//! let mut registry = TankRegistry::new();
//! let table = CalibrationTable::from_pairs("T1", &[(0.0, 0.0), (100.0, 750.0), (200.0, 1500.0)])?;
//! engine.register_tank(&mut registry, table, None);
//! # Ok::<(), ullage::TankError>(())
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error taxonomy and data-quality warnings
pub mod error;

/// Versioned configuration with default filling and validation
pub mod config;

/// Configuration persistence and snapshot handle
pub mod config_store;

/// Tank registry and identifiers
pub mod registry;

// ============================================================================
// CALCULATIONS
// ============================================================================

pub mod calibration;
pub mod volume;

/// ASTM 54B volume correction
pub mod astm;
pub mod correction;
pub mod catalog;
pub mod mass;
pub mod flow;

// ============================================================================
// ALARMS
// ============================================================================

pub mod thresholds;
pub mod alarm;
pub mod audio;
pub mod events;

/// Cancellable timers for escalation and auto-reset
pub mod scheduler;

/// Per-reading calculation pass and async driver
pub mod engine;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use alarm::{AlarmEvent, AlarmHistory, AlarmSeverity, AlarmState, AlarmStateMachine, AlarmStatus};
pub use audio::{AudioConfig, AudioSink, AudioTrigger, NullAudioSink};
pub use calibration::{CalibrationPoint, CalibrationTable};
pub use catalog::{CorrectionSource, InMemoryCatalog, Product, ProductCatalog};
pub use config::Config;
pub use config_store::{ConfigHandle, ConfigStore, FileConfigStore, MemoryConfigStore};
pub use correction::CorrectionTable;
pub use engine::{Engine, EngineStats, Reading, TankUpdate};
pub use error::{DataQualityWarning, Result, TankError};
pub use events::{AlarmListener, ChannelListener};
pub use flow::{FlowRateResult, Trend};
pub use mass::MassResult;
pub use registry::{TankId, TankRegistry};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
pub use thresholds::{OperationThresholds, OperationType};
pub use volume::{Accuracy, VolumeResult};

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// ULLAGE version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the log subscriber used by the CLI.
///
/// `RUST_LOG` overrides the default `ullage=info` filter. An already-installed
/// subscriber is left in place.
#[cfg(feature = "cli")]
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ullage=info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr));

    if subscriber.try_init().is_ok() {
        tracing::debug!("ULLAGE {} logging initialized", VERSION);
    }
}
