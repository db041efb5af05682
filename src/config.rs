// src/config.rs - Versioned engine configuration with deterministic default filling

use crate::audio::{AudioConfig, AudioCues};
use crate::error::{Result, TankError};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Current configuration schema version
pub const CONFIG_VERSION: u32 = 1;

/// Finest volume cache grid accepted by [`Config::validate`]
pub const MIN_CACHE_STEP_MM: f64 = 0.01;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Complete engine configuration. Every field is required; use
/// [`PartialConfig`] and [`Config::from_partial`] to load stored files that
/// may omit fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Schema version the values were written with
    pub version: u32,

    /// Alarm thresholds and timing
    pub alarms: AlarmConfig,

    /// Audio cue decisions
    pub audio: AudioConfig,

    /// Flow-rate estimation
    pub flow: FlowConfig,

    /// Calibration lookup
    pub volume: VolumeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            alarms: AlarmConfig::default(),
            audio: AudioConfig::default(),
            flow: FlowConfig::default(),
            volume: VolumeConfig::default(),
        }
    }
}

// ============================================================================
// ALARM CONFIGURATION
// ============================================================================

/// Operation alarm thresholds (percentages of the operation quantity) and timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Evaluate alarms for loading operations
    pub loading_enabled: bool,

    /// Evaluate alarms for unloading operations
    pub unloading_enabled: bool,

    /// Distance before target that raises the pre-alarm
    pub pre_alarm_pct: f64,

    /// Overshoot past target that raises the warning
    pub overshoot_warning_pct: f64,

    /// Overshoot past target that raises the alarm
    pub overshoot_alarm_pct: f64,

    /// Delay before an overshoot state is surfaced (0 = immediate)
    pub escalation_delay_ms: u64,

    /// Reset an unacknowledged alarm after this long (0 = never)
    pub auto_reset_ms: u64,
}

impl AlarmConfig {
    pub fn escalation_delay(&self) -> Duration {
        Duration::from_millis(self.escalation_delay_ms)
    }

    /// `None` when auto-reset is disabled
    pub fn auto_reset(&self) -> Option<Duration> {
        (self.auto_reset_ms > 0).then(|| Duration::from_millis(self.auto_reset_ms))
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            loading_enabled: default_true(),
            unloading_enabled: default_true(),
            pre_alarm_pct: default_pre_alarm_pct(),
            overshoot_warning_pct: default_overshoot_warning_pct(),
            overshoot_alarm_pct: default_overshoot_alarm_pct(),
            escalation_delay_ms: default_escalation_delay_ms(),
            auto_reset_ms: default_auto_reset_ms(),
        }
    }
}

// ============================================================================
// FLOW AND VOLUME CONFIGURATION
// ============================================================================

/// Flow-rate estimation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Nominal polling interval of the data source (None = irregular)
    pub polling_interval_ms: Option<u64>,

    /// Per-tank stability band
    pub stable_threshold_l_per_min: f64,

    /// Group stability band
    pub group_stable_threshold_m3_per_hour: f64,

    /// Confidence below this is reported as a data-quality warning
    pub low_confidence_threshold: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: Some(default_polling_interval_ms()),
            stable_threshold_l_per_min: default_stable_threshold(),
            group_stable_threshold_m3_per_hour: default_group_stable_threshold(),
            low_confidence_threshold: default_low_confidence(),
        }
    }
}

/// Calibration lookup parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Height (or volume, for the inverse) distance treated as an exact hit
    pub exact_match_tolerance: f64,

    /// Lookup cache step in millimetres
    pub cache_step_mm: f64,

    /// Tables needing more cache entries are looked up directly
    pub max_cache_entries: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            exact_match_tolerance: default_exact_tolerance(),
            cache_step_mm: default_cache_step(),
            max_cache_entries: default_max_cache_entries(),
        }
    }
}

// ============================================================================
// PARTIAL CONFIGURATION (stored files)
// ============================================================================

/// Stored configuration where any field may be missing. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub version: Option<u32>,
    pub alarms: Option<PartialAlarmConfig>,
    pub audio: Option<PartialAudioConfig>,
    pub flow: Option<PartialFlowConfig>,
    pub volume: Option<PartialVolumeConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialAlarmConfig {
    pub loading_enabled: Option<bool>,
    pub unloading_enabled: Option<bool>,
    pub pre_alarm_pct: Option<f64>,
    pub overshoot_warning_pct: Option<f64>,
    pub overshoot_alarm_pct: Option<f64>,
    pub escalation_delay_ms: Option<u64>,
    pub auto_reset_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialAudioConfig {
    pub enabled: Option<bool>,
    pub loading_enabled: Option<bool>,
    pub unloading_enabled: Option<bool>,
    pub cues: Option<AudioCues>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialFlowConfig {
    /// Outer `None` = use default, inner `None` = no nominal interval
    #[serde(deserialize_with = "explicit_null")]
    pub polling_interval_ms: Option<Option<u64>>,
    pub stable_threshold_l_per_min: Option<f64>,
    pub group_stable_threshold_m3_per_hour: Option<f64>,
    pub low_confidence_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialVolumeConfig {
    pub exact_match_tolerance: Option<f64>,
    pub cache_step_mm: Option<f64>,
    pub max_cache_entries: Option<usize>,
}

impl From<Config> for PartialConfig {
    fn from(config: Config) -> Self {
        Self {
            version: Some(config.version),
            alarms: Some(PartialAlarmConfig {
                loading_enabled: Some(config.alarms.loading_enabled),
                unloading_enabled: Some(config.alarms.unloading_enabled),
                pre_alarm_pct: Some(config.alarms.pre_alarm_pct),
                overshoot_warning_pct: Some(config.alarms.overshoot_warning_pct),
                overshoot_alarm_pct: Some(config.alarms.overshoot_alarm_pct),
                escalation_delay_ms: Some(config.alarms.escalation_delay_ms),
                auto_reset_ms: Some(config.alarms.auto_reset_ms),
            }),
            audio: Some(PartialAudioConfig {
                enabled: Some(config.audio.enabled),
                loading_enabled: Some(config.audio.loading_enabled),
                unloading_enabled: Some(config.audio.unloading_enabled),
                cues: Some(config.audio.cues),
            }),
            flow: Some(PartialFlowConfig {
                polling_interval_ms: Some(config.flow.polling_interval_ms),
                stable_threshold_l_per_min: Some(config.flow.stable_threshold_l_per_min),
                group_stable_threshold_m3_per_hour: Some(config.flow.group_stable_threshold_m3_per_hour),
                low_confidence_threshold: Some(config.flow.low_confidence_threshold),
            }),
            volume: Some(PartialVolumeConfig {
                exact_match_tolerance: Some(config.volume.exact_match_tolerance),
                cache_step_mm: Some(config.volume.cache_step_mm),
                max_cache_entries: Some(config.volume.max_cache_entries),
            }),
        }
    }
}

// ============================================================================
// LOADING, VALIDATION AND EXPORT
// ============================================================================

impl Config {
    /// Fill every missing field from the built-in defaults.
    ///
    /// Pure and deterministic; fails only when the stored version is newer
    /// than this build understands.
    pub fn from_partial(partial: PartialConfig) -> Result<Self> {
        let version = partial.version.unwrap_or(CONFIG_VERSION);
        if version > CONFIG_VERSION {
            return Err(TankError::Configuration(format!(
                "configuration version {} is newer than supported version {}",
                version, CONFIG_VERSION
            )));
        }

        let defaults = Config::default();

        let alarms = partial.alarms.unwrap_or_default();
        let alarms = AlarmConfig {
            loading_enabled: alarms.loading_enabled.unwrap_or(defaults.alarms.loading_enabled),
            unloading_enabled: alarms.unloading_enabled.unwrap_or(defaults.alarms.unloading_enabled),
            pre_alarm_pct: alarms.pre_alarm_pct.unwrap_or(defaults.alarms.pre_alarm_pct),
            overshoot_warning_pct: alarms
                .overshoot_warning_pct
                .unwrap_or(defaults.alarms.overshoot_warning_pct),
            overshoot_alarm_pct: alarms
                .overshoot_alarm_pct
                .unwrap_or(defaults.alarms.overshoot_alarm_pct),
            escalation_delay_ms: alarms
                .escalation_delay_ms
                .unwrap_or(defaults.alarms.escalation_delay_ms),
            auto_reset_ms: alarms.auto_reset_ms.unwrap_or(defaults.alarms.auto_reset_ms),
        };

        let audio = partial.audio.unwrap_or_default();
        let audio = AudioConfig {
            enabled: audio.enabled.unwrap_or(defaults.audio.enabled),
            loading_enabled: audio.loading_enabled.unwrap_or(defaults.audio.loading_enabled),
            unloading_enabled: audio.unloading_enabled.unwrap_or(defaults.audio.unloading_enabled),
            cues: audio.cues.unwrap_or(defaults.audio.cues),
        };

        let flow = partial.flow.unwrap_or_default();
        let flow = FlowConfig {
            polling_interval_ms: flow
                .polling_interval_ms
                .unwrap_or(defaults.flow.polling_interval_ms),
            stable_threshold_l_per_min: flow
                .stable_threshold_l_per_min
                .unwrap_or(defaults.flow.stable_threshold_l_per_min),
            group_stable_threshold_m3_per_hour: flow
                .group_stable_threshold_m3_per_hour
                .unwrap_or(defaults.flow.group_stable_threshold_m3_per_hour),
            low_confidence_threshold: flow
                .low_confidence_threshold
                .unwrap_or(defaults.flow.low_confidence_threshold),
        };

        let volume = partial.volume.unwrap_or_default();
        let volume = VolumeConfig {
            exact_match_tolerance: volume
                .exact_match_tolerance
                .unwrap_or(defaults.volume.exact_match_tolerance),
            cache_step_mm: volume.cache_step_mm.unwrap_or(defaults.volume.cache_step_mm),
            max_cache_entries: volume
                .max_cache_entries
                .unwrap_or(defaults.volume.max_cache_entries),
        };

        Ok(Self {
            version: CONFIG_VERSION,
            alarms,
            audio,
            flow,
            volume,
        })
    }

    /// Check percentage ranges and timing sanity.
    pub fn validate(&self) -> Result<()> {
        let alarms = &self.alarms;
        check_range("pre_alarm_pct", alarms.pre_alarm_pct, 1.0, 50.0)?;
        check_range("overshoot_warning_pct", alarms.overshoot_warning_pct, 0.5, 20.0)?;
        check_range("overshoot_alarm_pct", alarms.overshoot_alarm_pct, 1.0, 30.0)?;
        if alarms.overshoot_warning_pct >= alarms.overshoot_alarm_pct {
            return Err(TankError::Validation(format!(
                "overshoot_warning_pct {} must be below overshoot_alarm_pct {}",
                alarms.overshoot_warning_pct, alarms.overshoot_alarm_pct
            )));
        }
        if alarms.auto_reset_ms > 0 && alarms.escalation_delay_ms > alarms.auto_reset_ms {
            return Err(TankError::Validation(format!(
                "escalation_delay_ms {} exceeds auto_reset_ms {}",
                alarms.escalation_delay_ms, alarms.auto_reset_ms
            )));
        }

        if self.flow.polling_interval_ms == Some(0) {
            return Err(TankError::Validation(
                "polling_interval_ms must be positive".to_string(),
            ));
        }
        check_non_negative("stable_threshold_l_per_min", self.flow.stable_threshold_l_per_min)?;
        check_non_negative(
            "group_stable_threshold_m3_per_hour",
            self.flow.group_stable_threshold_m3_per_hour,
        )?;
        check_range("low_confidence_threshold", self.flow.low_confidence_threshold, 0.0, 1.0)?;

        check_non_negative("exact_match_tolerance", self.volume.exact_match_tolerance)?;
        if !(self.volume.cache_step_mm >= MIN_CACHE_STEP_MM) {
            return Err(TankError::Validation(format!(
                "cache_step_mm {} must be at least {}",
                self.volume.cache_step_mm, MIN_CACHE_STEP_MM
            )));
        }

        self.audio.validate()
    }

    /// Parse a stored YAML document, filling defaults for missing fields
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let partial: PartialConfig = serde_yaml::from_str(yaml)?;
        Self::from_partial(partial)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_yaml(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Serialize for transfer between installations
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Inverse of [`export_json`](Self::export_json). The imported values are
    /// validated before they are returned.
    pub fn import_json(json: &str) -> Result<Self> {
        let partial: PartialConfig = serde_json::from_str(json)?;
        let config = Self::from_partial(partial)?;
        config.validate()?;
        Ok(config)
    }
}

/// Keeps an explicit `null` distinct from a missing field
fn explicit_null<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(TankError::out_of_range(name, value, min, max));
    }
    Ok(())
}

fn check_non_negative(name: &str, value: f64) -> Result<()> {
    if !(value >= 0.0) {
        return Err(TankError::Validation(format!(
            "{} {} must be non-negative",
            name, value
        )));
    }
    Ok(())
}

// ============================================================================
// DEFAULT VALUE FUNCTIONS
// ============================================================================

fn default_true() -> bool { true }
fn default_pre_alarm_pct() -> f64 { 10.0 }
fn default_overshoot_warning_pct() -> f64 { 4.0 }
fn default_overshoot_alarm_pct() -> f64 { 10.0 }
fn default_escalation_delay_ms() -> u64 { 3_000 }
fn default_auto_reset_ms() -> u64 { 600_000 }
fn default_polling_interval_ms() -> u64 { 5_000 }
fn default_stable_threshold() -> f64 { 0.5 }
fn default_group_stable_threshold() -> f64 { 0.1 }
fn default_low_confidence() -> f64 { 0.5 }
fn default_exact_tolerance() -> f64 { 0.1 }
fn default_cache_step() -> f64 { 1.0 }
fn default_max_cache_entries() -> usize { 100_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_fills_missing_fields() {
        let yaml = r#"
alarms:
  pre_alarm_pct: 15
  unknown_key: ignored
flow:
  polling_interval_ms: null
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.alarms.pre_alarm_pct, 15.0);
        assert_eq!(config.flow.polling_interval_ms, None);
        assert_eq!(config.alarms.overshoot_alarm_pct, default_overshoot_alarm_pct());
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.volume, VolumeConfig::default());
        assert_eq!(config.audio, AudioConfig::default());
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = Config::from_partial(PartialConfig::default()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_newer_version_rejected() {
        let result = Config::from_yaml("version: 99\n");
        assert!(matches!(result, Err(TankError::Configuration(_))));
    }

    #[test]
    fn test_percentage_constraints() {
        let mut config = Config::default();
        config.alarms.pre_alarm_pct = 0.5;
        assert!(matches!(config.validate(), Err(TankError::Validation(_))));

        let mut config = Config::default();
        config.alarms.overshoot_warning_pct = 12.0;
        config.alarms.overshoot_alarm_pct = 12.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.alarms.overshoot_alarm_pct = 31.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.alarms.overshoot_warning_pct = 0.5;
        config.alarms.overshoot_alarm_pct = 1.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_timing_constraints() {
        let mut config = Config::default();
        config.alarms.escalation_delay_ms = 10_000;
        config.alarms.auto_reset_ms = 5_000;
        assert!(config.validate().is_err());

        config.alarms.auto_reset_ms = 0;
        config.validate().unwrap();
        assert_eq!(config.alarms.auto_reset(), None);

        let mut config = Config::default();
        config.flow.polling_interval_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_step_lower_bound() {
        let mut config = Config::default();
        for step in [1e-300, 0.001, 0.0, -1.0, f64::NAN] {
            config.volume.cache_step_mm = step;
            assert!(config.validate().is_err(), "step {} accepted", step);
        }
        config.volume.cache_step_mm = MIN_CACHE_STEP_MM;
        config.validate().unwrap();
    }

    #[test]
    fn test_json_export_import_round_trip() {
        let mut config = Config::default();
        config.alarms.pre_alarm_pct = 12.5;
        config.alarms.unloading_enabled = false;
        config.flow.polling_interval_ms = None;

        let json = config.export_json().unwrap();
        let imported = Config::import_json(&json).unwrap();
        assert_eq!(imported, config);
    }

    #[test]
    fn test_import_rejects_invalid_values() {
        let json = r#"{ "alarms": { "pre_alarm_pct": 80 } }"#;
        assert!(matches!(Config::import_json(json), Err(TankError::Validation(_))));
    }

    #[test]
    fn test_yaml_round_trip_through_partial() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);

        let partial = PartialConfig::from(config.clone());
        assert_eq!(Config::from_partial(partial).unwrap(), config);
    }
}
