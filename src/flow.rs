//! Flow-rate estimation from recent volume samples.
//!
//! Each tank keeps a bounded [`VolumeHistory`]; the estimator is stateless
//! and works against whichever history the caller passes in.
//!
//! ## Confidence
//!
//! ```text
//! consistency = max(0, 1 - var(last 3 volume deltas) / 1000 L²)
//! timing      = max(0, 1 - |avg interval - nominal| / nominal / 0.2)
//! confidence  = clamp(0.7·consistency + 0.3·timing, 0.1, 1.0)
//! ```
//!
//! Fewer than three samples give a fixed confidence of 0.5. Without a nominal
//! polling interval the timing score uses the mean absolute deviation of the
//! intervals relative to their mean.

use crate::config::FlowConfig;
use crate::error::DataQualityWarning;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Samples kept per tank
pub const HISTORY_CAPACITY: usize = 10;

/// Volume deltas considered for the consistency score
const CONSISTENCY_WINDOW: usize = 3;

/// Delta variance that drives the consistency score to zero (L²)
const VARIANCE_SCALE: f64 = 1000.0;

/// Relative timing error that drives the timing score to zero
const TIMING_TOLERANCE: f64 = 0.2;

/// Jitter absorbed by snapping to the nominal interval, as a fraction of it
const NOMINAL_SNAP: f64 = 0.5;

const MIN_CONFIDENCE: f64 = 0.1;
const EARLY_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeHistorySample {
    pub timestamp: DateTime<Utc>,
    pub volume_liters: f64,
    pub height_mm: f64,
}

/// FIFO ring of the most recent samples for one tank
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeHistory {
    samples: VecDeque<VolumeHistorySample>,
}

impl VolumeHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Append, evicting the oldest sample when full
    pub fn push(&mut self, sample: VolumeHistorySample) {
        if self.samples.len() == HISTORY_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&VolumeHistorySample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &VolumeHistorySample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// The last `n + 1` samples, giving up to `n` consecutive pairs
    fn tail(&self, n: usize) -> Vec<&VolumeHistorySample> {
        let skip = self.samples.len().saturating_sub(n + 1);
        self.samples.iter().skip(skip).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Loading,
    Unloading,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlowRateResult {
    pub volume_change_l: f64,
    pub time_interval_ms: f64,
    pub flow_rate_l_per_min: f64,
    pub flow_rate_l_per_hour: f64,
    pub flow_rate_m3_per_hour: f64,
    pub trend: Trend,
    /// Reliability of the estimate in `[0, 1]`
    pub confidence: f64,
}

impl FlowRateResult {
    /// No estimate possible yet
    pub fn zero() -> Self {
        Self {
            volume_change_l: 0.0,
            time_interval_ms: 0.0,
            flow_rate_l_per_min: 0.0,
            flow_rate_l_per_hour: 0.0,
            flow_rate_m3_per_hour: 0.0,
            trend: Trend::Stable,
            confidence: 0.0,
        }
    }
}

/// Aggregate over a tank group
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroupFlowSummary {
    /// Signed sum over non-stable tanks
    pub total_flow_m3_per_hour: f64,
    /// Mean confidence of the non-stable tanks (0 when none)
    pub average_confidence: f64,
    pub active_tanks: usize,
    pub trend: Trend,
}

pub struct FlowRateEstimator {
    nominal_interval_ms: Option<f64>,
    stable_threshold_l_per_min: f64,
    group_stable_threshold_m3_per_hour: f64,
    low_confidence_threshold: f64,
}

impl FlowRateEstimator {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            nominal_interval_ms: config.polling_interval_ms.map(|ms| ms as f64),
            stable_threshold_l_per_min: config.stable_threshold_l_per_min,
            group_stable_threshold_m3_per_hour: config.group_stable_threshold_m3_per_hour,
            low_confidence_threshold: config.low_confidence_threshold,
        }
    }

    /// Record `sample` and estimate the current flow rate.
    ///
    /// A sample not newer than the latest one is dropped and yields a zero
    /// estimate.
    pub fn update_and_estimate(
        &self,
        history: &mut VolumeHistory,
        sample: VolumeHistorySample,
    ) -> FlowRateResult {
        if let Some(latest) = history.latest() {
            if sample.timestamp <= latest.timestamp {
                warn!(
                    "Non-increasing sample timestamps ({} -> {}), sample dropped",
                    latest.timestamp, sample.timestamp
                );
                return FlowRateResult::zero();
            }
        }
        history.push(sample);

        let pair = history.tail(1);
        let [previous, current] = pair.as_slice() else {
            return FlowRateResult::zero();
        };

        let actual_ms = (current.timestamp - previous.timestamp).num_milliseconds() as f64;
        if actual_ms <= 0.0 {
            // Sub-millisecond spacing
            return FlowRateResult::zero();
        }

        let interval_ms = self.select_interval(actual_ms);
        let volume_change = current.volume_liters - previous.volume_liters;
        let per_min = volume_change / (interval_ms / 60_000.0);
        let per_hour = per_min * 60.0;

        let result = FlowRateResult {
            volume_change_l: volume_change,
            time_interval_ms: interval_ms,
            flow_rate_l_per_min: per_min,
            flow_rate_l_per_hour: per_hour,
            flow_rate_m3_per_hour: per_hour / 1000.0,
            trend: classify(per_min, self.stable_threshold_l_per_min),
            confidence: self.confidence(history),
        };

        trace!(
            "Flow {:.3} L/min over {} ms ({:?}, confidence {:.2})",
            result.flow_rate_l_per_min,
            interval_ms,
            result.trend,
            result.confidence
        );
        result
    }

    /// Snap to the nominal interval when the jitter is small
    fn select_interval(&self, actual_ms: f64) -> f64 {
        match self.nominal_interval_ms {
            Some(nominal) if (actual_ms - nominal).abs() < NOMINAL_SNAP * nominal => nominal,
            _ => actual_ms,
        }
    }

    fn confidence(&self, history: &VolumeHistory) -> f64 {
        if history.len() < 3 {
            return EARLY_CONFIDENCE;
        }

        let window = history.tail(CONSISTENCY_WINDOW);
        let deltas: Vec<f64> = window
            .windows(2)
            .map(|w| w[1].volume_liters - w[0].volume_liters)
            .collect();
        let intervals: Vec<f64> = window
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64)
            .collect();

        let consistency = (1.0 - variance(&deltas) / VARIANCE_SCALE).max(0.0);

        let avg_interval = mean(&intervals);
        let timing = match self.nominal_interval_ms {
            Some(nominal) => {
                (1.0 - (avg_interval - nominal).abs() / nominal / TIMING_TOLERANCE).max(0.0)
            }
            None if avg_interval > 0.0 => {
                let spread = intervals.iter().map(|i| (i - avg_interval).abs()).sum::<f64>()
                    / intervals.len() as f64;
                (1.0 - spread / avg_interval / TIMING_TOLERANCE).max(0.0)
            }
            None => 0.0,
        };

        (0.7 * consistency + 0.3 * timing).clamp(MIN_CONFIDENCE, 1.0)
    }

    /// Warning when a computed rate is less reliable than configured
    pub fn quality_warning(&self, result: &FlowRateResult) -> Option<DataQualityWarning> {
        if result.time_interval_ms > 0.0 && result.confidence < self.low_confidence_threshold {
            Some(DataQualityWarning::LowFlowConfidence {
                confidence: result.confidence,
                threshold: self.low_confidence_threshold,
            })
        } else {
            None
        }
    }

    /// Combine per-tank results into a group figure
    pub fn summarize_group<'a>(
        &self,
        results: impl IntoIterator<Item = &'a FlowRateResult>,
    ) -> GroupFlowSummary {
        let active: Vec<&FlowRateResult> = results
            .into_iter()
            .filter(|r| r.trend != Trend::Stable)
            .collect();

        let total: f64 = active.iter().map(|r| r.flow_rate_m3_per_hour).sum();
        let average_confidence = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|r| r.confidence).sum::<f64>() / active.len() as f64
        };

        GroupFlowSummary {
            total_flow_m3_per_hour: total,
            average_confidence,
            active_tanks: active.len(),
            trend: classify(total, self.group_stable_threshold_m3_per_hour),
        }
    }
}

impl Default for FlowRateEstimator {
    fn default() -> Self {
        Self::new(&FlowConfig::default())
    }
}

fn classify(rate: f64, stable_threshold: f64) -> Trend {
    if rate.abs() < stable_threshold {
        Trend::Stable
    } else if rate > 0.0 {
        Trend::Loading
    } else {
        Trend::Unloading
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn sample(offset_ms: i64, volume: f64) -> VolumeHistorySample {
        VolumeHistorySample {
            timestamp: t0() + Duration::milliseconds(offset_ms),
            volume_liters: volume,
            height_mm: volume / 10.0,
        }
    }

    #[test]
    fn test_first_sample_is_zero() {
        let estimator = FlowRateEstimator::default();
        let mut history = VolumeHistory::new();
        let result = estimator.update_and_estimate(&mut history, sample(0, 100.0));
        assert_eq!(result, FlowRateResult::zero());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_loading_rate_over_ten_minutes() {
        let estimator = FlowRateEstimator::default();
        let mut history = VolumeHistory::new();
        estimator.update_and_estimate(&mut history, sample(0, 100.0));
        let result = estimator.update_and_estimate(&mut history, sample(600_000, 150.0));

        assert_eq!(result.flow_rate_l_per_min, 5.0);
        assert_eq!(result.flow_rate_l_per_hour, 300.0);
        assert_eq!(result.flow_rate_m3_per_hour, 0.3);
        assert_eq!(result.trend, Trend::Loading);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_constant_volume_is_stable() {
        let estimator = FlowRateEstimator::default();
        let mut history = VolumeHistory::new();
        let mut result = FlowRateResult::zero();
        for i in 0..5 {
            result = estimator.update_and_estimate(&mut history, sample(i * 5_000, 400.0));
        }
        assert_eq!(result.trend, Trend::Stable);
        assert_eq!(result.flow_rate_l_per_min, 0.0);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_unloading_and_nominal_snap() {
        let estimator = FlowRateEstimator::default();
        let mut history = VolumeHistory::new();
        estimator.update_and_estimate(&mut history, sample(0, 1000.0));
        // 5.9 s actual against a 5 s nominal interval
        let result = estimator.update_and_estimate(&mut history, sample(5_900, 990.0));
        assert_eq!(result.time_interval_ms, 5_000.0);
        assert_eq!(result.flow_rate_l_per_min, -120.0);
        assert_eq!(result.trend, Trend::Unloading);

        // 8 s is beyond the snap band
        let result = estimator.update_and_estimate(&mut history, sample(13_900, 980.0));
        assert_eq!(result.time_interval_ms, 8_000.0);
    }

    #[test]
    fn test_non_increasing_timestamps() {
        let estimator = FlowRateEstimator::default();
        let mut history = VolumeHistory::new();
        estimator.update_and_estimate(&mut history, sample(10_000, 100.0));
        let result = estimator.update_and_estimate(&mut history, sample(10_000, 200.0));
        assert_eq!(result, FlowRateResult::zero());
        let result = estimator.update_and_estimate(&mut history, sample(4_000, 300.0));
        assert_eq!(result, FlowRateResult::zero());
        assert_eq!(history.len(), 1);

        // The next valid sample measures from the last accepted one
        let result = estimator.update_and_estimate(&mut history, sample(70_000, 160.0));
        assert_eq!(result.time_interval_ms, 60_000.0);
        assert_eq!(result.volume_change_l, 60.0);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_noisy_deltas_lower_confidence() {
        let estimator = FlowRateEstimator::default();
        let mut history = VolumeHistory::new();
        let volumes = [100.0, 200.0, 210.0, 400.0];
        let mut result = FlowRateResult::zero();
        for (i, v) in volumes.iter().enumerate() {
            result = estimator.update_and_estimate(&mut history, sample(i as i64 * 5_000, *v));
        }
        // Deltas 100, 10, 190 have variance 5400 L², consistency floors at 0
        assert!((result.confidence - 0.3).abs() < 1e-12);
        assert!(estimator.quality_warning(&result).is_some());
    }

    #[test]
    fn test_irregular_timing_without_nominal() {
        let config = FlowConfig {
            polling_interval_ms: None,
            ..FlowConfig::default()
        };
        let estimator = FlowRateEstimator::new(&config);
        let mut history = VolumeHistory::new();
        let mut result = FlowRateResult::zero();
        for offset in [0, 5_000, 10_000, 15_000] {
            result = estimator.update_and_estimate(&mut history, sample(offset, 100.0));
        }
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let estimator = FlowRateEstimator::default();
        let mut history = VolumeHistory::new();
        for i in 0..25 {
            estimator.update_and_estimate(&mut history, sample(i * 5_000, i as f64));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.samples().next().unwrap().volume_liters, 15.0);
        assert_eq!(history.latest().unwrap().volume_liters, 24.0);
    }

    #[test]
    fn test_group_summary() {
        let estimator = FlowRateEstimator::default();
        let mk = |m3h: f64, trend: Trend, confidence: f64| FlowRateResult {
            flow_rate_m3_per_hour: m3h,
            trend,
            confidence,
            ..FlowRateResult::zero()
        };
        let results = [
            mk(12.0, Trend::Loading, 0.9),
            mk(8.0, Trend::Loading, 0.7),
            mk(0.01, Trend::Stable, 0.2),
        ];
        let summary = estimator.summarize_group(&results);
        assert_eq!(summary.total_flow_m3_per_hour, 20.0);
        assert!((summary.average_confidence - 0.8).abs() < 1e-12);
        assert_eq!(summary.active_tanks, 2);
        assert_eq!(summary.trend, Trend::Loading);

        let idle = estimator.summarize_group(&[mk(0.05, Trend::Stable, 1.0)]);
        assert_eq!(idle.trend, Trend::Stable);
        assert_eq!(idle.average_confidence, 0.0);
    }
}
