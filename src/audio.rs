//! Audio cue decisions.
//!
//! The engine decides *whether* and *what* to play for an alarm state; sound
//! synthesis belongs to an external playback subsystem behind [`AudioSink`].

use crate::alarm::AlarmState;
use crate::error::{Result, TankError};
use crate::thresholds::OperationType;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a cue is repeated while the alarm persists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CuePattern {
    Single,
    Intermittent,
    Continuous,
}

/// Playback settings for one alarm state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioCue {
    pub enabled: bool,
    pub pattern: CuePattern,
    /// Tone frequency handed to the playback subsystem (Hz)
    pub frequency_hz: f64,
    /// Relative loudness in `[0, 1]`
    pub volume: f64,
}

impl AudioCue {
    fn new(pattern: CuePattern, frequency_hz: f64, volume: f64) -> Self {
        Self {
            enabled: true,
            pattern,
            frequency_hz,
            volume,
        }
    }
}

/// Per-state cue table. `NORMAL` never plays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioCues {
    pub pre_alarm: AudioCue,
    pub target_reached: AudioCue,
    pub overshoot_warning: AudioCue,
    pub overshoot_alarm: AudioCue,
}

impl AudioCues {
    pub fn for_state(&self, state: AlarmState) -> Option<&AudioCue> {
        match state {
            AlarmState::Normal => None,
            AlarmState::PreAlarm => Some(&self.pre_alarm),
            AlarmState::TargetReached => Some(&self.target_reached),
            AlarmState::OvershootWarning => Some(&self.overshoot_warning),
            AlarmState::OvershootAlarm => Some(&self.overshoot_alarm),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, &AudioCue)> {
        [
            ("pre_alarm", &self.pre_alarm),
            ("target_reached", &self.target_reached),
            ("overshoot_warning", &self.overshoot_warning),
            ("overshoot_alarm", &self.overshoot_alarm),
        ]
        .into_iter()
    }
}

impl Default for AudioCues {
    fn default() -> Self {
        Self {
            pre_alarm: AudioCue::new(CuePattern::Single, 660.0, 0.6),
            target_reached: AudioCue::new(CuePattern::Intermittent, 880.0, 0.8),
            overshoot_warning: AudioCue::new(CuePattern::Intermittent, 1000.0, 0.9),
            overshoot_alarm: AudioCue::new(CuePattern::Continuous, 1200.0, 1.0),
        }
    }
}

/// Audio section of the engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Master switch
    pub enabled: bool,
    pub loading_enabled: bool,
    pub unloading_enabled: bool,
    pub cues: AudioCues,
}

impl AudioConfig {
    pub fn enabled_for(&self, operation: OperationType) -> bool {
        self.enabled
            && match operation {
                OperationType::Loading => self.loading_enabled,
                OperationType::Unloading => self.unloading_enabled,
            }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, cue) in self.cues.iter() {
            if !(0.0..=1.0).contains(&cue.volume) {
                return Err(TankError::out_of_range(
                    &format!("{} cue volume", name),
                    cue.volume,
                    0.0,
                    1.0,
                ));
            }
            if !(cue.frequency_hz > 0.0) {
                return Err(TankError::Validation(format!(
                    "{} cue frequency {} Hz must be positive",
                    name, cue.frequency_hz
                )));
            }
        }
        Ok(())
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loading_enabled: true,
            unloading_enabled: true,
            cues: AudioCues::default(),
        }
    }
}

/// Signal handed to the playback subsystem
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioTrigger {
    pub state: AlarmState,
    pub operation_type: OperationType,
    pub cue: AudioCue,
}

/// Pick the cue for `state`, or `None` when nothing should play.
pub fn select_audio_cue(
    state: AlarmState,
    operation: OperationType,
    config: &AudioConfig,
) -> Option<AudioTrigger> {
    if !config.enabled_for(operation) {
        debug!("Audio disabled for {:?} operations", operation);
        return None;
    }
    let cue = config.cues.for_state(state)?;
    if !cue.enabled {
        return None;
    }
    Some(AudioTrigger {
        state,
        operation_type: operation,
        cue: cue.clone(),
    })
}

/// External playback subsystem. Calls are fire-and-forget.
pub trait AudioSink: Send + Sync {
    fn play(&self, trigger: &AudioTrigger);
    fn stop(&self);
}

/// Sink that discards every request
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn play(&self, trigger: &AudioTrigger) {
        debug!("Audio cue for {:?} discarded", trigger.state);
    }

    fn stop(&self) {}
}
