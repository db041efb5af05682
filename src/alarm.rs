// File: src/alarm.rs
// Loading/Unloading Operation Alarm State Machine
//
// States advance with the transferred volume:
//
//   NORMAL -> PRE_ALARM -> TARGET_REACHED -> OVERSHOOT_WARNING -> OVERSHOOT_ALARM
//
// and return to NORMAL through an explicit reset, the auto-reset timer, or
// readings that fall back below the thresholds. Each update evaluates the
// most severe state whose condition holds; side effects (history, audio,
// listeners, timers) only happen when the state changes.

use crate::audio::{select_audio_cue, AudioSink};
use crate::config::Config;
use crate::events::AlarmListeners;
use crate::registry::TankId;
use crate::scheduler::{Scheduler, TimerHandle, TimerId, TimerKind};
use crate::thresholds::{OperationThresholds, OperationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Alarm events retained per tank
pub const MAX_HISTORY: usize = 100;

// ==========================================
// SECTION 1: STATES AND RECORDS
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Normal,
    PreAlarm,
    TargetReached,
    OvershootWarning,
    OvershootAlarm,
}

impl AlarmState {
    pub fn severity(self) -> AlarmSeverity {
        match self {
            AlarmState::Normal | AlarmState::PreAlarm => AlarmSeverity::Info,
            AlarmState::TargetReached => AlarmSeverity::Warning,
            AlarmState::OvershootWarning => AlarmSeverity::Critical,
            AlarmState::OvershootAlarm => AlarmSeverity::Emergency,
        }
    }

    pub fn is_overshoot(self) -> bool {
        matches!(self, AlarmState::OvershootWarning | AlarmState::OvershootAlarm)
    }

    /// Most severe state whose threshold `volume` has reached
    pub fn evaluate(volume: f64, thresholds: &OperationThresholds) -> AlarmState {
        let reached = |threshold: f64| match thresholds.operation_type {
            OperationType::Loading => volume >= threshold,
            OperationType::Unloading => volume <= threshold,
        };

        if reached(thresholds.overshoot_alarm_volume) {
            AlarmState::OvershootAlarm
        } else if reached(thresholds.overshoot_warning_volume) {
            AlarmState::OvershootWarning
        } else if reached(thresholds.target_volume) {
            AlarmState::TargetReached
        } else if reached(thresholds.pre_alarm_volume) {
            AlarmState::PreAlarm
        } else {
            AlarmState::Normal
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlarmState::Normal => "normal",
            AlarmState::PreAlarm => "pre-alarm",
            AlarmState::TargetReached => "target reached",
            AlarmState::OvershootWarning => "overshoot warning",
            AlarmState::OvershootAlarm => "overshoot alarm",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Info = 1,
    Warning = 2,
    Critical = 3,
    Emergency = 4,
}

/// Live alarm view for one active operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmStatus {
    pub tank_id: TankId,
    pub current_state: AlarmState,
    pub previous_state: AlarmState,
    pub operation_type: OperationType,
    pub current_volume: f64,
    pub target_volume: f64,
    pub progress_pct: f64,
    pub overshoot_pct: f64,
    pub alarm_triggered_at: Option<DateTime<Utc>>,
    pub is_audio_playing: bool,
    pub should_flash: bool,
    pub requires_acknowledgment: bool,
}

/// One state change. Only the acknowledgment fields change after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub id: Uuid,
    pub tank_id: TankId,
    pub timestamp: DateTime<Utc>,
    pub state: AlarmState,
    pub operation_type: OperationType,
    pub current_volume: f64,
    pub target_volume: f64,
    /// Litres past target in the operation's direction (0 before target)
    pub overshoot_amount: f64,
    pub severity: AlarmSeverity,
    pub message: String,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

/// Append-only event log capped at [`MAX_HISTORY`], oldest dropped first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmHistory {
    events: VecDeque<AlarmEvent>,
}

impl AlarmHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: AlarmEvent) {
        if self.events.len() == MAX_HISTORY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &AlarmEvent> {
        self.events.iter()
    }

    pub fn latest(&self) -> Option<&AlarmEvent> {
        self.events.back()
    }

    /// Stamp the most recent unacknowledged event for `state`
    fn acknowledge_latest(&mut self, state: AlarmState, user: &str, at: DateTime<Utc>) -> Option<&AlarmEvent> {
        let event = self
            .events
            .iter_mut()
            .rev()
            .find(|e| e.state == state && !e.acknowledged)?;
        event.acknowledged = true;
        event.acknowledged_at = Some(at);
        event.acknowledged_by = Some(user.to_string());
        Some(event)
    }
}

// ==========================================
// SECTION 2: STATE MACHINE
// ==========================================

/// Collaborators for one alarm call. The config is a snapshot for the whole pass.
pub struct AlarmContext<'a> {
    pub config: &'a Config,
    pub scheduler: &'a dyn Scheduler,
    pub audio: &'a dyn AudioSink,
    pub listeners: &'a AlarmListeners,
}

/// Result of delivering a fired timer
#[derive(Debug, Clone, PartialEq)]
pub enum TimerOutcome {
    /// Stale generation, or nothing left to act on
    Ignored,
    /// Deferred overshoot state surfaced to listeners and audio
    Escalated(AlarmStatus),
    /// Alarm forced back to no live status
    AutoReset,
}

pub struct AlarmStateMachine {
    tank_id: TankId,
    thresholds: OperationThresholds,
    status: Option<AlarmStatus>,
    history: AlarmHistory,
    escalation: Option<TimerHandle>,
    auto_reset: Option<TimerHandle>,
    generation: u64,
}

impl AlarmStateMachine {
    pub fn new(tank_id: TankId, thresholds: OperationThresholds) -> Self {
        Self::resume(tank_id, thresholds, AlarmHistory::new(), 0)
    }

    /// Start a new operation on a tank, keeping its earlier events.
    ///
    /// `generation` must be the last one the tank handed out, so timers
    /// still in flight from the previous operation stay stale.
    pub fn resume(
        tank_id: TankId,
        thresholds: OperationThresholds,
        history: AlarmHistory,
        generation: u64,
    ) -> Self {
        Self {
            tank_id,
            thresholds,
            status: None,
            history,
            escalation: None,
            auto_reset: None,
            generation,
        }
    }

    pub fn tank_id(&self) -> &TankId {
        &self.tank_id
    }

    pub fn thresholds(&self) -> &OperationThresholds {
        &self.thresholds
    }

    /// `None` before the first update and after a reset
    pub fn status(&self) -> Option<&AlarmStatus> {
        self.status.as_ref()
    }

    pub fn state(&self) -> AlarmState {
        self.status
            .as_ref()
            .map(|s| s.current_state)
            .unwrap_or(AlarmState::Normal)
    }

    pub fn history(&self) -> &AlarmHistory {
        &self.history
    }

    pub fn into_history(self) -> AlarmHistory {
        self.history
    }

    /// Generation stamped on the most recently scheduled timers
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Surfacing of the current overshoot state is waiting on its delay
    pub fn escalation_pending(&self) -> bool {
        self.escalation.is_some()
    }

    /// Evaluate `volume` and apply the side effects of any state change.
    pub fn update(&mut self, volume: f64, ctx: &AlarmContext<'_>, now: DateTime<Utc>) -> AlarmStatus {
        let t = &self.thresholds;
        let enabled = match t.operation_type {
            OperationType::Loading => ctx.config.alarms.loading_enabled,
            OperationType::Unloading => ctx.config.alarms.unloading_enabled,
        };
        let next_state = if enabled {
            AlarmState::evaluate(volume, t)
        } else {
            AlarmState::Normal
        };

        let progress_pct = (100.0 * t.transferred(volume) / t.operation_quantity).max(0.0);
        let overshoot_pct = (100.0 * t.past_target(volume) / t.operation_quantity).max(0.0);

        let current_state = self.state();
        let mut status = self.status.take().unwrap_or_else(|| AlarmStatus {
            tank_id: self.tank_id.clone(),
            current_state: AlarmState::Normal,
            previous_state: AlarmState::Normal,
            operation_type: t.operation_type,
            current_volume: volume,
            target_volume: t.target_volume,
            progress_pct,
            overshoot_pct,
            alarm_triggered_at: None,
            is_audio_playing: false,
            should_flash: false,
            requires_acknowledgment: false,
        });
        status.current_volume = volume;
        status.progress_pct = progress_pct;
        status.overshoot_pct = overshoot_pct;

        if next_state == current_state {
            self.status = Some(status.clone());
            if !self.escalation_pending() {
                ctx.listeners.notify_status(&status);
            }
            return status;
        }

        self.transition(status, next_state, ctx, now)
    }

    fn transition(
        &mut self,
        mut status: AlarmStatus,
        next_state: AlarmState,
        ctx: &AlarmContext<'_>,
        now: DateTime<Utc>,
    ) -> AlarmStatus {
        let from = status.current_state;
        self.cancel_timers();
        self.generation += 1;

        if status.is_audio_playing {
            ctx.audio.stop();
            status.is_audio_playing = false;
        }

        status.previous_state = from;
        status.current_state = next_state;
        status.should_flash = next_state.is_overshoot();
        status.alarm_triggered_at = (next_state != AlarmState::Normal).then_some(now);
        if next_state == AlarmState::OvershootAlarm {
            status.requires_acknowledgment = true;
        }

        let t = &self.thresholds;
        let event = AlarmEvent {
            id: Uuid::new_v4(),
            tank_id: self.tank_id.clone(),
            timestamp: now,
            state: next_state,
            operation_type: t.operation_type,
            current_volume: status.current_volume,
            target_volume: t.target_volume,
            overshoot_amount: t.past_target(status.current_volume).max(0.0),
            severity: next_state.severity(),
            message: format!(
                "Tank {} {}: {} at {:.1} L (target {:.1} L)",
                self.tank_id, t.operation_type, next_state, status.current_volume, t.target_volume
            ),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        };
        self.history.push(event);

        match next_state.severity() {
            AlarmSeverity::Critical | AlarmSeverity::Emergency => {
                warn!("Tank {} alarm {} -> {} at {:.1} L", self.tank_id, from, next_state, status.current_volume)
            }
            _ => info!("Tank {} alarm {} -> {} at {:.1} L", self.tank_id, from, next_state, status.current_volume),
        }

        let delay = ctx.config.alarms.escalation_delay();
        if next_state.is_overshoot() {
            if !delay.is_zero() {
                debug!("Tank {} deferring {} for {:?}", self.tank_id, next_state, delay);
                self.escalation = Some(ctx.scheduler.schedule(delay, self.timer(TimerKind::Escalation)));
            }
            if let Some(reset_after) = ctx.config.alarms.auto_reset() {
                self.auto_reset = Some(ctx.scheduler.schedule(reset_after, self.timer(TimerKind::AutoReset)));
            }
        }

        if self.escalation.is_none() {
            Self::surface(&mut status, &self.history, ctx);
        }
        self.status = Some(status.clone());
        status
    }

    /// Hand the current state to listeners and the audio subsystem
    fn surface(status: &mut AlarmStatus, history: &AlarmHistory, ctx: &AlarmContext<'_>) {
        if let Some(trigger) =
            select_audio_cue(status.current_state, status.operation_type, &ctx.config.audio)
        {
            ctx.audio.play(&trigger);
            status.is_audio_playing = true;
        }

        if let Some(event) = history.latest() {
            ctx.listeners.notify_event(event);
        }
        ctx.listeners.notify_status(status);
    }

    /// Deliver a fired timer. Stale timers are no-ops.
    pub fn on_timer(&mut self, timer: &TimerId, ctx: &AlarmContext<'_>) -> TimerOutcome {
        if timer.generation != self.generation {
            debug!(
                "Ignoring stale {:?} timer for tank {} (generation {} != {})",
                timer.kind, self.tank_id, timer.generation, self.generation
            );
            return TimerOutcome::Ignored;
        }
        if self.state() == AlarmState::Normal {
            return TimerOutcome::Ignored;
        }

        match timer.kind {
            TimerKind::Escalation => {
                if self.escalation.take().is_none() {
                    return TimerOutcome::Ignored;
                }
                match self.status.as_mut() {
                    Some(status) => {
                        Self::surface(status, &self.history, ctx);
                        TimerOutcome::Escalated(status.clone())
                    }
                    None => TimerOutcome::Ignored,
                }
            }
            TimerKind::AutoReset => {
                if self.auto_reset.take().is_none() {
                    return TimerOutcome::Ignored;
                }
                info!("Tank {} alarm auto-reset after timeout", self.tank_id);
                self.reset(ctx);
                TimerOutcome::AutoReset
            }
        }
    }

    /// Operator acknowledgment. Returns the stamped event, if one matched.
    pub fn acknowledge(&mut self, user: &str, ctx: &AlarmContext<'_>, now: DateTime<Utc>) -> Option<AlarmEvent> {
        let status = self.status.as_mut()?;
        status.requires_acknowledgment = false;
        status.is_audio_playing = false;
        ctx.audio.stop();

        // Acknowledgment also settles a pending escalation and the auto-reset
        for handle in [self.escalation.take(), self.auto_reset.take()].into_iter().flatten() {
            handle.cancel();
        }

        let state = status.current_state;
        info!("Tank {} {} acknowledged by {}", self.tank_id, state, user);
        let stamped = self.history.acknowledge_latest(state, user, now).cloned();

        if let Some(event) = &stamped {
            ctx.listeners.notify_event(event);
        }
        ctx.listeners.notify_status(status);
        stamped
    }

    /// Cancel timers, stop audio and clear the live status. History is kept.
    pub fn reset(&mut self, ctx: &AlarmContext<'_>) {
        self.cancel_timers();
        self.generation += 1;
        ctx.audio.stop();
        if self.status.take().is_some() {
            debug!("Tank {} alarm status cleared", self.tank_id);
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(handle) = self.escalation.take() {
            handle.cancel();
        }
        if let Some(handle) = self.auto_reset.take() {
            handle.cancel();
        }
    }

    fn timer(&self, kind: TimerKind) -> TimerId {
        TimerId {
            tank_id: self.tank_id.clone(),
            kind,
            generation: self.generation,
        }
    }
}
