//! Alarm observers.
//!
//! Listeners are invoked in registration order. A listener that returns an
//! error is logged and skipped; the remaining listeners still run.

use crate::alarm::{AlarmEvent, AlarmStatus};
use crate::error::{Result, TankError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub trait AlarmListener: Send + Sync {
    fn on_status(&self, status: &AlarmStatus) -> Result<()>;
    fn on_event(&self, event: &AlarmEvent) -> Result<()>;
}

/// Ordered listener list
#[derive(Default, Clone)]
pub struct AlarmListeners {
    listeners: Vec<(String, Arc<dyn AlarmListener>)>,
}

impl AlarmListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, listener: Arc<dyn AlarmListener>) {
        self.listeners.push((name.into(), listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn notify_status(&self, status: &AlarmStatus) {
        for (name, listener) in &self.listeners {
            if let Err(e) = listener.on_status(status) {
                warn!("Alarm listener '{}' failed on status for tank {}: {}", name, status.tank_id, e);
            }
        }
    }

    pub fn notify_event(&self, event: &AlarmEvent) {
        for (name, listener) in &self.listeners {
            if let Err(e) = listener.on_event(event) {
                warn!("Alarm listener '{}' failed on event {}: {}", name, event.id, e);
            }
        }
    }
}

/// Message carried by [`ChannelListener`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmNotification {
    Status(AlarmStatus),
    Event(AlarmEvent),
}

/// Forwards notifications to an async consumer such as a display layer
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<AlarmNotification>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlarmNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AlarmListener for ChannelListener {
    fn on_status(&self, status: &AlarmStatus) -> Result<()> {
        self.sender
            .send(AlarmNotification::Status(status.clone()))
            .map_err(|_| TankError::ChannelClosed)
    }

    fn on_event(&self, event: &AlarmEvent) -> Result<()> {
        self.sender
            .send(AlarmNotification::Event(event.clone()))
            .map_err(|_| TankError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmState;
    use crate::thresholds::OperationType;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl AlarmListener for Recorder {
        fn on_status(&self, status: &AlarmStatus) -> Result<()> {
            self.log.lock().push(format!("{}:{:?}", self.tag, status.current_state));
            if self.fail {
                return Err(TankError::ChannelClosed);
            }
            Ok(())
        }

        fn on_event(&self, _event: &AlarmEvent) -> Result<()> {
            Ok(())
        }
    }

    fn status() -> AlarmStatus {
        AlarmStatus {
            tank_id: "T1".into(),
            current_state: AlarmState::PreAlarm,
            previous_state: AlarmState::Normal,
            operation_type: OperationType::Loading,
            current_volume: 560.0,
            target_volume: 600.0,
            progress_pct: 92.0,
            overshoot_pct: 0.0,
            alarm_triggered_at: Some(Utc::now()),
            is_audio_playing: false,
            should_flash: false,
            requires_acknowledgment: false,
        }
    }

    #[test]
    fn test_registration_order_and_fault_isolation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = AlarmListeners::new();
        for (tag, fail) in [("a", false), ("b", true), ("c", false)] {
            listeners.register(
                tag,
                Arc::new(Recorder {
                    tag,
                    log: log.clone(),
                    fail,
                }),
            );
        }

        listeners.notify_status(&status());
        assert_eq!(*log.lock(), vec!["a:PreAlarm", "b:PreAlarm", "c:PreAlarm"]);
    }

    #[test]
    fn test_channel_listener() {
        let (listener, mut receiver) = ChannelListener::new();
        listener.on_status(&status()).unwrap();
        match receiver.try_recv().unwrap() {
            AlarmNotification::Status(s) => assert_eq!(s.current_state, AlarmState::PreAlarm),
            other => panic!("unexpected notification {:?}", other),
        }

        drop(receiver);
        assert!(matches!(listener.on_status(&status()), Err(TankError::ChannelClosed)));
    }
}
