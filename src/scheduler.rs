// src/scheduler.rs - Cancellable alarm timers on tokio or a virtual clock

use crate::registry::TankId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Delay before an overshoot state is surfaced
    Escalation,
    /// Forced reset of an unacknowledged alarm
    AutoReset,
}

/// Identifies a timer and the alarm transition that armed it.
///
/// A fired timer whose `generation` no longer matches its state machine is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub tank_id: TankId,
    pub kind: TimerKind,
    pub generation: u64,
}

/// Cancel handle returned by [`Scheduler::schedule`]
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Source of delayed timer deliveries
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, timer: TimerId) -> TimerHandle;
}

// ============================================================================
// TOKIO SCHEDULER
// ============================================================================

/// Wall-clock timers. Fired ids arrive on the receiver returned by [`TokioScheduler::new`].
pub struct TokioScheduler {
    runtime: Handle,
    sender: mpsc::UnboundedSender<TimerId>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> (Self, mpsc::UnboundedReceiver<TimerId>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { runtime, sender }, receiver)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, timer: TimerId) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let sender = self.sender.clone();

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                trace!("Timer {:?} fired for tank {}", timer.kind, timer.tank_id);
                // Receiver gone means the engine has shut down
                let _ = sender.send(timer);
            }
        });

        TimerHandle::new(cancelled, Some(task.abort_handle()))
    }
}

// ============================================================================
// MANUAL SCHEDULER
// ============================================================================

struct PendingTimer {
    deadline: Duration,
    sequence: u64,
    timer: TimerId,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    sequence: u64,
    pending: Vec<PendingTimer>,
}

/// Virtual clock for tests and scenario replay. Nothing fires until
/// [`advance`](ManualScheduler::advance) is called.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Live (not cancelled, not fired) timers
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|p| !p.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Move the clock forward and return every timer that came due, in
    /// deadline order (ties in scheduling order).
    pub fn advance(&self, by: Duration) -> Vec<TimerId> {
        let mut state = self.state.lock();
        state.now += by;
        let now = state.now;

        let (mut due, rest): (Vec<PendingTimer>, Vec<PendingTimer>) = std::mem::take(&mut state.pending)
            .into_iter()
            .filter(|p| !p.cancelled.load(Ordering::SeqCst))
            .partition(|p| p.deadline <= now);
        state.pending = rest;

        due.sort_by_key(|p| (p.deadline, p.sequence));
        due.into_iter().map(|p| p.timer).collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, timer: TimerId) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        state.sequence += 1;
        let pending = PendingTimer {
            deadline: state.now + delay,
            sequence: state.sequence,
            timer,
            cancelled: cancelled.clone(),
        };
        state.pending.push(pending);
        TimerHandle::new(cancelled, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: TimerKind, generation: u64) -> TimerId {
        TimerId {
            tank_id: TankId::from("T1"),
            kind,
            generation,
        }
    }

    #[test]
    fn test_manual_fires_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        scheduler.schedule(Duration::from_secs(10), id(TimerKind::AutoReset, 1));
        scheduler.schedule(Duration::from_secs(3), id(TimerKind::Escalation, 1));
        assert_eq!(scheduler.pending(), 2);

        assert!(scheduler.advance(Duration::from_secs(2)).is_empty());
        let fired = scheduler.advance(Duration::from_secs(20));
        assert_eq!(
            fired,
            vec![id(TimerKind::Escalation, 1), id(TimerKind::AutoReset, 1)]
        );
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.now(), Duration::from_secs(22));
    }

    #[test]
    fn test_manual_cancel() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.schedule(Duration::from_secs(1), id(TimerKind::Escalation, 1));
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(scheduler.advance(Duration::from_secs(5)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_delivers() {
        let (scheduler, mut fired) = TokioScheduler::new(Handle::current());
        scheduler.schedule(Duration::from_millis(500), id(TimerKind::Escalation, 7));

        tokio::time::advance(Duration::from_millis(600)).await;
        let timer = fired.recv().await.unwrap();
        assert_eq!(timer.generation, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_cancelled_timer_is_dropped() {
        let (scheduler, mut fired) = TokioScheduler::new(Handle::current());
        let handle = scheduler.schedule(Duration::from_millis(500), id(TimerKind::AutoReset, 1));
        scheduler.schedule(Duration::from_millis(900), id(TimerKind::AutoReset, 2));
        handle.cancel();

        tokio::time::advance(Duration::from_secs(1)).await;
        let timer = fired.recv().await.unwrap();
        assert_eq!(timer.generation, 2);
    }
}
