//! Worker lifecycle: the self-healing state machine, the overlay-miss
//! window behind the Degraded transitions, and reconnect backoff.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::info;
use vigil_protocol::WorkerState;

use crate::error::StageError;

/// Sliding window used for the Degraded hysteresis.
pub const HEALTH_WINDOW: Duration = Duration::from_secs(10);
/// Running → Degraded above this overlay-miss ratio.
pub const DEGRADE_ENTER_RATIO: f32 = 0.30;
/// Degraded → Running below this ratio.
pub const DEGRADE_EXIT_RATIO: f32 = 0.10;

/// Per-frame overlay outcomes over the last [`HEALTH_WINDOW`].
pub struct HealthWindow {
    window: Duration,
    samples: VecDeque<(Instant, bool)>,
}

impl HealthWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, missed: bool, now: Instant) {
        self.samples.push_back((now, missed));
        self.prune(now);
    }

    /// Fraction of frames in the window that passed through unannotated.
    /// An empty window reads as healthy.
    pub fn missed_ratio(&mut self, now: Instant) -> f32 {
        self.prune(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let missed = self.samples.iter().filter(|(_, m)| *m).count();
        missed as f32 / self.samples.len() as f32
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) < self.window {
                break;
            }
            self.samples.pop_front();
        }
    }
}

/// Exponential reconnect backoff: 1 s doubling to 60 s, ±20% jitter.
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Next delay with jitter applied; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base();
        jitter(base, rand::thread_rng().gen_range(-0.2..=0.2))
    }

    /// Next delay without jitter; advances the schedule.
    pub fn next_base(&mut self) -> Duration {
        let current = self.current;
        self.current = (self.current * 2).min(self.max);
        current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Scale a duration by `1 + fraction`, where fraction is in [-0.2, 0.2].
pub fn jitter(base: Duration, fraction: f64) -> Duration {
    base.mul_f64((1.0 + fraction).max(0.0))
}

/// The camera worker state machine. Transitions outside the table are
/// ignored rather than panicking; callers drive it from event order that
/// can race around shutdown.
pub struct StateMachine {
    state: WorkerState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn on_start(&mut self) -> Option<WorkerState> {
        self.transition(WorkerState::Connecting)
    }

    /// First decoded frame entered the frame bus.
    pub fn on_first_frame(&mut self) -> Option<WorkerState> {
        if self.state == WorkerState::Connecting {
            self.transition(WorkerState::Running)
        } else {
            None
        }
    }

    /// Periodic health evaluation while streaming.
    pub fn on_health(&mut self, missed_ratio: f32) -> Option<WorkerState> {
        match self.state {
            WorkerState::Running if missed_ratio > DEGRADE_ENTER_RATIO => {
                self.transition(WorkerState::Degraded)
            }
            WorkerState::Degraded if missed_ratio < DEGRADE_EXIT_RATIO => {
                self.transition(WorkerState::Running)
            }
            _ => None,
        }
    }

    /// A stage raised a terminal error.
    /// Transient errors retry; fatal ones close the worker for good.
    pub fn on_error(&mut self, error: &StageError) -> Option<WorkerState> {
        if self.state == WorkerState::Closed {
            return None;
        }
        if error.is_fatal() {
            self.transition(WorkerState::Closed)
        } else {
            self.transition(WorkerState::Failed)
        }
    }

    pub fn on_retry_scheduled(&mut self) -> Option<WorkerState> {
        if self.state == WorkerState::Failed {
            self.transition(WorkerState::Retrying)
        } else {
            None
        }
    }

    pub fn on_backoff_elapsed(&mut self) -> Option<WorkerState> {
        if self.state == WorkerState::Retrying {
            self.transition(WorkerState::Connecting)
        } else {
            None
        }
    }

    pub fn on_stop(&mut self) -> Option<WorkerState> {
        self.transition(WorkerState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state == WorkerState::Closed
    }

    fn transition(&mut self, next: WorkerState) -> Option<WorkerState> {
        if self.state == next {
            return None;
        }
        info!(from = %self.state, to = %next, "Worker state transition");
        self.state = next;
        Some(next)
    }
}
