//! Per-subscription push throttle.
//!
//! ```text
//!            notify (window open)
//!   Idle ─────────────────────────────▶ Delivering
//!    │ notify (window closed)             │   ▲
//!    ▼                                    │   │ timer
//!   Pending(deadline) ◀── delivered ──────┘   │
//!        └──────────────────────────────────┘
//! ```
//!
//! Notifications that arrive while a push is pending are absorbed by the
//! pending deadline; those that arrive during a push set a rerun flag so
//! exactly one more push follows, no sooner than one interval later.

use std::time::Duration;

use tokio::time::Instant;

/// Throttle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleState {
    /// Nothing scheduled.
    Idle,
    /// One push is scheduled at the deadline.
    Pending(Instant),
    /// A push is running; `rerun` asks for another once it completes.
    Delivering {
        /// A notification arrived during the push.
        rerun: bool,
    },
}

/// What the caller must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Run a push now.
    PushNow,
    /// Arm a timer for the deadline.
    Schedule(Instant),
    /// Nothing to do.
    Wait,
}

/// Throttle state machine for one subscription.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    state: ThrottleState,
    last_push: Option<Instant>,
}

impl Throttle {
    /// Creates an idle throttle.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: ThrottleState::Idle,
            last_push: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ThrottleState {
        self.state
    }

    /// Minimum delay between two pushes.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the initial push, whatever the window.
    pub fn start(&mut self) -> ThrottleAction {
        match self.state {
            ThrottleState::Idle | ThrottleState::Pending(_) => {
                self.state = ThrottleState::Delivering { rerun: false };
                ThrottleAction::PushNow
            }
            ThrottleState::Delivering { .. } => ThrottleAction::Wait,
        }
    }

    /// A change notification arrived.
    pub fn on_notify(&mut self, now: Instant) -> ThrottleAction {
        match self.state {
            ThrottleState::Idle => match self.next_slot() {
                Some(deadline) if deadline > now => {
                    self.state = ThrottleState::Pending(deadline);
                    ThrottleAction::Schedule(deadline)
                }
                _ => {
                    self.state = ThrottleState::Delivering { rerun: false };
                    ThrottleAction::PushNow
                }
            },
            ThrottleState::Pending(_) => ThrottleAction::Wait,
            ThrottleState::Delivering { .. } => {
                self.state = ThrottleState::Delivering { rerun: true };
                ThrottleAction::Wait
            }
        }
    }

    /// The pending timer fired.
    pub fn on_timer(&mut self) -> ThrottleAction {
        match self.state {
            ThrottleState::Pending(_) => {
                self.state = ThrottleState::Delivering { rerun: false };
                ThrottleAction::PushNow
            }
            _ => ThrottleAction::Wait,
        }
    }

    /// A push completed at `now`.
    pub fn on_delivered(&mut self, now: Instant) -> ThrottleAction {
        let ThrottleState::Delivering { rerun } = self.state else {
            return ThrottleAction::Wait;
        };
        self.last_push = Some(now);
        if !rerun {
            self.state = ThrottleState::Idle;
            return ThrottleAction::Wait;
        }
        if self.interval.is_zero() {
            self.state = ThrottleState::Delivering { rerun: false };
            return ThrottleAction::PushNow;
        }
        let deadline = now + self.interval;
        self.state = ThrottleState::Pending(deadline);
        ThrottleAction::Schedule(deadline)
    }

    fn next_slot(&self) -> Option<Instant> {
        self.last_push.map(|last| last + self.interval)
    }
}
