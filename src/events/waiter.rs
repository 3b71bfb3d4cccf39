//! Fixed-step cooperative waiter
//!
//! For blocking-style callers that poll an external condition: each
//! `wait()` sleeps one step and reports whether the deadline still
//! allows another attempt.

use std::time::{Duration, Instant};

/// Default sleep per `wait()` call.
pub const DEFAULT_STEP: Duration = Duration::from_millis(100);

/// Sleeps in fixed steps until an optional deadline passes.
#[derive(Debug, Clone)]
pub struct Waiter {
    deadline: Option<Instant>,
    step: Duration,
}

impl Waiter {
    /// A waiter with the default step. `timeout: None` waits forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_step(timeout, DEFAULT_STEP)
    }

    pub fn with_step(timeout: Option<Duration>, step: Duration) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            step,
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Sleep one step. Returns `false` once the deadline has passed,
    /// without sleeping, so callers can write `while waiter.wait() { … }`.
    pub fn wait(&self) -> bool {
        if self.expired() {
            return false;
        }
        std::thread::sleep(self.step);
        true
    }
}
