//! Error accounting for a single consumer worker.
//!
//! Tracks processing failures against the group's `max_errors` threshold.
//! The count resets at every restart boundary and, matching the original
//! behavior, after a quiet period with no failures. A success never resets
//! the count, so a low steady-state failure rate is not masked.

use std::time::{Duration, Instant};

use tracing::debug;

use drover_common::ConsumerGroupSpec;

/// What the worker should do after a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Restart,
}

#[derive(Debug)]
pub struct ErrorAccountant {
    threshold: Option<u32>,
    window: Duration,
    count: u32,
    successes: u64,
    last_failure: Option<Instant>,
    tripped: bool,
}

impl ErrorAccountant {
    pub fn new(threshold: Option<u32>, window: Duration) -> Self {
        Self {
            threshold: threshold.filter(|n| *n > 0),
            window,
            count: 0,
            successes: 0,
            last_failure: None,
            tripped: false,
        }
    }

    pub fn for_spec(spec: &ConsumerGroupSpec) -> Self {
        Self::new(
            spec.error_threshold(),
            Duration::from_secs(spec.error_window_secs),
        )
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
    }

    /// Record one processing failure. Returns `Restart` exactly once when
    /// the count reaches the threshold; a fatal failure restarts
    /// immediately regardless of the count.
    pub fn record_failure(&mut self, fatal: bool) -> Decision {
        self.record_failure_at(fatal, Instant::now())
    }

    fn record_failure_at(&mut self, fatal: bool, now: Instant) -> Decision {
        if !self.window.is_zero() {
            if let Some(last) = self.last_failure {
                if now.duration_since(last) > self.window {
                    debug!(
                        stale_count = self.count,
                        "Quiet period elapsed, resetting error counter"
                    );
                    self.count = 0;
                    self.tripped = false;
                }
            }
        }

        self.count += 1;
        self.last_failure = Some(now);

        if fatal {
            self.tripped = true;
            return Decision::Restart;
        }

        match self.threshold {
            Some(limit) if !self.tripped && self.count >= limit => {
                self.tripped = true;
                Decision::Restart
            }
            _ => Decision::Continue,
        }
    }

    /// Called at every `Connecting` transition (the restart boundary).
    pub fn reset(&mut self) {
        self.count = 0;
        self.last_failure = None;
        self.tripped = false;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }
}
