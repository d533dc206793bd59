//! Pull backoff and suspension.
//!
//! Tracks consecutive network-class pull failures. Each failure arms a
//! cooldown during which polled pulls are skipped; reaching the
//! configured threshold suspends polled pulls entirely until a manual
//! sync request resets the controller. Push and realtime-driven merges
//! are never gated here.

use std::time::{Duration, Instant};

/// Backoff state for the pull pipeline.
#[derive(Debug)]
pub struct PullBackoff {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    suspended: bool,
}

impl PullBackoff {
    /// Creates a fresh controller with no recorded failures.
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            cooldown_until: None,
            suspended: false,
        }
    }

    /// Records a network-class pull failure.
    ///
    /// Returns true if this failure crossed the suspension threshold.
    pub fn record_network_failure(&mut self, cooldown: Duration, suspend_after: u32) -> bool {
        self.consecutive_failures += 1;
        self.cooldown_until = Some(Instant::now() + cooldown);

        if !self.suspended && self.consecutive_failures >= suspend_after {
            self.suspended = true;
            return true;
        }
        false
    }

    /// Records a successful pull attempt. Clears the failure streak
    /// and cooldown but not a standing suspension, which only a manual
    /// sync request lifts.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.cooldown_until = None;
    }

    /// Clears all backoff state, including suspension. Called on a
    /// manual sync request.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.cooldown_until = None;
        self.suspended = false;
    }

    /// Returns true if polled pulls are currently suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Returns the current consecutive-failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns true if a polled pull should be skipped right now.
    pub fn should_skip(&self, now: Instant) -> bool {
        if self.suspended {
            return true;
        }
        match self.cooldown_until {
            Some(deadline) => now < deadline,
            None => false,
        }
    }
}

impl Default for PullBackoff {
    fn default() -> Self {
        Self::new()
    }
}
