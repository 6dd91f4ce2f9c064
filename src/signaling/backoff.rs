//! # Reconnect Backoff
//!
//! Implements the signaling reconnect policy from spec.md §4.1: exponential
//! backoff from [`SIGNALING_BACKOFF_INITIAL`], capped at
//! [`SIGNALING_BACKOFF_MAX`] while isolated and at the wider
//! [`SIGNALING_BACKOFF_MAX_MESHED`] once at least one direct peer connection
//! is live, and parked at [`SIGNALING_EXTENDED_BACKOFF`] after
//! [`SIGNALING_MAX_ATTEMPTS`] consecutive failures.

use std::time::Duration;

use crate::config::{
    SIGNALING_BACKOFF_INITIAL, SIGNALING_BACKOFF_MAX, SIGNALING_BACKOFF_MAX_MESHED,
    SIGNALING_BACKOFF_MESHED_MULTIPLIER, SIGNALING_EXTENDED_BACKOFF, SIGNALING_MAX_ATTEMPTS,
};

/// Tracks consecutive reconnect failures and computes the next delay.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempt: u32,
    meshed: bool,
}

impl ReconnectBackoff {
    /// A fresh backoff tracker, starting unmeshed with zero failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tell the tracker whether this peer currently has at least one live
    /// direct connection. Affects the backoff ceiling on the next failure.
    pub fn set_meshed(&mut self, meshed: bool) {
        self.meshed = meshed;
    }

    /// Record a successful connection, resetting the failure count.
    pub fn record_success(&mut self) {
        self.attempt = 0;
    }

    /// Record a failed connection attempt and return how long to wait
    /// before trying again.
    ///
    /// Once [`SIGNALING_MAX_ATTEMPTS`] consecutive failures have piled up,
    /// this delay is [`SIGNALING_EXTENDED_BACKOFF`] — but the counter is
    /// then reset to half the threshold (spec.md §4.1: "reset counter to
    /// half") rather than left to grow or park forever, so the *next*
    /// failure resumes ordinary exponential growth instead of repeating
    /// the extended interval indefinitely.
    pub fn record_failure(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.current_delay();
        if self.attempt > SIGNALING_MAX_ATTEMPTS {
            self.attempt = SIGNALING_MAX_ATTEMPTS / 2;
        }
        delay
    }

    /// The delay that would apply to the *next* attempt without recording a
    /// new failure. Useful for tests and diagnostics.
    pub fn current_delay(&self) -> Duration {
        if self.attempt > SIGNALING_MAX_ATTEMPTS {
            return SIGNALING_EXTENDED_BACKOFF;
        }
        if self.attempt == 0 {
            return Duration::ZERO;
        }

        let ceiling = if self.meshed {
            SIGNALING_BACKOFF_MAX_MESHED
        } else {
            SIGNALING_BACKOFF_MAX
        };
        let multiplier = if self.meshed {
            SIGNALING_BACKOFF_MESHED_MULTIPLIER
        } else {
            1
        };

        let shift = self.attempt.saturating_sub(1).min(16);
        let exp = SIGNALING_BACKOFF_INITIAL * 2u32.saturating_pow(shift);
        (exp * multiplier).min(ceiling)
    }

    /// Number of consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_while_isolated() {
        let mut b = ReconnectBackoff::new();
        let d1 = b.record_failure();
        let d2 = b.record_failure();
        let d3 = b.record_failure();
        assert!(d1 < d2);
        assert!(d2 < d3);
        assert_eq!(d1, SIGNALING_BACKOFF_INITIAL);
    }

    #[test]
    fn backoff_caps_at_ceiling_while_isolated() {
        let mut b = ReconnectBackoff::new();
        for _ in 0..SIGNALING_MAX_ATTEMPTS {
            b.record_failure();
        }
        assert_eq!(b.current_delay(), SIGNALING_BACKOFF_MAX);
    }

    #[test]
    fn meshed_ceiling_is_wider_and_uses_multiplier() {
        let mut b = ReconnectBackoff::new();
        b.set_meshed(true);
        for _ in 0..SIGNALING_MAX_ATTEMPTS {
            b.record_failure();
        }
        assert_eq!(b.current_delay(), SIGNALING_BACKOFF_MAX_MESHED);
    }

    #[test]
    fn extended_backoff_after_max_attempts() {
        let mut b = ReconnectBackoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..=SIGNALING_MAX_ATTEMPTS {
            last = b.record_failure();
        }
        assert_eq!(last, SIGNALING_EXTENDED_BACKOFF);
    }

    #[test]
    fn counter_resets_to_half_after_extended_backoff() {
        let mut b = ReconnectBackoff::new();
        for _ in 0..=SIGNALING_MAX_ATTEMPTS {
            b.record_failure();
        }
        assert_eq!(b.attempt(), SIGNALING_MAX_ATTEMPTS / 2);
    }

    #[test]
    fn success_resets_attempt_counter() {
        let mut b = ReconnectBackoff::new();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.current_delay(), Duration::ZERO);
    }
}
