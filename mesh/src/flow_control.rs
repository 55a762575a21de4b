//! Per-peer retry pacing for background reconnection.

use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};

/// Tracks failed dials to one peer and when the next one may start.
/// Delays start at `base_delay`, double per failure and stop growing at
/// `max_delay`. Attempts never run out.
pub struct RetryManager {
    backoff: ExponentialBackoff,
    attempts: u32,
    next_attempt_at: Option<Instant>,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl RetryManager {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(base_delay)
            .with_max_interval(max_delay.max(base_delay))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();
        Self {
            backoff,
            attempts: 0,
            next_attempt_at: None,
        }
    }

    /// Whether the backoff window since the last failure has passed.
    pub fn should_retry(&self) -> bool {
        self.next_attempt_at.map_or(true, |at| Instant::now() >= at)
    }

    /// Record a failed attempt and schedule the next one.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        self.next_attempt_at = Some(Instant::now() + delay);
    }

    /// Time left until the next attempt is allowed.
    pub fn next_delay(&self) -> Duration {
        self.next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempts = 0;
        self.next_attempt_at = None;
    }
}
