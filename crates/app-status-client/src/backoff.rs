//! # Exponential Backoff
//!
//! Doubling backoff with a cap and optional equal jitter.
//!
//! Used by the status publisher between retry attempts (1s, 2s, 4s, capped at
//! 8s) and by the pod watcher between reconnects (1s doubling to 30s).
//! With jitter enabled each delay is drawn uniformly from `[d/2, d]`, so
//! controller replicas restarted together do not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff calculator
///
/// Each call to `next_backoff` returns the current delay and doubles it for
/// the next call, never exceeding `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial delay (restored on reset)
    base: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Upper bound for any delay
    max: Duration,
    /// Draw each delay from `[d/2, d]`
    jitter: bool,
}

impl ExponentialBackoff {
    /// Create a new backoff with jitter enabled
    ///
    /// # Arguments
    ///
    /// * `base` - First delay (typically 1s)
    /// * `max` - Cap for all delays
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            current: base,
            max,
            jitter: true,
        }
    }

    /// Disable jitter, producing exact powers of two (tests, deterministic retries)
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);

        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// Get the next backoff duration in whole seconds
    #[cfg(test)]
    pub fn next_backoff_seconds(&mut self) -> u64 {
        self.next_backoff().as_secs()
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if millis < 2 {
        return delay;
    }
    let low = millis / 2;
    Duration::from_millis(rand::thread_rng().gen_range(low..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30)).without_jitter();

        // 1s, 2s, 4s, 8s, 16s, 30s (max)
        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 2);
        assert_eq!(backoff.next_backoff_seconds(), 4);
        assert_eq!(backoff.next_backoff_seconds(), 8);
        assert_eq!(backoff.next_backoff_seconds(), 16);
        assert_eq!(backoff.next_backoff_seconds(), 30);
        assert_eq!(backoff.next_backoff_seconds(), 30);
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8)).without_jitter();

        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();

        // Should restart from beginning after success
        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 2);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(4));
        for _ in 0..50 {
            let delay = backoff.next_backoff();
            assert!(delay >= Duration::from_secs(2), "delay {:?} below half", delay);
            assert!(delay <= Duration::from_secs(4), "delay {:?} above cap", delay);
        }
    }
}
