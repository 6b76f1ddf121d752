// =================================================================
// stream/backoff.rs - Reconnect Backoff Controller
// =================================================================

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use super::StreamConfig;

const JITTER_MIN: f64 = 0.5;
const JITTER_MAX: f64 = 1.0;

/// Outcome of asking the controller for the next retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait `delay` before retry number `attempt` (zero based)
    Retry { attempt: u32, delay: Duration },
    /// `attempts` failures recorded, stop retrying
    Exhausted { attempts: u32 },
}

/// Exponential backoff with jitter and a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempt: u32,
    next_retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempt: 0,
            next_retry_at: None,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.base_delay,
            config.max_delay,
            config.max_reconnect_attempts,
        )
    }

    /// Un-jittered delay: min(max, base * 2^attempt)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay for `attempt` scaled by an explicit jitter factor, clamped to [0.5, 1.0]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = if jitter.is_nan() {
            JITTER_MAX
        } else {
            jitter.clamp(JITTER_MIN, JITTER_MAX)
        };
        self.ceiling(attempt).mul_f64(jitter)
    }

    /// Delay for `attempt` with a uniformly sampled jitter factor
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Record one failed attempt, then schedule the next or report exhaustion
    pub fn next_step(&mut self) -> BackoffStep {
        self.attempt = self.attempt.saturating_add(1);
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            self.next_retry_at = None;
            return BackoffStep::Exhausted {
                attempts: self.attempt,
            };
        }

        let retry = self.attempt - 1;
        let delay = self.delay(retry);
        self.next_retry_at = Some(Instant::now() + delay);

        BackoffStep::Retry {
            attempt: retry,
            delay,
        }
    }

    /// Back to the base delay, called on every transition into Active
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_retry_at = None;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(5), max_attempts)
    }

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let b = backoff(0);
        assert_eq!(b.ceiling(0), Duration::from_millis(100));
        assert_eq!(b.ceiling(1), Duration::from_millis(200));
        assert_eq!(b.ceiling(4), Duration::from_millis(1600));
        assert_eq!(b.ceiling(6), Duration::from_secs(5));
        assert_eq!(b.ceiling(200), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let b = backoff(0);
        assert_eq!(b.delay_with_jitter(1, 0.5), Duration::from_millis(100));
        assert_eq!(b.delay_with_jitter(1, 1.0), Duration::from_millis(200));
        // Out-of-range factors are clamped
        assert_eq!(b.delay_with_jitter(1, 0.1), Duration::from_millis(100));
        assert_eq!(b.delay_with_jitter(1, 3.0), Duration::from_millis(200));
    }

    #[test]
    fn test_exhaustion_on_the_max_failure() {
        let mut b = backoff(3);
        for expected in 0..2 {
            match b.next_step() {
                BackoffStep::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("expected retry, got {:?}", other),
            }
        }
        assert_eq!(b.next_step(), BackoffStep::Exhausted { attempts: 3 });
        assert!(b.next_retry_at().is_none());
    }

    #[test]
    fn test_single_attempt_budget_never_retries() {
        let mut b = backoff(1);
        assert_eq!(b.next_step(), BackoffStep::Exhausted { attempts: 1 });
    }

    #[test]
    fn test_unlimited_attempts() {
        let mut b = backoff(0);
        for _ in 0..100 {
            assert!(matches!(b.next_step(), BackoffStep::Retry { .. }));
        }
        assert_eq!(b.attempt(), 100);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut b = backoff(0);
        for _ in 0..5 {
            b.next_step();
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        match b.next_step() {
            BackoffStep::Retry { attempt, delay } => {
                assert_eq!(attempt, 0);
                assert!(delay >= Duration::from_millis(50));
                assert!(delay <= Duration::from_millis(100));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn prop_ceiling_is_monotone_and_capped(
            base_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            attempt in 0u32..64,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = base + Duration::from_millis(extra_ms);
            let b = Backoff::new(base, max, 0);

            prop_assert!(b.ceiling(attempt) <= b.ceiling(attempt + 1));
            prop_assert!(b.ceiling(attempt) <= max);
            prop_assert!(b.ceiling(attempt) >= base);
        }

        #[test]
        fn prop_sampled_delay_within_jitter_window(attempt in 0u32..40) {
            let b = backoff(0);
            let ceiling = b.ceiling(attempt);
            let delay = b.delay(attempt);
            // float conversion may be off by a nanosecond
            let slack = Duration::from_nanos(1);
            prop_assert!(delay <= ceiling + slack);
            prop_assert!(delay + slack >= ceiling / 2);
        }
    }
}
