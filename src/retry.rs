//! Backoff with jitter for deferred status-transition retries.
//!
//! A status check that finds a transition already in flight does not block;
//! it re-schedules itself after a jittered delay so concurrent checkers
//! spread out instead of stampeding the transition mutex together.

use rand::Rng;
use std::time::Duration;

/// Retry/backoff configuration.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Jitter mode for backoff delays (prevents thundering herd)
    pub jitter: JitterMode,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: JitterMode::Full,
        }
    }
}

impl RetryConfig {
    /// Delay before retry `attempt` (0-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(16) as i32);
        let base = self.initial_backoff.as_secs_f64() * exp;
        let capped = Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()));
        apply_jitter(capped, &self.jitter)
    }

    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }
}

/// Jitter mode for retry backoff.
#[derive(Clone, Debug, Default)]
pub enum JitterMode {
    /// No jitter - use exact backoff delay
    None,
    /// Full jitter: random delay between 0 and calculated backoff
    #[default]
    Full,
    /// Equal jitter: half fixed + half random
    Equal,
}

/// Apply jitter to a backoff delay.
pub fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    let mut rng = rand::thread_rng();

    match mode {
        JitterMode::None => delay,
        JitterMode::Full => Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64()),
        JitterMode::Equal => {
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rng.gen::<f64>() * half)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            jitter: JitterMode::None,
            ..Default::default()
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(500));
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            assert!(apply_jitter(delay, &JitterMode::Full) <= delay);
            let equal = apply_jitter(delay, &JitterMode::Equal);
            assert!(equal >= delay / 2 && equal <= delay);
        }
    }
}
