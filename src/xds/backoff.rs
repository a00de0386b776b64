//! Truncated exponential backoff for stream re-establishment.
//!
//! Defaults follow the ADS reconnect policy: 1 s initial delay, 1.6x
//! multiplier, 120 s cap, ±20 % jitter. The backoff resets to the initial
//! delay after any successful response on the stream.

use std::time::Duration;

use rand::Rng;

/// Backoff tuning knobs. Overridable so tests can run with short delays.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 1.6,
            max: Duration::from_secs(120),
            jitter: 0.2,
        }
    }
}

/// Truncated exponential backoff state machine.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Next delay: `min(initial * multiplier^attempt, max)` with jitter
    /// applied multiplicatively in `[1 - jitter, 1 + jitter]`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.initial.as_secs_f64()
            * self.config.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        let jittered = if self.config.jitter > 0.0 {
            let factor = rand::thread_rng()
                .gen_range(1.0 - self.config.jitter..=1.0 + self.config.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Reset to the initial delay. Called after any successful response.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig { jitter: 0.0, ..Default::default() }
    }

    #[test]
    fn delays_grow_by_multiplier_until_cap() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(1.6));
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(2.56));
        // Skip far ahead; the cap must hold.
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
    }

    #[test]
    fn reset_restarts_from_initial() {
        let mut backoff = ExponentialBackoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::default());
        for attempt in 0..10u32 {
            let delay = backoff.next_delay().as_secs_f64();
            let base = (1.6f64.powi(attempt as i32)).min(120.0);
            assert!(delay >= base * 0.8 - 1e-9, "attempt {}: {} too small", attempt, delay);
            assert!(delay <= base * 1.2 + 1e-9, "attempt {}: {} too large", attempt, delay);
        }
    }
}
