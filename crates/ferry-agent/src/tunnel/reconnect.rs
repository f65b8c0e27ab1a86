//! Exponential backoff for reconnection

use std::time::Duration;

use ferry_core::config::BackoffConfig;

/// Exponential backoff with jitter and an optional retry limit
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
    /// Consecutive failures allowed; 0 is unlimited
    max_retries: u32,
    /// Consecutive failures so far
    failures: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
            .with_max_retries(config.max_retries)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
            max_retries: 0,
            failures: 0,
        }
    }

    /// Give up after `max_retries` consecutive failures
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Count a failed attempt, returning the new failure count
    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Configured retry limit; 0 is unlimited
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the retry limit has been reached
    pub fn exhausted(&self) -> bool {
        self.max_retries > 0 && self.failures >= self.max_retries
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Out-of-range products saturate at the maximum instead of panicking
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        let jitter = Duration::try_from_secs_f64(jitter_amount).unwrap_or_default();
        std::cmp::min(delay.saturating_add(jitter), self.max)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}
