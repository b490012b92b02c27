//! Exponential backoff for subscription retries.

use std::time::Duration;

/// Configuration for exponential retry backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied after each wait.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Tracks the backoff of one retry loop and calculates its delays.
///
/// Delays never decrease for the lifetime of a loop; there is no reset.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let initial_delay = config.initial_delay.min(config.max_delay);
        Self {
            config,
            attempts: 0,
            current_delay: initial_delay,
        }
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempts += 1;

        let grown = (self.current_delay.as_secs_f64() * self.config.multiplier)
            .min(self.config.max_delay.as_secs_f64());
        // Growth past what a Duration can hold settles on the cap
        self.current_delay =
            Duration::try_from_secs_f64(grown).map_or(self.config.max_delay, |next| {
                next.min(self.config.max_delay)
            });

        delay
    }

    /// The delay the next call to [`Backoff::next_delay`] will return.
    pub fn current(&self) -> Duration {
        self.current_delay
    }

    /// Number of waits handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
