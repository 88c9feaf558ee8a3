//! Capped exponential backoff for rate-limited external calls

use crate::config::RetryConfig;
use crate::error::PipelineError;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Retry schedule for operations that may be rate limited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Backoff before jitter: zero for attempt 0, then `base * 2^(attempt - 1)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay for `attempt` with an explicit jitter fraction, capped at `max_delay`
    pub fn delay_with_jitter(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let delay = self.backoff(attempt);
        let jittered = delay.as_secs_f64() * (1.0 + jitter_fraction);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Delay for `attempt` with uniform random jitter of 10 to 30 percent
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.1..=0.3);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Run `op`, retrying rate-limited failures and sleeping with `sleep`
    ///
    /// Other errors are returned immediately. After `max_retries` retries a
    /// rate-limited failure is surfaced as `RateLimited`.
    pub fn run_with_sleep<T, F, S>(&self, label: &str, mut op: F, mut sleep: S) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Result<T, PipelineError>,
        S: FnMut(Duration),
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Err(e) if e.is_retryable() => {
                    if attempt >= self.max_retries {
                        return Err(PipelineError::RateLimited {
                            source_name: label.to_string(),
                            attempts: attempt + 1,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        label,
                        retry = attempt + 1,
                        max_retries = self.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        "rate limited, backing off"
                    );
                    sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run `op` with real sleeps between retries
    pub fn run<T, F>(&self, label: &str, op: F) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Result<T, PipelineError>,
    {
        self.run_with_sleep(label, op, std::thread::sleep)
    }
}
