//! Retry and backoff helpers.
//!
//! Reflectors use [`Backoff`] between failed list/watch attempts; scenario code
//! uses [`retry_until`] to poll a condition until it holds or a deadline passes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff settings for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = until cancelled)
    pub max_attempts: u32,
    /// Initial delay between attempts
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for the delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier applied after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Fixed delay between attempts, no growth
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }
}

/// Stateful exponential backoff with jitter.
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Next delay, or `None` once `max_attempts` is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::rng().random_range(0.5..1.5);
        let delay = Duration::try_from_secs_f64(self.current.as_secs_f64() * jitter)
            .unwrap_or(self.config.max_delay);

        // NaN, infinite or overflowing growth saturates at max_delay
        let grown = self.current.as_secs_f64() * self.config.backoff_multiplier;
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);

        Some(delay.min(self.config.max_delay))
    }

    /// Back to the initial delay after a success
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep for the next delay. Returns `false` when cancelled or exhausted.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.next_delay() else {
            return false;
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(config.clone());

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        operation = %operation_name,
                        attempt = backoff.attempts(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

/// Poll `check` every `delay` until it succeeds or `timeout` elapses.
///
/// On timeout the last error is returned, wrapped as a transient failure.
pub async fn retry_until<F, Fut, T>(
    operation_name: &str,
    timeout: Duration,
    delay: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match check().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if tokio::time::Instant::now() + delay > deadline {
            return Err(Error::transient(format!(
                "{operation_name} did not succeed within {timeout:?} after {attempt} attempts: {err}"
            )));
        }
        debug!(operation = %operation_name, attempt, error = %err, "Condition not met yet");
        tokio::time::sleep(delay).await;
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
