//! Bounded retry with exponential backoff and jitter for calls to module instances.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use switchyard_common::{Result, SwitchyardError};

/// Configuration for retry logic with exponential backoff.
///
/// Retry `n` (0-based) waits `initial_backoff_ms * multiplier^n`, capped at
/// `max_backoff_ms`, then scaled by a random factor in `1 ± jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Fractional jitter, 0.25 = ±25 %.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry `retry` without jitter.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(retry.min(32) as i32);
        Duration::from_millis((ms as u64).min(self.max_backoff_ms))
    }

    /// Backoff before retry `retry` with jitter applied.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_backoff(retry).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0.0 {
            return Duration::from_millis(base as u64);
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_millis((base * factor) as u64)
    }
}

/// Runs `op` until it succeeds, fails with an error `should_retry` rejects,
/// or runs out of retries.
pub async fn retry_with<T, F, Fut, P>(config: &RetryConfig, what: &str, should_retry: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&SwitchyardError) -> bool,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retry < config.max_retries && should_retry(&e) => {
                let wait = config.backoff(retry);
                debug!("{} failed ({}), retry {} in {:?}", what, e, retry + 1, wait);
                tokio::time::sleep(wait).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retries only deadline expiries.
pub fn on_timeout(e: &SwitchyardError) -> bool {
    matches!(e, SwitchyardError::Timeout(_))
}

/// Retries any transient error.
pub fn on_transient(e: &SwitchyardError) -> bool {
    e.is_transient()
}
