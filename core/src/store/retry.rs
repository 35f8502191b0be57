//! Backoff for transient store failures.
//!
//! The connector consults a `RetryPolicy` whenever sqlite reports a busy or
//! locked database, or the file handle itself went bad. The frontend holds
//! write locks for short bursts, so delays start small and are capped.

use std::time::Duration;

use serde::{Deserialize, Serialize};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}


/// Read from the `store_retry` config section; missing keys keep the
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failure. Zero disables retrying.
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    /// Upper bound on any single wait.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        RetryPolicy {
            max_retries,
            strategy,
            base_delay_ms,
            max_delay_ms: u64::MAX,
        }
    }

    /// In-memory stores are never contended.
    pub fn none() -> Self {
        RetryPolicy::new(0, BackoffStrategy::Fixed, 0)
    }

    /// `attempt` counts retries already made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Wait before retry number `attempt` (0 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Exponential => {
                self.base_delay_ms.saturating_mul(2u64.saturating_pow(attempt))
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Worst-case time spent waiting before the store is declared
    /// unavailable.
    pub fn total_budget(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay(attempt)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}
