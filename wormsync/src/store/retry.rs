//! Attempt budgets and exponential backoff with jitter.

use crate::config::TransferConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one. 1 means no retry.
    pub attempts: u32,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Budget for individual store calls.
    pub fn for_store_calls(config: &TransferConfig) -> Self {
        Self {
            attempts: config.store_attempts.max(1),
            delay_ms: config.retry_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }

    /// Budget for whole-file transfers.
    pub fn for_transfers(config: &TransferConfig) -> Self {
        Self {
            attempts: config.upload_attempts.max(1),
            delay_ms: config.retry_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }

    pub fn no_delay(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next_ms: self.delay_ms,
            max_ms: self.max_delay_ms,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_store_calls(&TransferConfig::default())
    }
}

/// Delay sequence: doubles each step up to the ceiling, plus up to 100% jitter.
#[derive(Debug)]
pub struct Backoff {
    next_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_ms;
        self.next_ms = (self.next_ms.saturating_mul(2)).min(self.max_ms);
        if base == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::random::<u64>() % base;
        Duration::from_millis(base + jitter)
    }
}
