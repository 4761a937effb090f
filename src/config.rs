//! Watch manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WatchError, WatchResult};

/// Retry policy for opening a change stream.
///
/// Only retryable init errors (store unreachable) are retried. Backoff doubles
/// after each failed attempt, capped at `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub backoff_ms: u64,
    /// Upper bound for any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Sleep between poll cycles that produced no event.
    pub idle_interval_ms: u64,
    pub open_retry: RetryPolicy,
    /// Name given to the poll worker thread.
    pub worker_thread_name: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 50,
            open_retry: RetryPolicy::default(),
            worker_thread_name: "kyrowatch-poll".to_string(),
        }
    }
}

impl WatchConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> WatchResult<Self> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| WatchError::InvalidConfig {
            reason: format!("invalid watch config: {e}"),
        })?;
        Ok(cfg.normalized())
    }

    /// Clamp values the worker cannot run with.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.idle_interval_ms = self.idle_interval_ms.max(1);
        self.open_retry.max_attempts = self.open_retry.max_attempts.max(1);
        self.open_retry.max_backoff_ms = self.open_retry.max_backoff_ms.max(self.open_retry.backoff_ms);
        if self.worker_thread_name.trim().is_empty() {
            self.worker_thread_name = Self::default().worker_thread_name;
        }
        self
    }

    #[must_use]
    pub const fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}
