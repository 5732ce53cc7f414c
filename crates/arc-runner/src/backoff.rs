//! Per-runner exponential backoff for failed reconciliations
//!
//! kube-runtime hands `error_policy` only the error and the object, so the
//! failure count per runner lives here. A successful pass resets it.

use std::time::Duration;

use dashmap::DashMap;

/// Exponential backoff keyed by runner identity
#[derive(Debug)]
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: DashMap<String, u32>,
}

impl ErrorBackoff {
    /// Create a backoff doubling from `base` up to `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        let attempt = *entry;
        *entry = attempt.saturating_add(1);

        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Forget the failure history for `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map_or(0, |f| *f)
    }
}
