//! Retry policy: exponential backoff and the dead-letter decision.
//!
//! Everything here is pure. The repository applies the decision inside its
//! failure transaction; the worker computes the backoff before reporting.

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::models::ConfigEntry;

/// Backoff in seconds for a job that has failed `attempts_before_failure`
/// times before the current failure: `base ^ attempts * base_delay`.
pub fn backoff_seconds(attempts_before_failure: i64, base: f64, base_delay: f64) -> f64 {
    let exponent = i32::try_from(attempts_before_failure.max(0)).unwrap_or(i32::MAX);
    base.powi(exponent) * base_delay
}

/// Whether a failure should move the job to the dead-letter queue.
///
/// Either ceiling is sufficient: the job is dead once its attempt count
/// exceeds its own `max_retries` or the global ceiling, whichever is lower.
pub fn should_dead_letter(
    attempts_after_failure: i64,
    job_max_retries: i64,
    global_max_retries: i64,
) -> bool {
    attempts_after_failure > job_max_retries || attempts_after_failure > global_max_retries
}

/// Convert a backoff in seconds into a delay, clamped to
/// `[0, MAX_BACKOFF_SECS]`. NaN is treated as zero.
pub fn backoff_delay(seconds: f64) -> Duration {
    let clamped = if seconds.is_nan() {
        0.0
    } else {
        seconds.clamp(0.0, defaults::MAX_BACKOFF_SECS)
    };
    Duration::milliseconds((clamped * 1000.0).round() as i64)
}

/// Retry knobs read from the config store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub backoff_base: f64,
    pub base_delay_seconds: f64,
    pub max_retries: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: defaults::BACKOFF_BASE,
            base_delay_seconds: defaults::BASE_DELAY_SECONDS,
            max_retries: defaults::JOB_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Build a policy from stored config entries.
    ///
    /// Missing or unparseable values fall back to the defaults; unknown keys
    /// are ignored.
    pub fn from_entries(entries: &[ConfigEntry]) -> Self {
        let map: HashMap<&str, &str> = entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_str()))
            .collect();
        let defaults = Self::default();

        let backoff_base = map
            .get(defaults::CONFIG_BACKOFF_BASE)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(defaults.backoff_base);

        let base_delay_seconds = map
            .get(defaults::CONFIG_BASE_DELAY_SECONDS)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(defaults.base_delay_seconds);

        let max_retries = map
            .get(defaults::CONFIG_MAX_RETRIES)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v >= 0)
            .unwrap_or(defaults.max_retries);

        Self {
            backoff_base,
            base_delay_seconds,
            max_retries,
        }
    }

    /// Backoff for a job that had `attempts_before_failure` attempts.
    pub fn backoff_seconds(&self, attempts_before_failure: i64) -> f64 {
        backoff_seconds(
            attempts_before_failure,
            self.backoff_base,
            self.base_delay_seconds,
        )
    }

    /// Dead-letter decision against this policy's global ceiling.
    pub fn should_dead_letter(&self, attempts_after_failure: i64, job_max_retries: i64) -> bool {
        should_dead_letter(attempts_after_failure, job_max_retries, self.max_retries)
    }
}
