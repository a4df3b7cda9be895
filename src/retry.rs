//! Retry Module
//!
//! Bounded exponential-backoff retry shared by the read and write paths of the
//! document store. The sleep source is injectable so tests can observe the
//! backoff curve without waiting on it.

use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Source of backoff sleeps
pub trait Sleeper: Send + Sync + fmt::Debug {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested sleeps instead of sleeping
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps requested so far, in order
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

/// Backoff curve parameters, as stored in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first (default: 5)
    pub max_attempts: u32,
    /// Delay after the first failed attempt (default: 500ms)
    #[serde(with = "crate::config::duration_serde")]
    pub initial_delay: Duration,
    /// Growth factor between successive delays (default: 2.0)
    pub multiplier: f64,
    /// Upper bound for a single delay (default: 30s)
    #[serde(with = "crate::config::duration_serde")]
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay, 0.0 to 1.0 (default: 0.0)
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be between 0.0 and 1.0, got {}",
                self.jitter_factor
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(format!(
                "max_delay ({:?}) must not be below initial_delay ({:?})",
                self.max_delay, self.initial_delay
            ));
        }
        Ok(())
    }
}

/// Bounded exponential-backoff retry
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Create a policy without jitter or delay cap beyond the 30s default
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self::from_settings(RetrySettings {
            max_attempts,
            initial_delay,
            multiplier,
            ..RetrySettings::default()
        })
    }

    pub fn from_settings(settings: RetrySettings) -> Self {
        Self {
            settings: RetrySettings {
                jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
                ..settings
            },
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Replace the sleep source
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.settings.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.settings.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Total attempts; zero is treated as one
    pub fn max_attempts(&self) -> u32 {
        self.settings.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (zero-based), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.settings.initial_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = initial * self.settings.multiplier.powi(exponent);
        let capped = raw.min(self.settings.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.settings.max_delay
        }
    }

    /// Delay after failed attempt `attempt` (zero-based), with jitter applied
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.settings.jitter_factor <= 0.0 {
            return base;
        }

        // ±jitter_factor of the base delay
        let base_ms = base.as_millis() as u64;
        let jitter_range = (base_ms as f64 * self.settings.jitter_factor) as u64;
        if jitter_range == 0 {
            return base;
        }
        let jitter = fastrand::u64(0..=jitter_range * 2) as i64 - jitter_range as i64;
        Duration::from_millis((base_ms as i64 + jitter).max(0) as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// exhausts the attempt budget
    ///
    /// The closure receives the zero-based attempt number.
    pub fn execute<T, F>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            "Operation succeeded after retry: operation={}, attempt={}",
                            operation_name,
                            attempt + 1
                        );
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt + 1 >= max_attempts => {
                    warn!(
                        "Retries exhausted: operation={}, attempts={}, error={}",
                        operation_name, max_attempts, e
                    );
                    return Err(StoreError::RetryExhausted {
                        operation: operation_name.to_string(),
                        attempts: max_attempts,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.calculate_delay(attempt);
                    debug!(
                        "Attempt failed, retrying: operation={}, attempt={}, backoff={:.2}ms, error={}",
                        operation_name,
                        attempt + 1,
                        delay.as_secs_f64() * 1000.0,
                        e
                    );
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_policy(max_attempts: u32) -> (RetryPolicy, RecordingSleeper) {
        let sleeper = RecordingSleeper::new();
        let policy = RetryPolicy::new(max_attempts, Duration::from_millis(500), 2.0)
            .with_sleeper(Arc::new(sleeper.clone()));
        (policy, sleeper)
    }

    #[test]
    fn test_default_settings() {
        let settings = RetrySettings::default();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.initial_delay, Duration::from_millis(500));
        assert!((settings.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(settings.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_succeeds_first_try_without_sleeping() {
        let (policy, sleeper) = recording_policy(5);
        let value = policy.execute("op", |_| Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert!(sleeper.recorded().is_empty());
    }

    #[test]
    fn test_backoff_sequence_until_success() {
        let (policy, sleeper) = recording_policy(5);
        let value = policy
            .execute("op", |attempt| {
                if attempt < 3 {
                    Err(StoreError::LockContention("held".to_string()))
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(
            sleeper.recorded(),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
            ]
        );
    }

    #[test]
    fn test_exhaustion_reports_attempts_and_last_error() {
        let (policy, sleeper) = recording_policy(5);
        let mut calls = 0;
        let err = policy
            .execute::<(), _>("write doc", |_| {
                calls += 1;
                Err(StoreError::TransientIo("share unavailable".to_string()))
            })
            .unwrap_err();

        assert_eq!(calls, 5);
        // No sleep after the final attempt
        assert_eq!(sleeper.recorded().len(), 4);
        match err {
            StoreError::RetryExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last_error, StoreError::TransientIo(_)));
            }
            other => panic!("Expected RetryExhausted, got: {:?}", other),
        }
    }

    #[test]
    fn test_non_retryable_error_propagates_immediately() {
        let (policy, sleeper) = recording_policy(5);
        let mut calls = 0;
        let err = policy
            .execute::<(), _>("op", |_| {
                calls += 1;
                Err(StoreError::Serialization("bad".to_string()))
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(sleeper.recorded().is_empty());
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_zero_attempts_runs_once() {
        let (policy, _) = recording_policy(0);
        let mut calls = 0;
        let _ = policy.execute::<(), _>("op", |_| {
            calls += 1;
            Err(StoreError::LockContention("held".to_string()))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_delay_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), 2.0)
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(500));
        assert_eq!(policy.base_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut settings = RetrySettings::default();
        settings.multiplier = 0.5;
        assert!(settings.validate().is_err());

        let mut settings = RetrySettings::default();
        settings.max_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = RetrySettings::default();
        settings.jitter_factor = 1.5;
        assert!(settings.validate().is_err());

        assert!(RetrySettings::default().validate().is_ok());
    }

    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    /// Without jitter the delay is exactly initial * multiplier^attempt, capped
    #[quickcheck]
    fn prop_delay_follows_exponential_curve(initial_ms: u16, attempt: u8) -> TestResult {
        if initial_ms == 0 || attempt > 20 {
            return TestResult::discard();
        }
        let policy = RetryPolicy::new(5, Duration::from_millis(initial_ms as u64), 2.0)
            .with_max_delay(Duration::from_secs(3600));

        let expected_ms = ((initial_ms as u64) << attempt).min(3_600_000);
        let actual_ms = policy.calculate_delay(attempt as u32).as_millis() as u64;

        // Float rounding may lose a sub-millisecond
        if actual_ms + 1 < expected_ms || actual_ms > expected_ms {
            return TestResult::error(format!(
                "delay {}ms, expected {}ms for attempt {}",
                actual_ms, expected_ms, attempt
            ));
        }
        TestResult::passed()
    }

    /// With jitter the delay stays within ±jitter_factor of the base delay
    #[quickcheck]
    fn prop_jitter_within_bounds(initial_ms: u16, attempt: u8, jitter_percent: u8) -> TestResult {
        if initial_ms == 0 || attempt > 10 {
            return TestResult::discard();
        }
        let jitter_factor = (jitter_percent % 100) as f64 / 100.0;
        let policy = RetryPolicy::new(5, Duration::from_millis(initial_ms as u64), 2.0)
            .with_max_delay(Duration::from_secs(3600))
            .with_jitter(jitter_factor);

        let base_ms = policy.base_delay(attempt as u32).as_millis() as u64;
        let range = (base_ms as f64 * jitter_factor) as u64;
        let actual_ms = policy.calculate_delay(attempt as u32).as_millis() as u64;

        if actual_ms < base_ms.saturating_sub(range) || actual_ms > base_ms + range {
            return TestResult::error(format!(
                "delay {}ms outside [{}, {}]",
                actual_ms,
                base_ms.saturating_sub(range),
                base_ms + range
            ));
        }
        TestResult::passed()
    }
}
