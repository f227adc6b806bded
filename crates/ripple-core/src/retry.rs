//! Retry strategies: pure decisions from attempt counts and the first
//! consecutive error time.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::duration::DurationInput;

/// Default minimum delay for the exponential strategy.
const DEFAULT_EXPONENTIAL_MIN: Duration = Duration::from_secs(10);

/// Errors raised while validating a retry policy at registration.
#[derive(Debug, Error)]
pub enum RetryPolicyError {
    #[error("invalid cron expression {expression:?}: {source}")]
    InvalidCron {
        expression: String,
        source: cron::error::Error,
    },
    #[error("series strategy requires at least one interval")]
    EmptySeries,
    #[error("exponential factor must be at least 1.0, got {0}")]
    InvalidFactor(f64),
    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Constant delay, bounded by attempts and/or total error duration.
    Fixed {
        interval: DurationInput,
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(default)]
        max_duration: Option<DurationInput>,
    },
    /// Delay grows as `attempt * interval`.
    Linear { interval: DurationInput },
    /// Delay grows as `min * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        #[serde(default)]
        min: Option<DurationInput>,
        #[serde(default)]
        max: Option<DurationInput>,
        factor: f64,
    },
    /// Explicit delays indexed by attempt; the last entry repeats.
    Series { intervals: Vec<DurationInput> },
    /// Next matching instant of a cron expression.
    Cron { expression: String },
}

impl RetryPolicy {
    /// Validate the configuration; called at registration so bad policies
    /// never reach the runtime.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        match self {
            Self::Fixed { max_attempts, .. } => {
                if matches!(max_attempts, Some(0)) {
                    return Err(RetryPolicyError::InvalidMaxAttempts);
                }
            }
            Self::Linear { .. } => {}
            Self::Exponential { factor, .. } => {
                if *factor < 1.0 {
                    return Err(RetryPolicyError::InvalidFactor(*factor));
                }
            }
            Self::Series { intervals } => {
                if intervals.is_empty() {
                    return Err(RetryPolicyError::EmptySeries);
                }
            }
            Self::Cron { expression } => {
                parse_cron(expression)?;
            }
        }
        Ok(())
    }

    /// When attempt number `attempt` (1-based, already performed) should
    /// be retried.
    pub fn calculate_next_retry(&self, attempt: u32) -> DateTime<Utc> {
        self.next_retry_at(attempt, Utc::now())
    }

    /// Deterministic core of [`Self::calculate_next_retry`].
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let attempt = attempt.max(1);
        let delay = match self {
            Self::Fixed { interval, .. } => interval.as_duration(),
            Self::Linear { interval } => interval.as_duration() * attempt,
            Self::Exponential { min, max, factor } => {
                let min = min
                    .map(DurationInput::as_duration)
                    .unwrap_or(DEFAULT_EXPONENTIAL_MIN);
                let exponent = (attempt - 1) as i32;
                let scaled = min.as_millis() as f64 * factor.powi(exponent);
                let capped = match max {
                    Some(max) => scaled.min(max.as_duration().as_millis() as f64),
                    None => scaled,
                };
                Duration::from_millis(capped as u64)
            }
            Self::Series { intervals } => {
                let index = (attempt as usize - 1).min(intervals.len() - 1);
                intervals[index].as_duration()
            }
            Self::Cron { expression } => {
                let schedule = parse_cron(expression)
                    .expect("cron policies are validated at registration");
                return schedule
                    .after(&now)
                    .next()
                    .unwrap_or(now + chrono::Duration::days(365));
            }
        };
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
    }

    /// Whether the task should fail permanently instead of retrying.
    ///
    /// Fails when `attempt >= max_attempts`, or when the time since the
    /// first consecutive error reaches `max_duration`.
    pub fn should_fail(&self, attempt: u32, first_error_at: Option<DateTime<Utc>>) -> bool {
        self.should_fail_at(attempt, first_error_at, Utc::now())
    }

    /// Deterministic core of [`Self::should_fail`].
    pub fn should_fail_at(
        &self,
        attempt: u32,
        first_error_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Self::Fixed {
            max_attempts,
            max_duration,
            ..
        } = self
        else {
            return false;
        };

        if let Some(max_attempts) = max_attempts {
            if attempt >= *max_attempts {
                return true;
            }
        }
        if let (Some(max_duration), Some(first_error_at)) = (max_duration, first_error_at) {
            let elapsed = now.signed_duration_since(first_error_at);
            if elapsed
                >= chrono::Duration::from_std(max_duration.as_duration())
                    .unwrap_or(chrono::Duration::MAX)
            {
                return true;
            }
        }
        false
    }
}

/// Parse a cron expression, accepting both 5-field (minute-first) and
/// 6/7-field (second-first) forms.
fn parse_cron(expression: &str) -> Result<cron::Schedule, RetryPolicyError> {
    let trimmed = expression.trim();
    let field_count = trimmed.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_owned()
    };
    cron::Schedule::from_str(&normalized).map_err(|source| RetryPolicyError::InvalidCron {
        expression: expression.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn policy(value: serde_json::Value) -> RetryPolicy {
        serde_json::from_value(value).unwrap()
    }

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn fixed_delay_and_max_attempts() {
        let p = policy(json!({"strategy": "fixed", "interval": 50, "max_attempts": 3}));
        p.validate().unwrap();

        let at = p.next_retry_at(1, now());
        assert_eq!((at - now()).num_milliseconds(), 50);

        assert!(!p.should_fail_at(2, None, now()));
        assert!(p.should_fail_at(3, None, now()));
        assert!(p.should_fail_at(4, None, now()));
    }

    #[test]
    fn fixed_max_duration_counts_from_first_error() {
        let p = policy(json!({"strategy": "fixed", "interval": "1s", "max_duration": "1h"}));
        let first_error = now() - chrono::Duration::minutes(61);
        assert!(p.should_fail_at(2, Some(first_error), now()));

        let recent = now() - chrono::Duration::minutes(30);
        assert!(!p.should_fail_at(2, Some(recent), now()));
        assert!(!p.should_fail_at(2, None, now()));
    }

    #[test]
    fn linear_scales_with_attempt() {
        let p = policy(json!({"strategy": "linear", "interval": 100}));
        assert_eq!((p.next_retry_at(1, now()) - now()).num_milliseconds(), 100);
        assert_eq!((p.next_retry_at(3, now()) - now()).num_milliseconds(), 300);
    }

    #[test]
    fn exponential_defaults_and_cap() {
        let p = policy(json!({"strategy": "exponential", "factor": 2.0}));
        // Default min is 10 s.
        assert_eq!((p.next_retry_at(1, now()) - now()).num_seconds(), 10);
        assert_eq!((p.next_retry_at(3, now()) - now()).num_seconds(), 40);

        let capped = policy(json!({
            "strategy": "exponential", "min": "1s", "max": "4s", "factor": 3.0
        }));
        assert_eq!((capped.next_retry_at(5, now()) - now()).num_seconds(), 4);
    }

    #[test]
    fn series_reuses_last_entry() {
        let p = policy(json!({"strategy": "series", "intervals": [100, 200, 500]}));
        assert_eq!((p.next_retry_at(1, now()) - now()).num_milliseconds(), 100);
        assert_eq!((p.next_retry_at(3, now()) - now()).num_milliseconds(), 500);
        assert_eq!((p.next_retry_at(9, now()) - now()).num_milliseconds(), 500);
    }

    #[test]
    fn cron_next_instant() {
        let p = policy(json!({"strategy": "cron", "expression": "*/15 * * * *"}));
        p.validate().unwrap();
        let at = p.next_retry_at(1, now());
        assert_eq!(at, "2026-03-01T12:15:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn validation_rejects_bad_configs() {
        assert!(policy(json!({"strategy": "cron", "expression": "not cron"}))
            .validate()
            .is_err());
        assert!(policy(json!({"strategy": "series", "intervals": []}))
            .validate()
            .is_err());
        assert!(
            policy(json!({"strategy": "exponential", "factor": 0.5}))
                .validate()
                .is_err()
        );
        assert!(
            policy(json!({"strategy": "fixed", "interval": 10, "max_attempts": 0}))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn human_duration_forms_accepted() {
        let p = policy(json!({"strategy": "fixed", "interval": "1h 5m"}));
        assert_eq!((p.next_retry_at(1, now()) - now()).num_minutes(), 65);
    }
}
