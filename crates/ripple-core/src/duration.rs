//! Duration inputs that accept either integer milliseconds or a human
//! string (`"1s"`, `"1h 5m"`).

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Error returned for an unparsable duration input.
#[derive(Debug, Error)]
pub enum DurationError {
    #[error("invalid duration string {0:?}: {1}")]
    Invalid(String, humantime::DurationError),
    #[error("negative durations are not allowed: {0}")]
    Negative(i64),
}

/// Parse a human duration string via humantime.
pub fn parse_human(input: &str) -> Result<Duration, DurationError> {
    humantime::parse_duration(input.trim())
        .map_err(|e| DurationError::Invalid(input.to_owned(), e))
}

/// A duration given as integer milliseconds or a humantime string.
///
/// Deserializes from either JSON form; everything downstream works with
/// the resolved [`Duration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationInput(pub Duration);

impl DurationInput {
    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn as_millis_i64(self) -> i64 {
        self.0.as_millis() as i64
    }
}

impl From<Duration> for DurationInput {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl<'de> Deserialize<'de> for DurationInput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Human(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => {
                if ms < 0 {
                    return Err(serde::de::Error::custom(DurationError::Negative(ms)));
                }
                Ok(Self(Duration::from_millis(ms as u64)))
            }
            Raw::Human(s) => parse_human(&s).map(Self).map_err(serde::de::Error::custom),
        }
    }
}
