//! Request window computation.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp layout the reports API expects in its `start`/`end` parameters.
pub const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidWindowError {
    #[error("window start {start} is not before end {end}")]
    StartNotBeforeEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("window period must be positive, got {seconds}s")]
    NonPositivePeriod { seconds: i64 },
    #[error("window period of {seconds}s reaches before the earliest representable time")]
    PeriodOutOfRange { seconds: i64 },
    #[error("invalid timestamp {value:?}: expected RFC 3339 or YYYY-MM-DDTHH:MM:SS")]
    Timestamp { value: String },
    #[error("invalid period {value:?}: expected <n>h, <n>m, <n>d or a bare number of hours")]
    Period { value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunMode {
    Scheduled,
    Manual {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Scheduled => "scheduled",
            RunMode::Manual { .. } => "manual",
        }
    }
}

/// Half-open `[start, end)` range requested from the reports API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidWindowError> {
        if start >= end {
            return Err(InvalidWindowError::StartNotBeforeEnd { start, end });
        }
        Ok(Self { start, end })
    }

    /// `now` must be the run's single clock sample; nothing here reads the clock.
    pub fn compute(
        mode: &RunMode,
        now: DateTime<Utc>,
        period: Duration,
    ) -> Result<Self, InvalidWindowError> {
        match *mode {
            RunMode::Scheduled => {
                if period <= Duration::zero() {
                    return Err(InvalidWindowError::NonPositivePeriod {
                        seconds: period.num_seconds(),
                    });
                }
                let start = now.checked_sub_signed(period).ok_or(
                    InvalidWindowError::PeriodOutOfRange {
                        seconds: period.num_seconds(),
                    },
                )?;
                Self::new(start, now)
            }
            RunMode::Manual { start, end } => Self::new(start, end),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn query_params(&self) -> [(&'static str, String); 2] {
        [
            ("start", self.start.format(API_TIMESTAMP_FORMAT).to_string()),
            ("end", self.end.format(API_TIMESTAMP_FORMAT).to_string()),
        ]
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format(API_TIMESTAMP_FORMAT),
            self.end.format(API_TIMESTAMP_FORMAT)
        )
    }
}

/// Accepts RFC 3339, or the API's naive layout interpreted as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, InvalidWindowError> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, API_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| InvalidWindowError::Timestamp {
            value: value.to_string(),
        })
}

pub fn parse_period(value: &str) -> Result<Duration, InvalidWindowError> {
    let invalid = || InvalidWindowError::Period {
        value: value.to_string(),
    };
    let trimmed = value.trim().to_ascii_lowercase();
    let (digits, unit) = match trimmed.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&trimmed[..idx], Some(c)),
        Some(_) => (trimmed.as_str(), None),
        None => return Err(invalid()),
    };
    let amount: i64 = digits.trim().parse().map_err(|_| invalid())?;
    let period = match unit {
        None | Some('h') => Duration::try_hours(amount),
        Some('m') => Duration::try_minutes(amount),
        Some('d') => Duration::try_days(amount),
        Some(_) => None,
    }
    .ok_or_else(invalid)?;

    if period <= Duration::zero() {
        return Err(InvalidWindowError::NonPositivePeriod {
            seconds: period.num_seconds(),
        });
    }
    Ok(period)
}
