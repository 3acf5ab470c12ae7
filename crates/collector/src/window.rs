use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The half-open interval `[start, end)` one collection run computes cost for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// The window of `hours` length ending at the last full hour before `now`.
    pub fn ending_before(now: DateTime<Utc>, hours: u32) -> Result<Self> {
        if hours == 0 {
            return Err(Error::Config("window length must be at least one hour".into()));
        }
        let end = now
            .duration_trunc(Duration::hours(1))
            .map_err(|e| Error::Internal(format!("cannot truncate {} to the hour: {}", now, e)))?;
        Ok(Self {
            start: end - Duration::hours(i64::from(hours)),
            end,
        })
    }

    pub fn hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_ends_at_last_full_hour() {
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 14, 37, 12).unwrap();
        let window = Window::ending_before(now, 1).unwrap();
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 3, 6, 14, 0, 0).unwrap());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 3, 6, 13, 0, 0).unwrap());
        assert_eq!(window.hours(), 1.0);
    }

    #[test]
    fn test_multi_hour_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 2, 0, 0).unwrap();
        let window = Window::ending_before(now, 6).unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 3, 5, 20, 0, 0).unwrap());
        assert_eq!(window.hours(), 6.0);
    }

    #[test]
    fn test_zero_hours_rejected() {
        assert!(Window::ending_before(Utc::now(), 0).is_err());
    }
}
