//! Reporting frequencies and the calendar periods they cover.
//!
//! All boundaries are computed in UTC. A period always starts at the
//! beginning of its calendar unit: midnight for days, Monday for weeks, the
//! first day of the month for month-based frequencies (quarters and
//! half-years are aligned on January, April, July and October, resp. January
//! and July) and January 1st for years.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Day,
    Week,
    Month(u32),
}

/// A frequency as stored on a reporting task.
///
/// Construction never fails: an unknown descriptor yields a frequency for
/// which [`Frequency::is_valid`] is false and every boundary is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Frequency {
    raw: String,
    unit: Option<Unit>,
}

/// Accepted descriptors, long name first.
const KNOWN: &[(&str, &str, Unit)] = &[
    ("daily", "1d", Unit::Day),
    ("weekly", "1w", Unit::Week),
    ("monthly", "1M", Unit::Month(1)),
    ("quarterly", "3M", Unit::Month(3)),
    ("semi-annual", "6M", Unit::Month(6)),
    ("yearly", "1y", Unit::Month(12)),
];

impl Frequency {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        let unit = KNOWN
            .iter()
            .find(|(name, code, _)| trimmed.eq_ignore_ascii_case(name) || trimmed == *code)
            .map(|(_, _, unit)| *unit);

        Self { raw, unit }
    }

    pub fn is_valid(&self) -> bool {
        self.unit.is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of every accepted frequency.
    pub fn known() -> impl Iterator<Item = &'static str> {
        KNOWN.iter().map(|(name, _, _)| *name)
    }

    pub fn start_of_current_period(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = now.date_naive();
        let start = match self.unit? {
            Unit::Day => date,
            Unit::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
            Unit::Month(span) => {
                let month0 = date.month0() - date.month0() % span;
                NaiveDate::from_ymd_opt(date.year(), month0 + 1, 1)?
            }
        };

        Some(Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?))
    }

    pub fn start_of_previous_period(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let current = self.start_of_current_period(now)?;
        match self.unit? {
            Unit::Day => current.checked_sub_signed(Duration::days(1)),
            Unit::Week => current.checked_sub_signed(Duration::weeks(1)),
            Unit::Month(span) => current.checked_sub_months(Months::new(span)),
        }
    }

    pub fn start_of_next_period(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let current = self.start_of_current_period(now)?;
        match self.unit? {
            Unit::Day => current.checked_add_signed(Duration::days(1)),
            Unit::Week => current.checked_add_signed(Duration::weeks(1)),
            Unit::Month(span) => current.checked_add_months(Months::new(span)),
        }
    }

    /// The period a report generated at `now` covers: the whole previous period.
    pub fn reported_period(&self, now: DateTime<Utc>) -> Option<Period> {
        Some(Period {
            from: self.start_of_previous_period(now)?,
            to: self.start_of_current_period(now)?,
        })
    }
}

impl From<String> for Frequency {
    fn from(raw: String) -> Self {
        Frequency::new(raw)
    }
}

impl From<Frequency> for String {
    fn from(frequency: Frequency) -> Self {
        frequency.raw
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Half-open time range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn previous_is_before_current_which_is_not_after_now() {
        let samples = [
            at(2026, 10, 19, 13, 45),
            at(2026, 1, 1, 0, 0),
            at(2024, 2, 29, 23, 59),
            at(2025, 12, 31, 12, 0),
            at(2026, 7, 1, 0, 0),
        ];

        for name in Frequency::known() {
            let frequency = Frequency::new(name);
            for now in samples {
                let previous = frequency.start_of_previous_period(now).unwrap();
                let current = frequency.start_of_current_period(now).unwrap();
                let next = frequency.start_of_next_period(now).unwrap();
                assert!(previous < current, "{name} at {now}");
                assert!(current <= now, "{name} at {now}");
                assert!(now < next, "{name} at {now}");
            }
        }
    }

    #[test]
    fn boundaries_follow_calendar_units() {
        // Monday 2026-10-19
        let now = at(2026, 10, 21, 9, 30);

        let weekly = Frequency::new("weekly");
        assert_eq!(weekly.start_of_current_period(now), Some(at(2026, 10, 19, 0, 0)));
        assert_eq!(weekly.start_of_previous_period(now), Some(at(2026, 10, 12, 0, 0)));

        let quarterly = Frequency::new("3M");
        assert_eq!(quarterly.start_of_current_period(now), Some(at(2026, 10, 1, 0, 0)));
        assert_eq!(quarterly.start_of_previous_period(now), Some(at(2026, 7, 1, 0, 0)));
        assert_eq!(quarterly.start_of_next_period(now), Some(at(2027, 1, 1, 0, 0)));

        let semi = Frequency::new("semi-annual");
        assert_eq!(semi.start_of_current_period(now), Some(at(2026, 7, 1, 0, 0)));

        let yearly = Frequency::new("1y");
        assert_eq!(yearly.start_of_previous_period(now), Some(at(2025, 1, 1, 0, 0)));
    }

    #[test]
    fn monthly_previous_period_crosses_year() {
        let frequency = Frequency::new("monthly");
        let period = frequency.reported_period(at(2026, 1, 15, 8, 0)).unwrap();
        assert_eq!(period.from, at(2025, 12, 1, 0, 0));
        assert_eq!(period.to, at(2026, 1, 1, 0, 0));
    }

    #[test]
    fn unknown_frequency_is_invalid() {
        let frequency = Frequency::new("fortnightly");
        assert!(!frequency.is_valid());
        assert_eq!(frequency.start_of_current_period(Utc::now()), None);
        assert_eq!(frequency.start_of_previous_period(Utc::now()), None);
        assert!(frequency.reported_period(Utc::now()).is_none());
        assert!(!Frequency::new("").is_valid());
    }

    #[test]
    fn codes_are_case_sensitive() {
        assert!(Frequency::new("1M").is_valid());
        assert!(!Frequency::new("1m").is_valid());
        assert!(Frequency::new("Daily").is_valid());
    }
}
