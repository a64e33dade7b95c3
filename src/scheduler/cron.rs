//! Cron expressions for the periodic jobs.
//!
//! Accepts `SEC MIN HOUR DOM MON DOW` or the 5-field form without seconds.
//! Each field is `*`, `*/N`, `N`, `A-B`, `A-B/N` or a comma-separated list of
//! those. Day of week runs from 0 (Sunday) to 6, 7 is also Sunday. When both
//! day of month and day of week are restricted, either may match.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl FromStr for CronSchedule {
    type Err = AppError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let parts: Vec<&str> = match parts.len() {
            6 => parts,
            5 => std::iter::once("0").chain(parts).collect(),
            _ => {
                return Err(AppError::Config(format!(
                    "Invalid cron expression '{}' (need 5 or 6 fields)",
                    expression
                )));
            }
        };

        let field = |raw: &str, min: u32, max: u32| {
            parse_field(raw, min, max).ok_or_else(|| {
                AppError::Config(format!(
                    "Invalid cron field '{}' in '{}'",
                    raw, expression
                ))
            })
        };

        let mut days_of_week = field(parts[5], 0, 7)?;
        for day in days_of_week.iter_mut() {
            if *day == 7 {
                *day = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(CronSchedule {
            expression: expression.to_string(),
            seconds: field(parts[0], 0, 59)?,
            minutes: field(parts[1], 0, 59)?,
            hours: field(parts[2], 0, 23)?,
            days_of_month: field(parts[3], 1, 31)?,
            months: field(parts[4], 1, 12)?,
            days_of_week,
            dom_restricted: parts[3] != "*",
            dow_restricted: parts[5] != "*",
        })
    }
}

impl CronSchedule {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after.with_nanosecond(0)? + Duration::seconds(1);
        // Five years covers every satisfiable expression, Feb 29 included.
        let limit = after + Duration::days(5 * 366);

        while candidate <= limit {
            if !self.months.contains(&candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = start_of_day(candidate)? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&candidate.minute()) {
                candidate = candidate.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(&candidate.second()) {
                candidate += Duration::seconds(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }
}

fn start_of_day(date: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.date_naive().and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(date: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Parse a cron field into the sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().ok()?),
            None => (part, 1),
        };
        if step == 0 {
            return None;
        }

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (a.parse().ok()?, b.parse().ok()?)
        } else {
            let n: u32 = range.parse().ok()?;
            // `N/step` runs from N to the end of the range
            if part.contains('/') { (n, max) } else { (n, n) }
        };

        if start < min || end > max || start > end {
            return None;
        }
        values.extend((start..=end).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    Some(values)
}
