//! Five-field cron expressions, evaluated backwards in UTC.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each accepts `*`,
//! single values, `a-b` ranges, `/step` suffixes and comma lists. Months and
//! weekdays also accept three-letter names; weekday `7` is Sunday.
//!
//! When both day fields are restricted, a day matches if either matches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ScheduleError, ScheduleResult};

/// Days searched backwards before giving up: one leap cycle.
pub const LOOKBACK_DAYS: u32 = 366 * 4;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> ScheduleResult<Self> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59, &[]).map_err(&invalid)?;
        let hours = parse_field(fields[1], 0, 23, &[]).map_err(&invalid)?;
        let days_of_month = parse_field(fields[2], 1, 31, &[]).map_err(&invalid)?;
        let months = parse_field(fields[3], 1, 12, &MONTH_NAMES).map_err(&invalid)?;
        let mut days_of_week = parse_field(fields[4], 0, 7, &DAY_NAMES).map_err(&invalid)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The most recent firing at or before `at`, within [`LOOKBACK_DAYS`].
    pub fn last_fire_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut date = at.date_naive();
        let mut limit = Some((at.hour(), at.minute()));

        for _ in 0..=LOOKBACK_DAYS {
            if self.matches_day(date) {
                if let Some((hour, minute)) = self.latest_time(limit) {
                    return date.and_hms_opt(hour, minute, 0).map(|t| t.and_utc());
                }
            }
            date = date.pred_opt()?;
            limit = None;
        }
        None
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        if !has(self.months, date.month()) {
            return false;
        }
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Latest matching time of day, no later than `limit` when given.
    fn latest_time(&self, limit: Option<(u32, u32)>) -> Option<(u32, u32)> {
        let (max_hour, max_minute) = limit.unwrap_or((23, 59));
        (0..=max_hour).rev().filter(|h| has(self.hours, *h)).find_map(|hour| {
            let top = if hour == max_hour { max_minute } else { 59 };
            (0..=top)
                .rev()
                .find(|m| has(self.minutes, *m))
                .map(|minute| (hour, minute))
        })
    }
}

fn has(bits: u64, value: u32) -> bool {
    bits & (1u64 << value) != 0
}

fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> Result<u64, String> {
    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad step in '{part}'"))?;
                if step == 0 {
                    return Err(format!("zero step in '{part}'"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, names)?, parse_value(b, min, names)?)
        } else {
            let v = parse_value(range, min, names)?;
            // `a/n` runs from a to the end of the field.
            if part.contains('/') { (v, max) } else { (v, v) }
        };

        if start < min || end > max || start > end {
            return Err(format!("'{part}' outside {min}-{max}"));
        }
        for v in (start..=end).step_by(step as usize) {
            bits |= 1u64 << v;
        }
    }
    Ok(bits)
}

fn parse_value(token: &str, min: u32, names: &[&str]) -> Result<u32, String> {
    if let Ok(v) = token.parse::<u32>() {
        return Ok(v);
    }
    let lower = token.to_ascii_lowercase();
    names
        .iter()
        .position(|n| *n == lower)
        .map(|i| i as u32 + min)
        .ok_or_else(|| format!("unrecognized value '{token}'"))
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl TryFrom<String> for CronExpr {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CronExpr::parse(&value)
    }
}

impl From<CronExpr> for String {
    fn from(value: CronExpr) -> Self {
        value.source
    }
}
