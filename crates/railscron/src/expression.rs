//! 5-field cron expression parsing and firing enumeration.
//!
//! Syntax: `minute hour day-of-month month day-of-week` with lists (`1,5`),
//! ranges (`1-5`), steps (`*/15`, `10-40/5`, `3/4`), month names (`jan`..`dec`),
//! weekday names (`sun`..`sat`, with both `0` and `7` meaning Sunday), and the
//! aliases `@yearly`/`@annually`, `@monthly`, `@weekly`, `@daily`/`@midnight`,
//! `@hourly`.
//!
//! Day-of-month and day-of-week follow the Vixie rule: when **both** fields
//! are restricted (neither starts with `*`), a date matches if **either**
//! matches.
//!
//! Evaluation happens in a caller-supplied time zone. A local time erased by
//! a spring-forward gap never fires; a local time repeated by a fall-back
//! resolves to its earliest instant, so it fires at most once.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::CronError;

/// Search horizon for the next firing. An expression with no firing inside
/// four years (e.g. `0 0 31 2 *`) is treated as firing-free rather than
/// searched forever.
const SEARCH_HORIZON_DAYS: i64 = 4 * 366;

/// Cap on candidate-resolution retries around DST gaps and window scans.
const MAX_RESOLUTION_STEPS: usize = 10_000;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Set of permitted values for one cron field, as a bitmask over `0..=59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn empty() -> Self {
        Self(0)
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    /// Vixie flags: a day field counts as restricted iff it does not start
    /// with `*`. Drives the OR combination of the two day fields.
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    /// Parse an expression, resolving `@` aliases first.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::InvalidExpression {
            expr: expr.to_string(),
            reason,
        };

        let normalized = match expr.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(format!("unknown alias '{other}'")));
            }
            other => other,
        };

        let fields: Vec<&str> = normalized.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            )));
        }

        let minutes = parse_field(fields[0], 0, 59, None).map_err(&invalid)?;
        let hours = parse_field(fields[1], 0, 23, None).map_err(&invalid)?;
        let days_of_month = parse_field(fields[2], 1, 31, None).map_err(&invalid)?;
        let months = parse_field(fields[3], 1, 12, Some(&MONTH_NAMES)).map_err(&invalid)?;
        let days_of_week = parse_dow(fields[4]).map_err(&invalid)?;

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Next matching wall-clock minute at or after `after`, ignoring zone
    /// resolution. Advances field-by-field so pathological expressions skip
    /// whole months instead of stepping minute-by-minute.
    fn next_local(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut cur = ceil_to_minute(after)?;
        let bound = after.checked_add_signed(Duration::days(SEARCH_HORIZON_DAYS))?;

        while cur <= bound {
            if !self.months.contains(cur.month()) {
                let first = first_of_next_month(cur.date())?;
                cur = first.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.day_matches(cur.date()) {
                cur = cur.date().succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.hours.contains(cur.hour()) {
                cur = truncate_to_hour(cur)?.checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !self.minutes.contains(cur.minute()) {
                cur = cur.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(cur);
        }
        None
    }

    /// First firing instant `>= not_before`, evaluated in `tz`.
    ///
    /// Returns `None` when no firing exists within the search horizon.
    pub fn next_firing(&self, tz: Tz, not_before: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut local = not_before.with_timezone(&tz).naive_local();

        for _ in 0..MAX_RESOLUTION_STEPS {
            let candidate = self.next_local(local)?;
            // `earliest()` is None inside a spring-forward gap (the local time
            // does not exist) and picks the first of two instants in a
            // fall-back overlap, so a repeated wall-clock time fires once.
            if let Some(instant) = tz.from_local_datetime(&candidate).earliest() {
                let utc = instant.with_timezone(&Utc);
                if utc >= not_before {
                    return Some(utc);
                }
            }
            local = candidate.checked_add_signed(Duration::minutes(1))?;
        }
        None
    }

    /// Every firing `f` with `start <= f <= end`, strictly ascending, no
    /// duplicates. The cursor advances at least one second per firing, with
    /// a step cap on top so no expression can loop the scan.
    pub fn firings(&self, tz: Tz, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        if start > end {
            return out;
        }

        let mut cursor = start;
        for _ in 0..MAX_RESOLUTION_STEPS {
            let Some(firing) = self.next_firing(tz, cursor) else {
                break;
            };
            if firing > end {
                break;
            }
            // Defensive termination: never emit a non-advancing instant.
            if out.last().is_some_and(|&last| firing <= last) {
                cursor = firing + Duration::seconds(1);
                continue;
            }
            out.push(firing);
            cursor = firing + Duration::seconds(1);
        }
        out
    }
}

/// Parse one field into a value set. Grammar per part: `*`, `N`, `N-M`,
/// `*/S`, `N/S` (open-ended range), `N-M/S`; parts joined by `,`.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<FieldSet, String> {
    let mut set = FieldSet::empty();

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty list element in '{field}'"));
        }

        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| format!("invalid step '{s}' in '{field}'"))?;
                if step == 0 || step > max {
                    return Err(format!("step {step} out of range in '{field}'"));
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            (
                parse_value(lo, min, max, names)?,
                parse_value(hi, min, max, names)?,
            )
        } else {
            let value = parse_value(range_part, min, max, names)?;
            // A bare value with a step (`3/4`) means "from 3 to max".
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(format!("descending range {start}-{end} in '{field}'"));
        }

        let mut v = start;
        while v <= end {
            set.insert(v);
            v += step;
        }
    }

    Ok(set)
}

fn parse_value(token: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<u32, String> {
    if let Some(names) = names {
        let lower = token.to_ascii_lowercase();
        if let Some(idx) = names.iter().position(|n| *n == lower) {
            return Ok(min + idx as u32);
        }
    }
    let value: u32 = token
        .parse()
        .map_err(|_| format!("invalid value '{token}'"))?;
    if value < min || value > max {
        return Err(format!("value {value} outside {min}-{max}"));
    }
    Ok(value)
}

/// Day-of-week: names `sun`..`sat`, numbers 0-7 where both 0 and 7 are Sunday.
fn parse_dow(field: &str) -> Result<FieldSet, String> {
    let raw = parse_field(field, 0, 7, Some(&DAY_NAMES))?;
    let mut set = FieldSet::empty();
    for v in 0..=7u32 {
        if raw.contains(v) {
            set.insert(v % 7);
        }
    }
    Ok(set)
}

fn ceil_to_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let truncated = t.date().and_time(NaiveTime::from_hms_opt(t.hour(), t.minute(), 0)?);
    if truncated < t {
        truncated.checked_add_signed(Duration::minutes(1))
    } else {
        Some(truncated)
    }
}

fn truncate_to_hour(t: NaiveDateTime) -> Option<NaiveDateTime> {
    Some(t.date().and_time(NaiveTime::from_hms_opt(t.hour(), 0, 0)?))
}

fn first_of_next_month(d: NaiveDate) -> Option<NaiveDate> {
    if d.month() == 12 {
        NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
    }
}
