//! Cron expression parsing and evaluation.
//!
//! Expressions use the classic five fields: minute, hour, day-of-month,
//! month, and day-of-week, with `@hourly`-style aliases. Evaluation works at
//! one-minute resolution against a wall-clock time in any timezone.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, TimeZone, Timelike};

use crate::errors::Error;

const EXPRESSION_ALIASES: &[(&str, &str)] = &[
    ("@annually", "0 0 1 1 *"),
    ("@yearly", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@midnight", "0 0 * * *"),
    ("@daily", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

const MONTH_ALIASES: &[(&str, &str)] = &[
    ("JAN", "1"),
    ("FEB", "2"),
    ("MAR", "3"),
    ("APR", "4"),
    ("MAY", "5"),
    ("JUN", "6"),
    ("JUL", "7"),
    ("AUG", "8"),
    ("SEP", "9"),
    ("OCT", "10"),
    ("NOV", "11"),
    ("DEC", "12"),
];

const WEEKDAY_ALIASES: &[(&str, &str)] = &[
    ("SUN", "0"),
    ("MON", "1"),
    ("TUE", "2"),
    ("WED", "3"),
    ("THU", "4"),
    ("FRI", "5"),
    ("SAT", "6"),
];

/// A cron spec attached to a worker: the raw expression plus an optional
/// timezone override. Parsing is deferred to engine startup so that a bad
/// expression aborts loudly rather than being silently skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    /// The five-field expression or an `@` alias.
    pub expr: String,
    /// Timezone override. `None` falls back to the engine's zone.
    pub timezone: Option<chrono_tz::Tz>,
}

impl CronSpec {
    /// A cron spec evaluated in the engine's configured timezone.
    pub fn new(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            timezone: None,
        }
    }

    /// Evaluate the expression in the given zone instead of the engine's.
    pub fn in_timezone(mut self, timezone: chrono_tz::Tz) -> Self {
        self.timezone = Some(timezone);
        self
    }
}

impl From<&str> for CronSpec {
    fn from(expr: &str) -> Self {
        Self::new(expr)
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    input: String,
    minutes: BTreeSet<u8>,
    hours: BTreeSet<u8>,
    days: BTreeSet<u8>,
    months: BTreeSet<u8>,
    weekdays: BTreeSet<u8>,
    day_wildcard: bool,
    weekday_wildcard: bool,
}

impl Expression {
    /// Parse an expression or alias. Aliases and month/weekday names are
    /// case-insensitive.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let normalized = input.trim().to_uppercase();

        let expanded = EXPRESSION_ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(&normalized))
            .map(|(_, expansion)| (*expansion).to_owned())
            .unwrap_or(normalized);

        let fields: Vec<&str> = expanded.split_whitespace().collect();

        let [minutes, hours, days, months, weekdays] = fields.as_slice() else {
            return Err(invalid(input, "incorrect number of fields"));
        };

        let months = translate(months, MONTH_ALIASES);
        let weekdays = translate(weekdays, WEEKDAY_ALIASES);

        Ok(Self {
            input: expanded.clone(),
            minutes: parse_field(input, minutes, 0, 59)?,
            hours: parse_field(input, hours, 0, 23)?,
            days: parse_field(input, days, 1, 31)?,
            months: parse_field(input, &months, 1, 12)?,
            weekdays: parse_field(input, &weekdays, 0, 6)?,
            day_wildcard: *days == "*",
            weekday_wildcard: weekdays == "*",
        })
    }

    /// Whether the expression matches the minute containing `time`.
    ///
    /// Per classical cron, when both day fields are restricted the day
    /// matches if either one does; otherwise the restricted field governs.
    pub fn matches<Tz: TimeZone>(&self, time: &DateTime<Tz>) -> bool {
        self.minutes.contains(&(time.minute() as u8))
            && self.hours.contains(&(time.hour() as u8))
            && self.months.contains(&(time.month() as u8))
            && self.day_matches(time.day() as u8, time.weekday().num_days_from_sunday() as u8)
    }

    /// The expanded canonical input, with aliases resolved.
    pub fn as_str(&self) -> &str {
        &self.input
    }

    #[cfg(test)]
    fn minutes(&self) -> &BTreeSet<u8> {
        &self.minutes
    }

    #[cfg(test)]
    fn hours(&self) -> &BTreeSet<u8> {
        &self.hours
    }

    #[cfg(test)]
    fn months(&self) -> &BTreeSet<u8> {
        &self.months
    }

    #[cfg(test)]
    fn weekdays(&self) -> &BTreeSet<u8> {
        &self.weekdays
    }

    fn day_matches(&self, day: u8, weekday: u8) -> bool {
        match (self.day_wildcard, self.weekday_wildcard) {
            (true, true) => true,
            (true, false) => self.weekdays.contains(&weekday),
            (false, true) => self.days.contains(&day),
            (false, false) => self.days.contains(&day) || self.weekdays.contains(&weekday),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)
    }
}

impl std::str::FromStr for Expression {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

fn invalid(input: &str, reason: impl Into<String>) -> Error {
    Error::InvalidCron {
        input: input.to_owned(),
        reason: reason.into(),
    }
}

fn translate(field: &str, aliases: &[(&str, &str)]) -> String {
    let mut field = field.to_owned();

    for (alias, value) in aliases {
        field = field.replace(alias, value);
    }

    field
}

fn parse_field(input: &str, field: &str, min: u8, max: u8) -> Result<BTreeSet<u8>, Error> {
    let mut parsed = BTreeSet::new();

    for part in field.split(',') {
        parsed.extend(parse_part(input, part.trim(), min, max)?);
    }

    if let Some(out_of_range) = parsed.iter().find(|value| **value < min || **value > max) {
        return Err(invalid(
            input,
            format!("field {field} is out of range: {out_of_range} not in {min}..={max}"),
        ));
    }

    Ok(parsed)
}

fn parse_part(input: &str, part: &str, min: u8, max: u8) -> Result<BTreeSet<u8>, Error> {
    if part == "*" {
        return Ok((min..=max).collect());
    }

    if let Some(step) = part.strip_prefix("*/") {
        let step = parse_step(input, step)?;
        return Ok((min..=max).step_by(step as usize).collect());
    }

    if let Some((range, step)) = part.split_once('/') {
        let range = parse_range(input, range, max)?;
        let step = parse_step(input, step)?;
        let start = *range.first().ok_or_else(|| invalid(input, "empty range"))?;
        let end = *range.last().unwrap_or(&max);

        return Ok((start..=end).step_by(step as usize).collect());
    }

    if part.contains('-') {
        return parse_range(input, part, max);
    }

    match part.parse::<u8>() {
        Ok(value) => Ok(BTreeSet::from([value])),
        Err(_) => Err(invalid(input, format!("unrecognized expression: {part}"))),
    }
}

fn parse_step(input: &str, step: &str) -> Result<u8, Error> {
    match step.parse::<u8>() {
        Ok(step) if (1..=99).contains(&step) => Ok(step),
        _ => Err(invalid(input, format!("unrecognized expression: /{step}"))),
    }
}

fn parse_range(input: &str, range: &str, max: u8) -> Result<BTreeSet<u8>, Error> {
    match range.split_once('-') {
        None => {
            let start = range
                .parse::<u8>()
                .map_err(|_| invalid(input, format!("unrecognized expression: {range}")))?;

            Ok((start..=max).collect())
        }
        Some((start, end)) => {
            let start = start
                .parse::<u8>()
                .map_err(|_| invalid(input, format!("unrecognized expression: {range}")))?;
            let end = end
                .parse::<u8>()
                .map_err(|_| invalid(input, format!("unrecognized expression: {range}")))?;

            if start > end {
                return Err(invalid(
                    input,
                    format!("min of range ({start}) must be less than or equal to max ({end})"),
                ));
            }

            Ok((start..=end).collect())
        }
    }
}
