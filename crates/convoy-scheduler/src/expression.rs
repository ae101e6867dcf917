//! Schedule expressions
//!
//! Three dialects are accepted:
//!
//! - `rate(N minute|minutes|hour|hours|day|days)`, anchored at the Unix epoch
//! - `cron(min hour day-of-month month day-of-week year)`, six fields with
//!   `?` allowed and day-of-week 1-7 where Sunday is 1
//! - plain five-field cron `min hour day-of-month month day-of-week`, with
//!   day-of-week 0-7 where both 0 and 7 are Sunday
//!
//! Fields support `*`, lists, ranges and `/step`; months and weekdays may be
//! given by three-letter name.

use crate::error::{Result, ScheduleError};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parsed schedule expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpression {
    /// Fires every `minutes` minutes since the epoch
    Rate { minutes: u64 },
    Cron(CronSchedule),
}

impl ScheduleExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();

        if let Some(body) = strip_call(trimmed, "rate") {
            return parse_rate(expression, body);
        }
        if let Some(body) = strip_call(trimmed, "cron") {
            return CronSchedule::parse(expression, body, Dialect::EventBridge).map(Self::Cron);
        }
        CronSchedule::parse(expression, trimmed, Dialect::Unix).map(Self::Cron)
    }

    /// Whether the expression fires in the minute starting at `minute`
    pub fn matches(&self, minute: DateTime<Utc>) -> bool {
        match self {
            ScheduleExpression::Rate { minutes } => {
                let since_epoch = minute.timestamp().div_euclid(60);
                since_epoch.rem_euclid(*minutes as i64) == 0
            }
            ScheduleExpression::Cron(cron) => cron.matches(minute),
        }
    }
}

impl FromStr for ScheduleExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleExpression::Rate { minutes } => write!(f, "rate({} minutes)", minutes),
            ScheduleExpression::Cron(cron) => f.write_str(&cron.source),
        }
    }
}

fn strip_call<'a>(expression: &'a str, name: &str) -> Option<&'a str> {
    let rest = expression.strip_prefix(name)?.trim_start();
    rest.strip_prefix('(')?.strip_suffix(')').map(str::trim)
}

fn parse_rate(expression: &str, body: &str) -> Result<ScheduleExpression> {
    let mut parts = body.split_whitespace();
    let (value, unit) = match (parts.next(), parts.next(), parts.next()) {
        (Some(value), Some(unit), None) => (value, unit),
        _ => {
            return Err(ScheduleError::invalid(
                expression,
                "expected rate(<value> <unit>)",
            ))
        }
    };

    let value: u64 = value
        .parse()
        .map_err(|_| ScheduleError::invalid(expression, format!("'{}' is not a number", value)))?;
    if value == 0 {
        return Err(ScheduleError::invalid(expression, "rate must be positive"));
    }

    let unit_minutes = match unit.to_ascii_lowercase().as_str() {
        "minute" | "minutes" => 1,
        "hour" | "hours" => 60,
        "day" | "days" => 24 * 60,
        other => {
            return Err(ScheduleError::invalid(
                expression,
                format!("unknown rate unit '{}'", other),
            ))
        }
    };

    Ok(ScheduleExpression::Rate {
        minutes: value * unit_minutes,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// `cron(...)` with six fields
    EventBridge,
    /// Five bare fields
    Unix,
}

/// Allowed values of one cron field; `None` means unrestricted
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field(Option<BTreeSet<u32>>);

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.0.as_ref().map_or(true, |set| set.contains(&value))
    }

    fn is_any(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<&'static [&'static str]>,
    /// Value of the first entry in `names`
    names_base: u32,
    allows_question_mark: bool,
}

/// Parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    /// Sunday = 0
    day_of_week: Field,
    year: Field,
}

impl CronSchedule {
    fn parse(source: &str, body: &str, dialect: Dialect) -> Result<Self> {
        let fields: Vec<&str> = body.split_whitespace().collect();
        let expected = match dialect {
            Dialect::EventBridge => 6,
            Dialect::Unix => 5,
        };
        if fields.len() != expected {
            return Err(ScheduleError::invalid(
                source,
                format!("expected {} fields, found {}", expected, fields.len()),
            ));
        }

        let question_mark = dialect == Dialect::EventBridge;
        let (dow_min, dow_max, dow_base) = match dialect {
            Dialect::EventBridge => (1, 7, 1),
            Dialect::Unix => (0, 7, 0),
        };

        let minute = parse_field(source, fields[0], plain("minute", 0, 59))?;
        let hour = parse_field(source, fields[1], plain("hour", 0, 23))?;
        let day_of_month = parse_field(
            source,
            fields[2],
            FieldSpec {
                allows_question_mark: question_mark,
                ..plain("day-of-month", 1, 31)
            },
        )?;
        let month = parse_field(
            source,
            fields[3],
            FieldSpec {
                names: Some(&MONTH_NAMES),
                names_base: 1,
                ..plain("month", 1, 12)
            },
        )?;
        let raw_dow = parse_field(
            source,
            fields[4],
            FieldSpec {
                names: Some(&DAY_NAMES),
                names_base: dow_base,
                allows_question_mark: question_mark,
                ..plain("day-of-week", dow_min, dow_max)
            },
        )?;
        let year = match dialect {
            Dialect::EventBridge => parse_field(source, fields[5], plain("year", 1970, 2199))?,
            Dialect::Unix => Field(None),
        };

        if dialect == Dialect::EventBridge && !day_of_month.is_any() && !raw_dow.is_any() {
            return Err(ScheduleError::invalid(
                source,
                "one of day-of-month and day-of-week must be '?' or '*'",
            ));
        }

        // Normalise weekdays to Sunday = 0
        let day_of_week = Field(raw_dow.0.map(|days| {
            days.into_iter()
                .map(|d| match dialect {
                    Dialect::EventBridge => d - 1,
                    Dialect::Unix => d % 7,
                })
                .collect()
        }));

        Ok(Self {
            source: source.trim().to_string(),
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
            year,
        })
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !(self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.month.matches(at.month()))
        {
            return false;
        }
        let year_ok = u32::try_from(at.year()).map_or(false, |y| self.year.matches(y));
        if !year_ok {
            return false;
        }

        let dom = self.day_of_month.matches(at.day());
        let dow = self
            .day_of_week
            .matches(at.weekday().num_days_from_sunday());

        // Both restricted: either may match, as in classic cron
        if !self.day_of_month.is_any() && !self.day_of_week.is_any() {
            dom || dow
        } else {
            dom && dow
        }
    }
}

fn plain(name: &'static str, min: u32, max: u32) -> FieldSpec {
    FieldSpec {
        name,
        min,
        max,
        names: None,
        names_base: 0,
        allows_question_mark: false,
    }
}

fn parse_field(source: &str, raw: &str, spec: FieldSpec) -> Result<Field> {
    if raw == "?" {
        return if spec.allows_question_mark {
            Ok(Field(None))
        } else {
            Err(ScheduleError::invalid(
                source,
                format!("'?' is not allowed in {}", spec.name),
            ))
        };
    }

    let mut values = BTreeSet::new();
    let mut unrestricted = false;

    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    ScheduleError::invalid(source, format!("bad step '{}' in {}", step, spec.name))
                })?;
                if step == 0 {
                    return Err(ScheduleError::invalid(
                        source,
                        format!("step must be positive in {}", spec.name),
                    ));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            if step.is_none() {
                unrestricted = true;
                continue;
            }
            (spec.min, spec.max)
        } else if let Some((from, to)) = range.split_once('-') {
            (value(source, from, &spec)?, value(source, to, &spec)?)
        } else {
            let start = value(source, range, &spec)?;
            // `5/15` runs from 5 to the end of the range
            (start, if step.is_some() { spec.max } else { start })
        };

        if start > end {
            return Err(ScheduleError::invalid(
                source,
                format!("range {}-{} is reversed in {}", start, end, spec.name),
            ));
        }
        values.extend((start..=end).step_by(step.unwrap_or(1) as usize));
    }

    if unrestricted {
        Ok(Field(None))
    } else {
        Ok(Field(Some(values)))
    }
}

fn value(source: &str, raw: &str, spec: &FieldSpec) -> Result<u32> {
    let parsed = match raw.parse::<u32>() {
        Ok(n) => Some(n),
        Err(_) => spec.names.and_then(|names| {
            names
                .iter()
                .position(|n| n.eq_ignore_ascii_case(raw))
                .map(|i| i as u32 + spec.names_base)
        }),
    };

    match parsed {
        Some(n) if (spec.min..=spec.max).contains(&n) => Ok(n),
        Some(n) => Err(ScheduleError::invalid(
            source,
            format!("{} out of range {}-{} in {}", n, spec.min, spec.max, spec.name),
        )),
        None => Err(ScheduleError::invalid(
            source,
            format!("'{}' is not a valid {}", raw, spec.name),
        )),
    }
}
