//! Five-field schedule expressions and next-fire computation.
//!
//! Expressions use the classic `minute hour day-of-month month day-of-week`
//! layout. Each field is `*`, a single value, or a comma-separated list of
//! values. Day-of-week accepts `0` through `7`, where both `0` and `7` mean
//! Sunday. Day-of-month and day-of-week must both match for a minute to fire.
//!
//! All evaluation happens in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How far ahead [`CronSchedule::next_after`] searches before giving up.
pub const SEARCH_HORIZON_YEARS: i32 = 30;

/// Errors raised while parsing or building schedule expressions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScheduleError {
    /// Raised when the expression does not have exactly five fields.
    #[error("schedule must have 5 fields (minute hour day month weekday), found {found}")]
    FieldCount {
        /// Number of whitespace-separated fields present.
        found: usize,
    },
    /// Raised when a field token is not `*` or a decimal number.
    #[error("invalid {field} value {token:?}: expected *, a number, or a comma list")]
    InvalidToken {
        /// Field name.
        field: &'static str,
        /// Offending token.
        token: String,
    },
    /// Raised when a numeric value falls outside the field's range.
    #[error("{field} value {value} is out of range {min}-{max}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u32,
        /// Smallest accepted value.
        min: u32,
        /// Largest accepted value.
        max: u32,
    },
}

#[derive(Clone, Copy, Debug)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day of month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day of week",
    min: 0,
    max: 7,
};

/// One parsed field. `values` is `None` for the wildcard.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Field {
    text: String,
    values: Option<Vec<u32>>,
}

impl Field {
    fn parse(text: &str, spec: FieldSpec) -> Result<Self, ScheduleError> {
        if text == "*" {
            return Ok(Self {
                text: text.to_owned(),
                values: None,
            });
        }

        let mut values = Vec::new();
        for token in text.split(',') {
            let value = parse_value(token, spec)?;
            values.push(value);
        }
        values.sort_unstable();
        values.dedup();
        Ok(Self {
            text: text.to_owned(),
            values: Some(values),
        })
    }

    fn matches(&self, value: u32) -> bool {
        self.values
            .as_ref()
            .is_none_or(|values| values.binary_search(&value).is_ok())
    }
}

fn parse_value(token: &str, spec: FieldSpec) -> Result<u32, ScheduleError> {
    if token.is_empty() || !token.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ScheduleError::InvalidToken {
            field: spec.name,
            token: token.to_owned(),
        });
    }
    let value = token
        .parse::<u32>()
        .map_err(|_| ScheduleError::InvalidToken {
            field: spec.name,
            token: token.to_owned(),
        })?;
    if value < spec.min || value > spec.max {
        return Err(ScheduleError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

/// A validated five-field schedule.
///
/// The textual form is preserved exactly as given (apart from collapsing
/// whitespace between fields), so `"0 2 * * *"` displays unchanged.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    /// Parses an expression such as `"30 1 * * 1,3,5"`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when the field count, a token, or a value
    /// range is invalid.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        ScheduleParts::from_expression(expression)?.build()
    }

    /// Builds a schedule firing every day at `hour:minute`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::OutOfRange`] for invalid times.
    pub fn daily(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        ScheduleParts {
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: String::from("*"),
            month: String::from("*"),
            day_of_week: String::from("*"),
        }
        .build()
    }

    /// Builds a schedule firing every week on `weekday` at `hour:minute`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::OutOfRange`] for invalid times.
    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        ScheduleParts {
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: String::from("*"),
            month: String::from("*"),
            day_of_week: weekday.num_days_from_sunday().to_string(),
        }
        .build()
    }

    /// Splits the schedule into its five field strings.
    #[must_use]
    pub fn parts(&self) -> ScheduleParts {
        ScheduleParts {
            minute: self.minute.text.clone(),
            hour: self.hour.text.clone(),
            day_of_month: self.day_of_month.text.clone(),
            month: self.month.text.clone(),
            day_of_week: self.day_of_week.text.clone(),
        }
    }

    /// Returns `true` when the whole minute containing `instant` fires.
    #[must_use]
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        self.month.matches(instant.month())
            && self.day_matches(instant.date_naive())
            && self.hour.matches(instant.hour())
            && self.minute.matches(instant.minute())
    }

    /// Returns the first whole minute strictly after `after` that matches
    /// every field, or `None` when nothing matches within
    /// [`SEARCH_HORIZON_YEARS`].
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit_year = after.year().checked_add(SEARCH_HORIZON_YEARS)?;
        let mut candidate = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(TimeDelta::minutes(1))?;

        while candidate.year() <= limit_year {
            if !self.month.matches(candidate.month()) {
                candidate = start_of_next_month(candidate)?;
            } else if !self.day_matches(candidate.date_naive()) {
                candidate = start_of_day(candidate.date_naive().succ_opt()?)?;
            } else if !self.hour.matches(candidate.hour()) {
                candidate = candidate
                    .with_minute(0)?
                    .checked_add_signed(TimeDelta::hours(1))?;
            } else if !self.minute.matches(candidate.minute()) {
                candidate = candidate.checked_add_signed(TimeDelta::minutes(1))?;
            } else {
                return Some(candidate);
            }
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday().num_days_from_sunday();
        let weekday_matches =
            self.day_of_week.matches(weekday) || (weekday == 0 && self.day_of_week.matches(7));
        self.day_of_month.matches(date.day()) && weekday_matches
    }
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if instant.month() == 12 {
        (instant.year().checked_add(1)?, 1)
    } else {
        (instant.year(), instant.month().checked_add(1)?)
    };
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1)?)
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts().to_expression())
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronSchedule> for String {
    fn from(value: CronSchedule) -> Self {
        value.to_string()
    }
}

/// The five raw field strings of an expression, for form-style editing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ScheduleParts {
    /// Minute field.
    pub minute: String,
    /// Hour field.
    pub hour: String,
    /// Day-of-month field.
    pub day_of_month: String,
    /// Month field.
    pub month: String,
    /// Day-of-week field.
    pub day_of_week: String,
}

impl ScheduleParts {
    /// Splits `expression` on whitespace into five fields without validating
    /// their contents.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::FieldCount`] unless exactly five fields are
    /// present.
    pub fn from_expression(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            return Err(ScheduleError::FieldCount {
                found: fields.len(),
            });
        };
        Ok(Self {
            minute: (*minute).to_owned(),
            hour: (*hour).to_owned(),
            day_of_month: (*day_of_month).to_owned(),
            month: (*month).to_owned(),
            day_of_week: (*day_of_week).to_owned(),
        })
    }

    /// Joins the fields with single spaces.
    #[must_use]
    pub fn to_expression(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }

    /// Validates the fields and builds a schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when any field is invalid.
    pub fn build(&self) -> Result<CronSchedule, ScheduleError> {
        Ok(CronSchedule {
            minute: Field::parse(self.minute.trim(), MINUTE)?,
            hour: Field::parse(self.hour.trim(), HOUR)?,
            day_of_month: Field::parse(self.day_of_month.trim(), DAY_OF_MONTH)?,
            month: Field::parse(self.month.trim(), MONTH)?,
            day_of_week: Field::parse(self.day_of_week.trim(), DAY_OF_WEEK)?,
        })
    }
}
