use crate::validation::ValidationError;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

/* Label timestamps use the strict atproto datetime profile of ISO 8601:
 *   YYYY-MM-DDTHH:MM:SS[.fff](Z|+HH:MM|-HH:MM)
 * Calendar fields are range-checked against the real month length, so
 * 2023-02-29 fails and 2024-02-29 passes.
 */

lazy_static! {
    static ref TIMESTAMP_REGEX: Regex = Regex::new(
        r"^(?P<year>[0-9]{4})-(?P<month>[0-9]{2})-(?P<day>[0-9]{2})T(?P<hour>[0-9]{2}):(?P<minute>[0-9]{2}):(?P<second>[0-9]{2})(\.[0-9]{1,9})?(?P<tz>Z|[+-](?P<tzh>[0-9]{2}):(?P<tzm>[0-9]{2}))$"
    ).unwrap();
}

/// Temporal constraint applied on top of the syntax check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampRule {
    /// No constraint relative to the clock.
    Any,
    /// Creation timestamps: must not be after "now".
    NotInFuture,
    /// Expiration timestamps: must be strictly after "now" unless
    /// `allow_expired` is set.
    InFuture { allow_expired: bool },
}

pub fn validate_timestamp(
    value: &str,
    field: &str,
    rule: TimestampRule,
) -> Result<DateTime<Utc>, ValidationError> {
    validate_timestamp_at(value, field, rule, Utc::now())
}

/// Same as [`validate_timestamp`] against an explicit clock reading.
pub fn validate_timestamp_at(
    value: &str,
    field: &str,
    rule: TimestampRule,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(format!("{field} cannot be empty")));
    }
    let caps = TIMESTAMP_REGEX.captures(value).ok_or_else(|| {
        ValidationError::new(format!(
            "{field} must be an ISO 8601 timestamp (YYYY-MM-DDTHH:MM:SS[.sss](Z|+HH:MM)), got \"{value}\""
        ))
    })?;

    let number = |name: &str| -> u32 {
        caps.name(name)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    let (year, month, day) = (number("year"), number("month"), number("day"));
    let (hour, minute, second) = (number("hour"), number("minute"), number("second"));

    let out_of_range = |part: &str| {
        ValidationError::new(format!("{field} has an out of range {part}: \"{value}\""))
    };
    if year == 0 {
        return Err(out_of_range("year"));
    }
    if !(1..=12).contains(&month) {
        return Err(out_of_range("month"));
    }
    if day == 0 || day > days_in_month(year, month) {
        return Err(out_of_range("day"));
    }
    if hour > 23 {
        return Err(out_of_range("hour"));
    }
    if minute > 59 {
        return Err(out_of_range("minute"));
    }
    if second > 59 {
        return Err(out_of_range("second"));
    }
    if caps.name("tzh").is_some() && (number("tzh") > 23 || number("tzm") > 59) {
        return Err(out_of_range("timezone offset"));
    }

    let instant = DateTime::parse_from_rfc3339(value)
        .map_err(|e| ValidationError::new(format!("{field} is not a valid timestamp: {e}")))?
        .with_timezone(&Utc);

    match rule {
        TimestampRule::Any => {}
        TimestampRule::NotInFuture => {
            if instant > now {
                return Err(ValidationError::new(format!(
                    "{field} cannot be in the future"
                )));
            }
        }
        TimestampRule::InFuture { allow_expired } => {
            if instant <= now && !allow_expired {
                return Err(ValidationError::new(format!(
                    "{field} must be in the future"
                )));
            }
        }
    }

    Ok(instant)
}

pub fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

fn is_leap_year(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
