//! Cron expression and timezone handling for scheduled task definitions.
//!
//! Expressions are validated at create/update time, never at dispatch time.
//! Next-occurrence computation is "strictly after now", evaluated in the
//! definition's named timezone and converted back to UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

pub const DEFAULT_TIMEZONE: &str = "UTC";

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("cron cannot be empty")]
    EmptyCron,
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("name cannot be empty")]
    EmptyName,
    #[error("prompt cannot be empty")]
    EmptyPrompt,
    #[error("cron expression has no upcoming occurrence: {0}")]
    NoUpcomingFire(String),
}

/// Standard 5-field cron is accepted and pinned to second zero; 6/7-field
/// expressions (with seconds, optionally a year) pass through unchanged.
fn with_seconds_field(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(&with_seconds_field(expr))
        .map_err(|_| ScheduleError::InvalidCron(expr.to_string()))
}

pub fn validate_cron(expr: &str) -> Result<String, ScheduleError> {
    let value = expr.trim();
    if value.is_empty() {
        return Err(ScheduleError::EmptyCron);
    }
    parse_schedule(value)?;
    Ok(value.to_string())
}

/// Empty/blank timezone falls back to UTC; anything else must be a valid
/// IANA name.
pub fn validate_timezone(name: Option<&str>) -> Result<String, ScheduleError> {
    let value = name.map(str::trim).filter(|s| !s.is_empty());
    let value = match value {
        Some(v) => v,
        None => return Ok(DEFAULT_TIMEZONE.to_string()),
    };
    value
        .parse::<Tz>()
        .map(|_| value.to_string())
        .map_err(|_| ScheduleError::InvalidTimezone(value.to_string()))
}

pub fn normalize_name(value: &str) -> Result<String, ScheduleError> {
    let name = value.trim();
    if name.is_empty() {
        return Err(ScheduleError::EmptyName);
    }
    Ok(name.to_string())
}

pub fn normalize_prompt(value: &str) -> Result<String, ScheduleError> {
    let prompt = value.trim();
    if prompt.is_empty() {
        return Err(ScheduleError::EmptyPrompt);
    }
    Ok(prompt.to_string())
}

/// Smallest fire time strictly after `now_utc` for the expression evaluated
/// in `tz_name`, converted to UTC.
pub fn next_fire_at(
    cron_expr: &str,
    tz_name: &str,
    now_utc: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let tz: Tz = tz_name
        .parse()
        .map_err(|_| ScheduleError::InvalidTimezone(tz_name.to_string()))?;
    let schedule = parse_schedule(cron_expr.trim())?;
    let local_now = now_utc.with_timezone(&tz);
    schedule
        .after(&local_now)
        .next()
        .map(|next| next.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::NoUpcomingFire(cron_expr.to_string()))
}
