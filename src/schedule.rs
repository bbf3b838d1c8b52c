//! Weekly schedule gate and next-run projection.
//!
//! The crawl slot is allow-listed rather than free-form: exactly one
//! five-field cron expression is accepted, and overrides that do not match it
//! fall back with a warning instead of aborting startup.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use tracing::warn;

/// The only cron expression the timer will arm: Sundays at 06:00.
pub const ALLOWED_EXPRESSION: &str = "0 6 * * 0";

/// Allow-list check for a five-field cron expression.
pub fn validate(expression: &str) -> bool {
    expression.trim() == ALLOWED_EXPRESSION
}

/// Resolve the effective expression from an optional override.
///
/// No override keeps the configured expression. An override that passes
/// [`validate`] wins; one that does not is logged and ignored.
pub fn resolve(override_expr: Option<&str>, configured: &str) -> String {
    match override_expr {
        None => configured.to_string(),
        Some(raw) if validate(raw) => raw.trim().to_string(),
        Some(raw) => {
            warn!(
                value = raw,
                allowed = ALLOWED_EXPRESSION,
                "schedule override is not allow-listed, keeping configured expression"
            );
            configured.to_string()
        }
    }
}

/// A validated weekly schedule: the cron expression plus the timezone its
/// wall-clock fields are evaluated in.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    expression: String,
    schedule: CronSchedule,
    tz: Tz,
}

impl ScheduleSpec {
    /// Build a schedule from a five-field expression and an IANA timezone
    /// name. An unknown timezone falls back to UTC with a warning.
    pub fn new(expression: &str, timezone: &str) -> Result<Self> {
        let expression = expression.trim().to_string();
        let tz = parse_timezone(timezone);
        let six = to_six_field(&expression);
        let schedule = CronSchedule::from_str(&six)
            .with_context(|| format!("invalid cron expression: {expression}"))?;
        Ok(Self {
            expression,
            schedule,
            tz,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// First occurrence strictly after `after`, in UTC.
    ///
    /// The projection is computed in the configured timezone so the 06:00
    /// slot tracks local wall clocks across DST shifts.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn parse_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(value = name, "unknown timezone, evaluating schedule in UTC");
            chrono_tz::UTC
        }
    }
}

/// Translate a standard five-field expression into the seconds-leading
/// six-field form the `cron` crate parses. That crate numbers Sunday as 1,
/// so the numeric day-of-week is rewritten to its name.
fn to_six_field(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return expression.to_string();
    }
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        dow_name(fields[4])
    )
}

fn dow_name(token: &str) -> String {
    const NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
    match token.parse::<usize>() {
        // 0 and 7 both mean Sunday in standard cron.
        Ok(n) if n < 7 => NAMES[n].to_string(),
        Ok(7) => NAMES[0].to_string(),
        _ => token.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_validate_accepts_only_the_weekly_slot() {
        assert!(validate("0 6 * * 0"));
        assert!(validate("  0 6 * * 0  "));
        assert!(validate("0 6 * * 0\n"));

        assert!(!validate("0 6 * * 1"));
        assert!(!validate("0 7 * * 0"));
        assert!(!validate("* * * * *"));
        assert!(!validate("*/5 * * * *"));
        assert!(!validate("0 6 * * 0 2025"));
        assert!(!validate(""));
        assert!(!validate("definitely not cron"));
    }

    #[test]
    fn test_resolve_prefers_valid_override() {
        assert_eq!(resolve(Some("0 6 * * 0"), "0 6 * * 0"), "0 6 * * 0");
    }

    #[test]
    fn test_resolve_falls_back_on_invalid_override() {
        assert_eq!(resolve(Some("*/1 * * * *"), "0 6 * * 0"), "0 6 * * 0");
        assert_eq!(resolve(Some(""), "0 6 * * 0"), "0 6 * * 0");
    }

    #[test]
    fn test_resolve_without_override_keeps_configured() {
        assert_eq!(resolve(None, "0 6 * * 0"), "0 6 * * 0");
    }

    #[test]
    fn test_six_field_translation() {
        assert_eq!(to_six_field("0 6 * * 0"), "0 0 6 * * SUN");
        assert_eq!(to_six_field("30 4 * * 7"), "0 30 4 * * SUN");
        assert_eq!(to_six_field("0 6 * * 3"), "0 0 6 * * WED");
        assert_eq!(to_six_field("0 6 * * SAT"), "0 0 6 * * SAT");
        // Not five fields: passed through untouched.
        assert_eq!(to_six_field("0 0 6 * * SUN"), "0 0 6 * * SUN");
    }

    #[test]
    fn test_next_occurrence_lands_on_sunday_morning() {
        let spec = ScheduleSpec::new("0 6 * * 0", "UTC").unwrap();
        // Wednesday.
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let next = spec.next_occurrence(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 5, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_is_strictly_after() {
        let spec = ScheduleSpec::new("0 6 * * 0", "UTC").unwrap();
        // Exactly on the slot: the projection must move a full week out.
        let on_slot = Utc.with_ymd_and_hms(2025, 1, 5, 6, 0, 0).unwrap();
        let next = spec.next_occurrence(on_slot).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 12, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_just_before_the_slot() {
        let spec = ScheduleSpec::new("0 6 * * 0", "UTC").unwrap();
        let from = Utc.with_ymd_and_hms(2025, 1, 5, 5, 59, 59).unwrap();
        let next = spec.next_occurrence(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 5, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_weekly_cadence_in_utc() {
        let spec = ScheduleSpec::new("0 6 * * 0", "UTC").unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap();
        let first = spec.next_occurrence(from).unwrap();
        let second = spec.next_occurrence(first).unwrap();
        assert_eq!(second - first, chrono::Duration::days(7));
    }

    #[test]
    fn test_next_occurrence_respects_timezone() {
        let spec = ScheduleSpec::new("0 6 * * 0", "America/New_York").unwrap();
        // Wednesday in June: EDT, four hours behind UTC.
        let from = Utc.with_ymd_and_hms(2025, 6, 4, 0, 0, 0).unwrap();
        let next = spec.next_occurrence(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 8, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let spec = ScheduleSpec::new("0 6 * * 0", "Mars/Olympus_Mons").unwrap();
        assert_eq!(spec.timezone(), chrono_tz::UTC);
    }

    #[test]
    fn test_malformed_expression_is_an_error() {
        assert!(ScheduleSpec::new("not cron at all", "UTC").is_err());
    }
}
