use chrono::{DateTime, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cron::CronExpr;
use crate::error::{Error, Result};

/// When and how often a pair is synchronized. The variant lives in the
/// `type` field on the wire; the optional bounds apply to every variant
/// except `Disabled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(flatten)]
    pub kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(rename = "startDate", default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(rename = "endDate", default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(rename = "maxRuns", default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Manual execution only.
    Disabled,
    /// Runs on filesystem events.
    Watcher,
    /// Fires every `interval` ("5m", "1h30m", ...).
    Interval { interval: String },
    /// Six-field cron expression with seconds precision.
    Cron {
        #[serde(rename = "cronExpr")]
        cron_expr: String,
    },
    /// Interval firings restricted to weekdays and a local time window.
    Custom { custom: CustomSchedule },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSchedule {
    /// Allowed weekdays, 0 = Sunday. Empty means every day.
    #[serde(default)]
    pub week_days: Vec<u8>,
    /// Window start, "HH:MM".
    pub start_time: String,
    /// Window end, "HH:MM" (inclusive).
    pub end_time: String,
    /// Minimum spacing between firings.
    pub interval: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_holidays: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub only_work_days: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::watcher()
    }
}

impl Schedule {
    pub fn disabled() -> Self {
        Self::with_kind(ScheduleKind::Disabled)
    }

    pub fn watcher() -> Self {
        Self::with_kind(ScheduleKind::Watcher)
    }

    pub fn interval(interval: impl Into<String>) -> Self {
        Self::with_kind(ScheduleKind::Interval { interval: interval.into() })
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self::with_kind(ScheduleKind::Cron { cron_expr: expr.into() })
    }

    /// Monday through Friday within `[start_time, end_time]`, every
    /// `interval`.
    pub fn workdays(start_time: &str, end_time: &str, interval: &str) -> Self {
        Self::custom(vec![1, 2, 3, 4, 5], start_time, end_time, interval)
    }

    pub fn custom(week_days: Vec<u8>, start_time: &str, end_time: &str, interval: &str) -> Self {
        Self::with_kind(ScheduleKind::Custom {
            custom: CustomSchedule {
                week_days,
                start_time: start_time.to_string(),
                end_time: end_time.to_string(),
                interval: interval.to_string(),
                skip_holidays: false,
                only_work_days: false,
            },
        })
    }

    fn with_kind(kind: ScheduleKind) -> Self {
        Self { kind, timezone: None, start_date: None, end_date: None, max_runs: None }
    }

    /// Validate the variant-specific fields plus the optional timezone.
    pub fn validate(&self) -> Result<()> {
        if let Some(tz) = &self.timezone {
            Timezone::parse(tz)?;
        }
        match &self.kind {
            ScheduleKind::Disabled | ScheduleKind::Watcher => Ok(()),
            ScheduleKind::Interval { interval } => {
                if interval.is_empty() {
                    return Err(Error::InvalidSchedule(
                        "interval is required for interval schedule".into(),
                    ));
                }
                parse_duration(interval)?;
                Ok(())
            }
            ScheduleKind::Cron { cron_expr } => {
                if cron_expr.is_empty() {
                    return Err(Error::InvalidSchedule(
                        "cron expression is required for cron schedule".into(),
                    ));
                }
                CronExpr::parse(cron_expr)?;
                Ok(())
            }
            ScheduleKind::Custom { custom } => custom.validate(),
        }
    }
}

impl ScheduleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScheduleKind::Disabled => "disabled",
            ScheduleKind::Watcher => "watcher",
            ScheduleKind::Interval { .. } => "interval",
            ScheduleKind::Cron { .. } => "cron",
            ScheduleKind::Custom { .. } => "custom",
        }
    }
}

impl CustomSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.start_time.is_empty() || self.end_time.is_empty() {
            return Err(Error::InvalidSchedule(
                "start time and end time are required for custom schedule".into(),
            ));
        }
        parse_clock(&self.start_time)?;
        parse_clock(&self.end_time)?;
        if self.interval.is_empty() {
            return Err(Error::InvalidSchedule(
                "interval is required for custom schedule".into(),
            ));
        }
        parse_duration(&self.interval)?;
        if let Some(day) = self.week_days.iter().find(|d| **d > 6) {
            return Err(Error::InvalidSchedule(format!(
                "invalid weekday {day} (expected 0-6, 0 = Sunday)"
            )));
        }
        Ok(())
    }
}

/// Parse "HH:MM" into a time of day.
pub fn parse_clock(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| Error::InvalidSchedule(format!("invalid time {s:?} (use HH:MM)")))
}

/// Parse a duration string in the `1h30m` style: a sequence of decimal
/// numbers each followed by a unit (`ns`, `us`, `ms`, `s`, `m`, `h`).
pub fn parse_duration(s: &str) -> Result<Duration> {
    let input = s.trim();
    if input.is_empty() {
        return Err(Error::InvalidSchedule("empty duration".into()));
    }
    let mut total_ns: f64 = 0.0;
    let mut rest = input;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_len == 0 || num_len == rest.len() {
            return Err(Error::InvalidSchedule(format!("invalid duration {s:?}")));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| Error::InvalidSchedule(format!("invalid duration {s:?}")))?;
        let unit = &rest[num_len..];
        let (unit_len, scale_ns) = if unit.starts_with("ns") {
            (2, 1.0)
        } else if unit.starts_with("us") {
            (2, 1e3)
        } else if unit.starts_with("ms") {
            (2, 1e6)
        } else if unit.starts_with('s') {
            (1, 1e9)
        } else if unit.starts_with('m') {
            (1, 60.0 * 1e9)
        } else if unit.starts_with('h') {
            (1, 3600.0 * 1e9)
        } else {
            return Err(Error::InvalidSchedule(format!("unknown unit in duration {s:?}")));
        };
        total_ns += value * scale_ns;
        rest = &unit[unit_len..];
    }
    if total_ns <= 0.0 {
        return Err(Error::InvalidSchedule(format!("duration {s:?} must be positive")));
    }
    Ok(Duration::from_nanos(total_ns as u64))
}

/// Time zone used for cron evaluation and the custom-schedule predicates.
/// Only the local zone and UTC are supported; named IANA zones are rejected
/// at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timezone {
    #[default]
    Local,
    Utc,
}

impl Timezone {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "local" | "Local" => Ok(Timezone::Local),
            "UTC" | "utc" | "Utc" => Ok(Timezone::Utc),
            other => Err(Error::InvalidSchedule(format!(
                "unsupported timezone {other:?} (use \"UTC\" or \"local\")"
            ))),
        }
    }

    /// Wall-clock now in this zone.
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Timezone::Local => Local::now().naive_local(),
            Timezone::Utc => Utc::now().naive_utc(),
        }
    }

    /// Map a wall-clock time in this zone back to UTC for display fields.
    pub fn to_utc(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self {
            Timezone::Utc => Utc.from_utc_datetime(&naive),
            Timezone::Local => match Local.from_local_datetime(&naive) {
                LocalResult::Single(dt) => dt.with_timezone(&Utc),
                LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
                LocalResult::None => Utc.from_utc_datetime(&naive),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_composite() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2h45m10s").unwrap(), Duration::from_secs(9910));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn validate_per_variant() {
        assert!(Schedule::disabled().validate().is_ok());
        assert!(Schedule::watcher().validate().is_ok());
        assert!(Schedule::interval("5m").validate().is_ok());
        assert!(Schedule::interval("").validate().is_err());
        assert!(Schedule::cron("0 */15 * * * *").validate().is_ok());
        assert!(Schedule::cron("").validate().is_err());
        assert!(Schedule::custom(vec![1, 2], "08:00", "20:00", "1h30m").validate().is_ok());
        assert!(Schedule::custom(vec![1], "25:00", "20:00", "1h").validate().is_err());
        assert!(Schedule::custom(vec![9], "08:00", "20:00", "1h").validate().is_err());
        assert!(Schedule::custom(vec![1], "08:00", "20:00", "").validate().is_err());
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(Timezone::parse("").unwrap(), Timezone::Local);
        assert_eq!(Timezone::parse("UTC").unwrap(), Timezone::Utc);
        assert!(Timezone::parse("Europe/Moscow").is_err());
    }

    #[test]
    fn schedule_wire_format() {
        let sched = Schedule::interval("1h30m");
        let json = serde_json::to_value(&sched).unwrap();
        assert_eq!(json, serde_json::json!({"type": "interval", "interval": "1h30m"}));

        let parsed: Schedule =
            serde_json::from_str(r#"{"type":"cron","cronExpr":"0 0 8 * * 1-5","timezone":"UTC"}"#)
                .unwrap();
        assert_eq!(parsed.kind, ScheduleKind::Cron { cron_expr: "0 0 8 * * 1-5".into() });
        assert_eq!(parsed.timezone.as_deref(), Some("UTC"));

        let custom: Schedule = serde_json::from_str(
            r#"{"type":"custom","custom":{"weekDays":[1,2,3],"startTime":"08:00","endTime":"20:00","interval":"1h"}}"#,
        )
        .unwrap();
        match custom.kind {
            ScheduleKind::Custom { custom } => {
                assert_eq!(custom.week_days, vec![1, 2, 3]);
                assert_eq!(custom.start_time, "08:00");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn default_schedule_is_watcher() {
        assert_eq!(Schedule::default().kind, ScheduleKind::Watcher);
    }
}
