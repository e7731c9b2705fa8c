// src/core/schedule_time.rs — Next-run computation for scheduled tasks
//
// Timing is interpreted in the task's timezone (UTC, a fixed offset or an IANA
// zone name) and the result is returned in UTC. `cron` is the simplified form:
// hourly at `minute`.
//
// Around daylight-saving changes a repeated local time resolves to its first
// occurrence, and a skipped one is read with the offset in force before the
// jump, so 02:30 on a spring-forward night runs at 03:30.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, Offset,
    TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::infra::errors::{Result, SpendGuardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Daily,
    Weekly,
    Monthly,
    Cron,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Once => "once",
            ScheduleType::Daily => "daily",
            ScheduleType::Weekly => "weekly",
            ScheduleType::Monthly => "monthly",
            ScheduleType::Cron => "cron",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = SpendGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "once" => Ok(ScheduleType::Once),
            "daily" => Ok(ScheduleType::Daily),
            "weekly" => Ok(ScheduleType::Weekly),
            "monthly" => Ok(ScheduleType::Monthly),
            "cron" | "hourly" => Ok(ScheduleType::Cron),
            other => Err(SpendGuardError::InvalidSchedule(format!(
                "unknown schedule type '{other}'"
            ))),
        }
    }
}

/// When a task fires. `day_of_week` is 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleTiming {
    pub hour: u32,
    pub minute: u32,
    pub day_of_week: Option<u32>,
    pub day_of_month: Option<u32>,
    pub timezone: String,
}

impl Default for ScheduleTiming {
    fn default() -> Self {
        Self {
            hour: 0,
            minute: 0,
            day_of_week: None,
            day_of_month: None,
            timezone: "UTC".into(),
        }
    }
}

impl ScheduleTiming {
    pub fn at(hour: u32, minute: u32) -> Self {
        Self {
            hour,
            minute,
            ..Default::default()
        }
    }

    pub fn on_weekday(mut self, day_of_week: u32) -> Self {
        self.day_of_week = Some(day_of_week);
        self
    }

    pub fn on_day(mut self, day_of_month: u32) -> Self {
        self.day_of_month = Some(day_of_month);
        self
    }

    pub fn in_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    /// Reject timings that can never produce a run.
    pub fn validate(&self, schedule_type: ScheduleType) -> Result<()> {
        if self.hour > 23 {
            return Err(invalid(format!("hour {} out of range 0-23", self.hour)));
        }
        if self.minute > 59 {
            return Err(invalid(format!("minute {} out of range 0-59", self.minute)));
        }
        parse_timezone(&self.timezone)?;
        match schedule_type {
            ScheduleType::Weekly => match self.day_of_week {
                Some(d) if d <= 6 => {}
                Some(d) => return Err(invalid(format!("day_of_week {d} out of range 0-6"))),
                None => return Err(invalid("weekly schedule needs day_of_week")),
            },
            ScheduleType::Monthly => match self.day_of_month {
                Some(d) if (1..=31).contains(&d) => {}
                Some(d) => return Err(invalid(format!("day_of_month {d} out of range 1-31"))),
                None => return Err(invalid("monthly schedule needs day_of_month")),
            },
            _ => {}
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> SpendGuardError {
    SpendGuardError::InvalidSchedule(msg.into())
}

/// Zone a schedule's wall-clock times are read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl ScheduleZone {
    fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        match self {
            ScheduleZone::Fixed(offset) => now.with_timezone(offset).naive_local(),
            ScheduleZone::Named(tz) => now.with_timezone(tz).naive_local(),
        }
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self {
            ScheduleZone::Fixed(offset) => resolve_local(offset, local),
            ScheduleZone::Named(tz) => resolve_local(tz, local),
        }
    }

    /// `at` rendered in this zone, for display.
    pub fn format_local(&self, at: DateTime<Utc>) -> String {
        match self {
            ScheduleZone::Fixed(offset) => at.with_timezone(offset).to_string(),
            ScheduleZone::Named(tz) => at.with_timezone(tz).to_string(),
        }
    }
}

fn resolve_local<Z: TimeZone>(zone: &Z, local: NaiveDateTime) -> DateTime<Utc> {
    match zone.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let before = zone
                .offset_from_utc_datetime(&(local - Duration::days(1)))
                .fix();
            let utc = local - Duration::seconds(before.local_minus_utc() as i64);
            Utc.from_utc_datetime(&utc)
        }
    }
}

/// Parse `UTC`, `Z`, `+HH:MM`, `-HH:MM` (optionally prefixed with `UTC`), or
/// an IANA name such as `America/New_York`.
pub fn parse_timezone(tz: &str) -> Result<ScheduleZone> {
    let tz = tz.trim();
    if tz.contains('/') {
        return tz
            .parse::<Tz>()
            .map(ScheduleZone::Named)
            .map_err(|_| invalid(format!("unknown timezone '{tz}'")));
    }
    parse_offset(tz).map(ScheduleZone::Fixed)
}

fn parse_offset(tz: &str) -> Result<FixedOffset> {
    let upper = tz.to_uppercase();
    let rest = upper.strip_prefix("UTC").unwrap_or(&upper);
    if rest.is_empty() || rest == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| invalid("bad utc offset"));
    }

    let (sign, body) = match rest.split_at(1) {
        ("+", body) => (1, body),
        ("-", body) => (-1, body),
        _ => return Err(invalid(format!("unsupported timezone '{tz}'"))),
    };
    let (h, m) = body.split_once(':').unwrap_or((body, "0"));
    let hours: i32 = h
        .parse()
        .map_err(|_| invalid(format!("unsupported timezone '{tz}'")))?;
    let minutes: i32 = m
        .parse()
        .map_err(|_| invalid(format!("unsupported timezone '{tz}'")))?;
    if hours > 14 || minutes > 59 {
        return Err(invalid(format!("timezone offset '{tz}' out of range")));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| invalid(format!("timezone offset '{tz}' out of range")))
}

/// First run strictly after `now`.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    timing: &ScheduleTiming,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    timing.validate(schedule_type)?;
    let zone = parse_timezone(&timing.timezone)?;
    let local_now = zone.local(now);
    let today = local_now.date();

    let next = match schedule_type {
        ScheduleType::Once | ScheduleType::Daily => {
            let candidate = at_time(today, timing)?;
            if candidate <= local_now {
                candidate + Duration::days(1)
            } else {
                candidate
            }
        }
        ScheduleType::Weekly => {
            let target = timing.day_of_week.unwrap_or(0) as i64;
            let current = today.weekday().num_days_from_sunday() as i64;
            let ahead = (target - current).rem_euclid(7);
            let candidate = at_time(today + Duration::days(ahead), timing)?;
            if candidate <= local_now {
                candidate + Duration::days(7)
            } else {
                candidate
            }
        }
        ScheduleType::Monthly => {
            let dom = timing.day_of_month.unwrap_or(1);
            let candidate = at_time(clamped_day(today.year(), today.month(), dom)?, timing)?;
            if candidate <= local_now {
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                at_time(clamped_day(year, month, dom)?, timing)?
            } else {
                candidate
            }
        }
        ScheduleType::Cron => {
            let this_hour = today
                .and_hms_opt(local_now.hour(), timing.minute, 0)
                .ok_or_else(|| invalid("bad minute"))?;
            if this_hour <= local_now {
                this_hour + Duration::hours(1)
            } else {
                this_hour
            }
        }
    };

    Ok(zone.to_utc(next))
}

fn at_time(date: NaiveDate, timing: &ScheduleTiming) -> Result<NaiveDateTime> {
    date.and_hms_opt(timing.hour, timing.minute, 0)
        .ok_or_else(|| invalid(format!("bad time {:02}:{:02}", timing.hour, timing.minute)))
}

/// `day` in the given month, clamped to the month's last day.
fn clamped_day(year: i32, month: u32, day: u32) -> Result<NaiveDate> {
    let last = last_day_of_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, last))
        .ok_or_else(|| invalid(format!("bad date {year}-{month}-{day}")))
}

fn last_day_of_month(year: i32, month: u32) -> Result<u32> {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|first| first.pred_opt())
        .map(|d| d.day())
        .ok_or_else(|| invalid(format!("bad month {year}-{month}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_later_today() {
        let now = utc(2025, 1, 15, 8, 0);
        let next = compute_next_run(ScheduleType::Daily, &ScheduleTiming::at(9, 30), now).unwrap();
        assert_eq!(next, utc(2025, 1, 15, 9, 30));
    }

    #[test]
    fn test_daily_rolls_to_tomorrow() {
        let now = utc(2025, 1, 15, 9, 30);
        let next = compute_next_run(ScheduleType::Once, &ScheduleTiming::at(9, 30), now).unwrap();
        assert_eq!(next, utc(2025, 1, 16, 9, 30));
    }

    #[test]
    fn test_weekly_monday() {
        // 2025-01-15 is a Wednesday
        let now = utc(2025, 1, 15, 12, 0);
        let timing = ScheduleTiming::at(6, 0).on_weekday(1);
        let next = compute_next_run(ScheduleType::Weekly, &timing, now).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next, utc(2025, 1, 20, 6, 0));
    }

    #[test]
    fn test_weekly_same_day_passed_rolls_a_week() {
        // 2025-01-20 is a Monday
        let now = utc(2025, 1, 20, 7, 0);
        let timing = ScheduleTiming::at(6, 0).on_weekday(1);
        let next = compute_next_run(ScheduleType::Weekly, &timing, now).unwrap();
        assert_eq!(next, utc(2025, 1, 27, 6, 0));
    }

    #[test]
    fn test_monthly_rolls_and_clamps() {
        let now = utc(2025, 1, 31, 12, 0);
        let timing = ScheduleTiming::at(0, 0).on_day(31);
        let next = compute_next_run(ScheduleType::Monthly, &timing, now).unwrap();
        assert_eq!(next, utc(2025, 2, 28, 0, 0));
    }

    #[test]
    fn test_monthly_december_wraps_year() {
        let now = utc(2025, 12, 2, 0, 0);
        let timing = ScheduleTiming::at(0, 0).on_day(1);
        let next = compute_next_run(ScheduleType::Monthly, &timing, now).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 0, 0));
    }

    #[test]
    fn test_cron_is_hourly_at_minute() {
        let now = utc(2025, 1, 15, 10, 20);
        let timing = ScheduleTiming::at(0, 15);
        let next = compute_next_run(ScheduleType::Cron, &timing, now).unwrap();
        assert_eq!(next, utc(2025, 1, 15, 11, 15));
        let next = compute_next_run(ScheduleType::Cron, &ScheduleTiming::at(0, 45), now).unwrap();
        assert_eq!(next, utc(2025, 1, 15, 10, 45));
    }

    #[test]
    fn test_fixed_offset_timezone() {
        // 09:00 at +05:30 is 03:30 UTC
        let now = utc(2025, 1, 15, 0, 0);
        let timing = ScheduleTiming::at(9, 0).in_timezone("+05:30");
        let next = compute_next_run(ScheduleType::Daily, &timing, now).unwrap();
        assert_eq!(next, utc(2025, 1, 15, 3, 30));
    }

    #[test]
    fn test_negative_offset_crosses_date() {
        // 23:00 UTC on the 15th is 18:00 on the 15th at -05:00
        let now = utc(2025, 1, 15, 23, 0);
        let timing = ScheduleTiming::at(20, 0).in_timezone("UTC-05:00");
        let next = compute_next_run(ScheduleType::Daily, &timing, now).unwrap();
        assert_eq!(next, utc(2025, 1, 16, 1, 0));
    }

    #[test]
    fn test_validation_errors() {
        let now = utc(2025, 1, 15, 0, 0);
        assert!(compute_next_run(ScheduleType::Daily, &ScheduleTiming::at(24, 0), now).is_err());
        assert!(compute_next_run(ScheduleType::Weekly, &ScheduleTiming::at(1, 0), now).is_err());
        assert!(compute_next_run(
            ScheduleType::Monthly,
            &ScheduleTiming::at(1, 0).on_day(0),
            now
        )
        .is_err());
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("EST5").is_err());
        assert!(parse_timezone("+15:00").is_err());
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        let timing = ScheduleTiming::at(9, 0).in_timezone("America/New_York");
        // 10:00 EST on the 8th; clocks spring forward early on the 9th
        let next = compute_next_run(ScheduleType::Daily, &timing, utc(2025, 3, 8, 15, 0)).unwrap();
        assert_eq!(next, utc(2025, 3, 9, 13, 0));
        let winter = compute_next_run(ScheduleType::Daily, &timing, utc(2025, 1, 15, 0, 0)).unwrap();
        assert_eq!(winter, utc(2025, 1, 15, 14, 0));
    }

    #[test]
    fn test_skipped_local_time_runs_after_the_jump() {
        // 02:30 does not exist in New York on 2025-03-09
        let timing = ScheduleTiming::at(2, 30).in_timezone("America/New_York");
        let next = compute_next_run(ScheduleType::Daily, &timing, utc(2025, 3, 9, 5, 0)).unwrap();
        assert_eq!(next, utc(2025, 3, 9, 7, 30));
    }

    #[test]
    fn test_repeated_local_time_takes_first_occurrence() {
        // 01:30 happens twice in New York on 2025-11-02: EDT first, then EST
        let timing = ScheduleTiming::at(1, 30).in_timezone("America/New_York");
        let next = compute_next_run(ScheduleType::Daily, &timing, utc(2025, 11, 2, 4, 0)).unwrap();
        assert_eq!(next, utc(2025, 11, 2, 5, 30));
    }

    #[test]
    fn test_parse_timezone_forms() {
        assert_eq!(
            parse_timezone("Europe/Berlin").unwrap(),
            ScheduleZone::Named(chrono_tz::Europe::Berlin)
        );
        assert_eq!(
            parse_timezone("utc+02:00").unwrap(),
            ScheduleZone::Fixed(FixedOffset::east_opt(7200).unwrap())
        );
    }

    #[test]
    fn test_parse_schedule_type() {
        assert_eq!("Weekly".parse::<ScheduleType>().unwrap(), ScheduleType::Weekly);
        assert!("yearly".parse::<ScheduleType>().is_err());
    }
}
