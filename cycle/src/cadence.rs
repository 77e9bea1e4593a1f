//! Weekly fixed-time trigger rule.
//!
//! A cadence is written as `"<weekday> <HH:MM> [time zone]"`, for example
//! `"MON 01:00 Asia/Seoul"`. The time zone defaults to UTC. The same text is
//! what the job store persists, so two instances agree on a job's rule as
//! long as they agree on the string.

use std::fmt;
use std::str::FromStr;

use jiff::{
    Span, Timestamp,
    civil::{Time, Weekday},
    tz::TimeZone,
};

#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    #[error("expected '<weekday> <HH:MM> [time zone]', got '{0}'")]
    Malformed(String),
    #[error("unknown weekday '{0}'")]
    UnknownWeekday(String),
    #[error("invalid time of day '{0}'")]
    InvalidTime(String),
    #[error("unknown time zone '{0}'")]
    UnknownTimeZone(String, #[source] jiff::Error),
    #[error("next occurrence is out of range")]
    OutOfRange(#[source] jiff::Error),
}

/// Fires once a week at a fixed local time.
#[derive(Debug, Clone)]
pub struct Cadence {
    weekday: Weekday,
    time: Time,
    tz_name: String,
    timezone: TimeZone,
}

impl Cadence {
    pub fn weekly(
        weekday: Weekday,
        hour: i8,
        minute: i8,
        tz_name: &str,
    ) -> Result<Self, CadenceError> {
        let time = Time::new(hour, minute, 0, 0)
            .map_err(|_| CadenceError::InvalidTime(format!("{hour}:{minute}")))?;
        let (tz_name, timezone) = resolve_time_zone(tz_name)?;
        Ok(Self {
            weekday,
            time,
            tz_name,
            timezone,
        })
    }

    pub fn weekday(&self) -> Weekday {
        self.weekday
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn timezone(&self) -> &TimeZone {
        &self.timezone
    }

    /// The first occurrence strictly after `after`.
    pub fn next_after(
        &self,
        after: Timestamp,
    ) -> Result<Timestamp, CadenceError> {
        let local = after.to_zoned(self.timezone.clone()).datetime();
        let days_ahead = (self.weekday.to_monday_zero_offset()
            - local.date().weekday().to_monday_zero_offset())
        .rem_euclid(7);
        let mut date = local
            .date()
            .checked_add(Span::new().days(i64::from(days_ahead)))
            .map_err(CadenceError::OutOfRange)?;
        loop {
            let candidate = date
                .to_datetime(self.time)
                .to_zoned(self.timezone.clone())
                .map_err(CadenceError::OutOfRange)?
                .timestamp();
            if candidate > after {
                return Ok(candidate);
            }
            date = date
                .checked_add(Span::new().days(7))
                .map_err(CadenceError::OutOfRange)?;
        }
    }
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        self.weekday == other.weekday
            && self.time == other.time
            && self.tz_name == other.tz_name
    }
}

impl Eq for Cadence {}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02} {}",
            weekday_abbreviation(self.weekday),
            self.time.hour(),
            self.time.minute(),
            self.tz_name
        )
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(weekday), Some(time)) = (parts.next(), parts.next()) else {
            return Err(CadenceError::Malformed(s.to_string()));
        };
        let tz_name = parts.next().unwrap_or("UTC");
        if parts.next().is_some() {
            return Err(CadenceError::Malformed(s.to_string()));
        }

        let weekday = parse_weekday(weekday)?;
        let (hour, minute) = time
            .split_once(':')
            .and_then(|(h, m)| Some((h.parse::<i8>().ok()?, m.parse::<i8>().ok()?)))
            .ok_or_else(|| CadenceError::InvalidTime(time.to_string()))?;
        Self::weekly(weekday, hour, minute, tz_name)
    }
}

fn resolve_time_zone(name: &str) -> Result<(String, TimeZone), CadenceError> {
    if name.eq_ignore_ascii_case("UTC") {
        return Ok(("UTC".to_string(), TimeZone::UTC));
    }
    let tz = TimeZone::get(name)
        .map_err(|e| CadenceError::UnknownTimeZone(name.to_string(), e))?;
    Ok((name.to_string(), tz))
}

fn parse_weekday(s: &str) -> Result<Weekday, CadenceError> {
    let weekday = match s.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Weekday::Monday,
        "tue" | "tuesday" => Weekday::Tuesday,
        "wed" | "wednesday" => Weekday::Wednesday,
        "thu" | "thursday" => Weekday::Thursday,
        "fri" | "friday" => Weekday::Friday,
        "sat" | "saturday" => Weekday::Saturday,
        "sun" | "sunday" => Weekday::Sunday,
        _ => return Err(CadenceError::UnknownWeekday(s.to_string())),
    };
    Ok(weekday)
}

fn weekday_abbreviation(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Monday => "MON",
        Weekday::Tuesday => "TUE",
        Weekday::Wednesday => "WED",
        Weekday::Thursday => "THU",
        Weekday::Friday => "FRI",
        Weekday::Saturday => "SAT",
        Weekday::Sunday => "SUN",
    }
}
