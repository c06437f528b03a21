use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeParseError {
    #[error("expected HH:MM, got '{}'", .0)]
    Format(String),

    #[error("{}:{} is not a valid time of day", .0, .1)]
    OutOfRange(u32, u32),
}

/// UTC milliseconds since the epoch, the unit journal keys are expressed in.
pub fn utc_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn local_to_utc_millis(dt: &DateTime<Local>) -> i64 {
    dt.with_timezone(&Utc).timestamp_millis()
}

pub fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Wall-clock time of day in the local time zone, written as `HH:MM`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DailyTime {
    hour: u32,
    minute: u32,
}

impl DailyTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, TimeParseError> {
        if hour > 23 || minute > 59 {
            return Err(TimeParseError::OutOfRange(hour, minute));
        }
        Ok(DailyTime { hour, minute })
    }

    pub const fn midnight() -> Self {
        DailyTime { hour: 0, minute: 0 }
    }

    /// Time left until the next occurrence of this time of day after `now`.
    /// An occurrence exactly at `now` counts as the next day's.
    pub fn delay_after(&self, now: NaiveDateTime) -> std::time::Duration {
        let Some(time) = NaiveTime::from_hms_opt(self.hour, self.minute, 0) else {
            return std::time::Duration::ZERO;
        };
        let mut next = now.date().and_time(time);
        if next <= now {
            next += Duration::days(1);
        }
        (next - now).to_std().unwrap_or_default()
    }

    pub fn delay_from_now(&self) -> std::time::Duration {
        self.delay_after(Local::now().naive_local())
    }
}

impl Default for DailyTime {
    fn default() -> Self {
        DailyTime::midnight()
    }
}

impl FromStr for DailyTime {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((hour, minute)) = s.split_once(':') else {
            return Err(TimeParseError::Format(s.to_string()));
        };
        if hour.len() != 2 || minute.len() != 2 {
            return Err(TimeParseError::Format(s.to_string()));
        }
        let hour: u32 = hour
            .parse()
            .map_err(|_| TimeParseError::Format(s.to_string()))?;
        let minute: u32 = minute
            .parse()
            .map_err(|_| TimeParseError::Format(s.to_string()))?;
        DailyTime::new(hour, minute)
    }
}

impl TryFrom<String> for DailyTime {
    type Error = TimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DailyTime> for String {
    fn from(value: DailyTime) -> Self {
        value.to_string()
    }
}

impl Display for DailyTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn parse() {
        assert_eq!("02:30".parse::<DailyTime>(), DailyTime::new(2, 30));
        assert_eq!("00:00".parse::<DailyTime>().unwrap(), DailyTime::midnight());
        assert!(matches!(
            "2:30".parse::<DailyTime>(),
            Err(TimeParseError::Format(_))
        ));
        assert!(matches!(
            "24:00".parse::<DailyTime>(),
            Err(TimeParseError::OutOfRange(24, 0))
        ));
        assert!(matches!(
            "noon".parse::<DailyTime>(),
            Err(TimeParseError::Format(_))
        ));
    }

    #[test]
    fn delay_later_today() {
        let t = DailyTime::new(14, 0).unwrap();
        assert_eq!(t.delay_after(at(13, 30)).as_secs(), 30 * 60);
    }

    #[test]
    fn delay_rolls_over_to_tomorrow() {
        let t = DailyTime::new(1, 0).unwrap();
        assert_eq!(t.delay_after(at(23, 0)).as_secs(), 2 * 3600);
        assert_eq!(t.delay_after(at(1, 0)).as_secs(), 24 * 3600);
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let millis = utc_millis(&now);
        assert_eq!(utc_millis(&millis_to_utc(millis)), millis);
        assert_eq!(local_to_utc_millis(&now.with_timezone(&Local)), millis);
    }
}
