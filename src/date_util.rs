use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

use crate::error::{Error, Result};

/// How a platform encodes its last-synced marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// Integer `YYYYMMDD`.
    Yyyymmdd,
    UnixSeconds,
    UnixMillis,
}

impl TimestampFormat {
    /// Decode a raw marker. Zero (or negative) means "never synced".
    pub fn decode(self, raw: i64) -> Option<NaiveDate> {
        if raw <= 0 {
            return None;
        }
        match self {
            TimestampFormat::Yyyymmdd => from_yyyymmdd(raw),
            TimestampFormat::UnixSeconds => DateTime::from_timestamp(raw, 0).map(|dt| dt.date_naive()),
            TimestampFormat::UnixMillis => {
                DateTime::from_timestamp_millis(raw).map(|dt| dt.date_naive())
            }
        }
    }

    /// Encode a date as a marker (midnight UTC for the unix formats).
    pub fn encode(self, date: NaiveDate) -> i64 {
        match self {
            TimestampFormat::Yyyymmdd => to_yyyymmdd(date),
            TimestampFormat::UnixSeconds => midnight_utc(date).timestamp(),
            TimestampFormat::UnixMillis => midnight_utc(date).timestamp_millis(),
        }
    }
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc()
}

pub fn to_yyyymmdd(date: NaiveDate) -> i64 {
    date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64
}

pub fn from_yyyymmdd(value: i64) -> Option<NaiveDate> {
    let year = (value / 10_000) as i32;
    let month = ((value / 100) % 100) as u32;
    let day = (value % 100) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse a `YYYYMMDD` string as given on the command line.
pub fn parse_yyyymmdd(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y%m%d")
        .map_err(|e| Error::Config(format!("invalid date '{s}', expected YYYYMMDD: {e}")))
}

pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Inclusive list of calendar days from `start` to `end`.
pub fn days_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// The most recent Sunday strictly before `date`.
pub fn previous_sunday(date: NaiveDate) -> NaiveDate {
    let back = match date.weekday() {
        Weekday::Sun => 7,
        other => other.number_from_monday() as i64,
    };
    date - Duration::days(back)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_yyyymmdd_round_trip() {
        assert_eq!(to_yyyymmdd(d(2024, 1, 9)), 20240109);
        assert_eq!(from_yyyymmdd(20240109), Some(d(2024, 1, 9)));
        assert_eq!(from_yyyymmdd(20241340), None);
    }

    #[test]
    fn test_decode_zero_is_never_synced() {
        assert_eq!(TimestampFormat::Yyyymmdd.decode(0), None);
        assert_eq!(TimestampFormat::UnixSeconds.decode(0), None);
        assert_eq!(TimestampFormat::UnixMillis.decode(0), None);
    }

    #[test]
    fn test_decode_unix_formats() {
        // 2024-01-09T12:00:00Z
        assert_eq!(TimestampFormat::UnixSeconds.decode(1_704_801_600), Some(d(2024, 1, 9)));
        assert_eq!(
            TimestampFormat::UnixMillis.decode(1_704_801_600_000),
            Some(d(2024, 1, 9))
        );
    }

    #[test]
    fn test_encode_unix_is_midnight() {
        assert_eq!(TimestampFormat::UnixSeconds.encode(d(2024, 1, 9)), 1_704_758_400);
        assert_eq!(
            TimestampFormat::UnixMillis.encode(d(2024, 1, 9)),
            1_704_758_400_000
        );
    }

    #[test]
    fn test_parse_yyyymmdd() {
        assert_eq!(parse_yyyymmdd("20240102").unwrap(), d(2024, 1, 2));
        assert!(parse_yyyymmdd("2024-01-02").is_err());
    }

    #[test]
    fn test_days_between() {
        let days = days_between(d(2024, 2, 27), d(2024, 3, 1));
        assert_eq!(days, vec![d(2024, 2, 27), d(2024, 2, 28), d(2024, 2, 29), d(2024, 3, 1)]);
        assert!(days_between(d(2024, 3, 2), d(2024, 3, 1)).is_empty());
    }

    #[test]
    fn test_previous_sunday() {
        // 2024-01-10 is a Wednesday
        assert_eq!(previous_sunday(d(2024, 1, 10)), d(2024, 1, 7));
        // Monday
        assert_eq!(previous_sunday(d(2024, 1, 8)), d(2024, 1, 7));
        // Sunday goes back a full week
        assert_eq!(previous_sunday(d(2024, 1, 14)), d(2024, 1, 7));
    }
}
