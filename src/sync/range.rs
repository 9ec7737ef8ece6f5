use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::date_util::{days_between, previous_sunday};
use crate::error::{Error, Result};

/// Default and maximum number of days a single run looks back.
pub const MAX_LOOKBACK_DAYS: u32 = 30;

/// A date range [start, end] inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Explicit start/end overrides for a custom backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeBounds {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedRange {
    pub dates: Vec<NaiveDate>,
    /// The natural range was longer than the lookback and got truncated.
    pub exceeded: bool,
}

/// Days that still need syncing for a daily document type.
///
/// Starts the day after `last_synced` (or `max_lookback_days` ago when never
/// synced) and ends yesterday unless overridden. Ranges longer than the
/// lookback keep only the most recent days.
pub fn compute_range(
    last_synced: Option<NaiveDate>,
    today: NaiveDate,
    max_lookback_days: u32,
    bounds: RangeBounds,
) -> ComputedRange {
    let end = bounds.end.unwrap_or(today - Duration::days(1));
    let start = match (bounds.start, last_synced) {
        (Some(start), _) => start,
        (None, None) => today - Duration::days(max_lookback_days as i64),
        (None, Some(last)) => last + Duration::days(1),
    };

    if start > end {
        return ComputedRange {
            dates: vec![],
            exceeded: false,
        };
    }

    let mut dates = days_between(start, end);
    let max = max_lookback_days as usize;
    let exceeded = dates.len() > max;
    if exceeded {
        log::warn!(
            "RANGE_EXCEED: {start}..{end} spans {} days, keeping the last {max}",
            dates.len()
        );
        dates.drain(..dates.len() - max);
    }
    ComputedRange { dates, exceeded }
}

/// Document types without history are synced once, for today.
pub fn compute_snapshot(last_synced: Option<NaiveDate>, today: NaiveDate) -> Option<NaiveDate> {
    match last_synced {
        Some(last) if last >= today => None,
        _ => Some(today),
    }
}

/// Reject custom backfill windows the lookback cannot cover.
pub fn validate_custom_range(
    bounds: RangeBounds,
    today: NaiveDate,
    max_lookback_days: u32,
) -> Result<()> {
    let Some(start) = bounds.start else {
        return Ok(());
    };
    let end = bounds.end.unwrap_or(today - Duration::days(1));
    if start > end {
        return Err(Error::Config(format!(
            "custom range start {start} is after end {end}"
        )));
    }
    let span = DateRange { start, end }.days();
    if span > max_lookback_days as i64 {
        return Err(Error::Config(format!(
            "custom range {start}..{end} spans {span} days, more than the {max_lookback_days} day lookback"
        )));
    }
    Ok(())
}

/// Monday to Sunday windows for weekly backfills.
///
/// The range ends on the last Sunday before today, moved back `buffer_weeks`
/// weeks, and covers at most two weeks. Partial weeks are widened to whole
/// weeks.
pub fn weekly_windows(
    today: NaiveDate,
    buffer_weeks: u32,
    last_synced: Option<NaiveDate>,
    bounds: RangeBounds,
) -> Result<Vec<DateRange>> {
    let sunday = previous_sunday(today) - Duration::weeks(buffer_weeks as i64);
    let two_weeks_start = sunday - Duration::days(13);

    let mut end = sunday;
    let mut start = match last_synced {
        Some(last) => two_weeks_start.max(last + Duration::days(1)),
        None => two_weeks_start,
    };

    if let Some(override_end) = bounds.end {
        if override_end.weekday() != Weekday::Sun {
            return Err(Error::Config(format!("end date {override_end} is not a Sunday")));
        }
        end = override_end;
    }
    if let Some(override_start) = bounds.start {
        if override_start.weekday() != Weekday::Mon {
            return Err(Error::Config(format!("start date {override_start} is not a Monday")));
        }
        start = override_start;
    }

    let mut days = (end - start).num_days() + 1;
    if days <= 0 {
        return Ok(vec![]);
    }
    if days % 7 != 0 {
        days += 7 - days % 7;
    }

    let weeks = days / 7;
    Ok((0..weeks)
        .rev()
        .map(|i| {
            let week_end = end - Duration::weeks(i);
            DateRange {
                start: week_end - Duration::days(6),
                end: week_end,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_incremental_from_last_sync() {
        let range = compute_range(Some(d(2024, 1, 1)), d(2024, 1, 10), 30, RangeBounds::default());
        assert_eq!(range.dates.len(), 8);
        assert_eq!(range.dates[0], d(2024, 1, 2));
        assert_eq!(range.dates[7], d(2024, 1, 9));
        assert!(!range.exceeded);
    }

    #[test]
    fn test_never_synced_starts_at_lookback() {
        let range = compute_range(None, d(2024, 3, 1), 30, RangeBounds::default());
        assert_eq!(range.dates.first(), Some(&d(2024, 1, 31)));
        assert_eq!(range.dates.last(), Some(&d(2024, 2, 29)));
        assert_eq!(range.dates.len(), 30);
    }

    #[test]
    fn test_long_gap_is_truncated_to_most_recent() {
        let range = compute_range(Some(d(2023, 6, 1)), d(2024, 1, 10), 30, RangeBounds::default());
        assert!(range.exceeded);
        assert_eq!(range.dates.len(), 30);
        assert_eq!(range.dates.last(), Some(&d(2024, 1, 9)));
        assert_eq!(range.dates.first(), Some(&d(2023, 12, 11)));
    }

    #[test]
    fn test_already_synced_is_empty() {
        let range = compute_range(Some(d(2024, 1, 9)), d(2024, 1, 10), 30, RangeBounds::default());
        assert!(range.dates.is_empty());
        assert!(!range.exceeded);
    }

    #[test]
    fn test_contiguous_and_ascending() {
        for last in [None, Some(d(2023, 1, 1)), Some(d(2024, 1, 3))] {
            let range = compute_range(last, d(2024, 1, 10), 30, RangeBounds::default());
            assert!(range.dates.len() <= 30);
            for pair in range.dates.windows(2) {
                assert_eq!(pair[1] - pair[0], Duration::days(1));
            }
        }
    }

    #[test]
    fn test_bounds_override() {
        let bounds = RangeBounds {
            start: Some(d(2024, 1, 3)),
            end: Some(d(2024, 1, 5)),
        };
        let range = compute_range(Some(d(2024, 1, 8)), d(2024, 1, 10), 30, bounds);
        assert_eq!(range.dates, vec![d(2024, 1, 3), d(2024, 1, 4), d(2024, 1, 5)]);
    }

    #[test]
    fn test_snapshot() {
        assert_eq!(compute_snapshot(None, d(2024, 1, 10)), Some(d(2024, 1, 10)));
        assert_eq!(compute_snapshot(Some(d(2024, 1, 9)), d(2024, 1, 10)), Some(d(2024, 1, 10)));
        assert_eq!(compute_snapshot(Some(d(2024, 1, 10)), d(2024, 1, 10)), None);
    }

    #[test]
    fn test_validate_custom_range() {
        let today = d(2024, 3, 1);
        let ok = RangeBounds {
            start: Some(d(2024, 2, 1)),
            end: Some(d(2024, 2, 29)),
        };
        assert!(validate_custom_range(ok, today, 30).is_ok());

        let too_long = RangeBounds {
            start: Some(d(2024, 1, 1)),
            end: Some(d(2024, 2, 29)),
        };
        assert!(validate_custom_range(too_long, today, 30).is_err());

        let inverted = RangeBounds {
            start: Some(d(2024, 2, 10)),
            end: Some(d(2024, 2, 1)),
        };
        assert!(validate_custom_range(inverted, today, 30).is_err());
        assert!(validate_custom_range(RangeBounds::default(), today, 30).is_ok());
    }

    #[test]
    fn test_weekly_windows_never_synced() {
        // Wednesday; previous Sunday is 2024-01-07
        let windows = weekly_windows(d(2024, 1, 10), 0, None, RangeBounds::default()).unwrap();
        assert_eq!(
            windows,
            vec![
                DateRange { start: d(2023, 12, 25), end: d(2023, 12, 31) },
                DateRange { start: d(2024, 1, 1), end: d(2024, 1, 7) },
            ]
        );
    }

    #[test]
    fn test_weekly_windows_with_buffer() {
        let windows = weekly_windows(d(2024, 1, 10), 2, None, RangeBounds::default()).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].end, d(2023, 12, 24));
        assert_eq!(windows[0].start, d(2023, 12, 11));
    }

    #[test]
    fn test_weekly_windows_partial_week_widened() {
        // Last synced Wednesday 2024-01-03, so only part of the final week is missing
        let windows =
            weekly_windows(d(2024, 1, 10), 0, Some(d(2024, 1, 3)), RangeBounds::default()).unwrap();
        assert_eq!(windows, vec![DateRange { start: d(2024, 1, 1), end: d(2024, 1, 7) }]);
    }

    #[test]
    fn test_weekly_windows_up_to_date() {
        let windows =
            weekly_windows(d(2024, 1, 10), 0, Some(d(2024, 1, 7)), RangeBounds::default()).unwrap();
        assert!(windows.is_empty());
    }

    #[test]
    fn test_weekly_windows_override_weekday_checks() {
        let bad_end = RangeBounds {
            start: None,
            end: Some(d(2024, 1, 6)),
        };
        assert!(weekly_windows(d(2024, 1, 10), 0, None, bad_end).is_err());

        let bad_start = RangeBounds {
            start: Some(d(2024, 1, 2)),
            end: None,
        };
        assert!(weekly_windows(d(2024, 1, 10), 0, None, bad_start).is_err());
    }
}
