//! Occurrence expansion in venue-local wall-clock time.
//!
//! All stepping is done on calendar dates, so a weekly class at 10:00 stays
//! at 10:00 across DST changes. Conversion to timeline instants happens last,
//! in [`to_instant`].

use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;

use crate::model::{Ms, YearMonth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Single,
    /// Every 7 days from the anchor up to Dec 31 of the anchor's year.
    WeeklyUntilYearEnd,
    /// Every date in `month` falling on the anchor's weekday.
    MonthOfWeek { month: YearMonth },
}

impl Recurrence {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Recurrence::Single)
    }
}

/// Ordered occurrence starts for `anchor` under `recurrence`.
pub fn expand(anchor: NaiveDateTime, recurrence: Recurrence) -> Vec<NaiveDateTime> {
    match recurrence {
        Recurrence::Single => vec![anchor],
        Recurrence::WeeklyUntilYearEnd => weekly_until_year_end(anchor),
        Recurrence::MonthOfWeek { month } => {
            month_of_week(month, anchor.date().weekday(), anchor.time())
        }
    }
}

fn weekly_until_year_end(anchor: NaiveDateTime) -> Vec<NaiveDateTime> {
    let Some(year_end) = NaiveDate::from_ymd_opt(anchor.year(), 12, 31) else {
        return vec![anchor];
    };
    let mut out = Vec::new();
    let mut date = anchor.date();
    while date <= year_end {
        out.push(date.and_time(anchor.time()));
        match date.checked_add_days(Days::new(7)) {
            Some(next) => date = next,
            None => break,
        }
    }
    out
}

/// Every date of `month` on `weekday`, at `time`.
pub fn month_of_week(month: YearMonth, weekday: Weekday, time: NaiveTime) -> Vec<NaiveDateTime> {
    month
        .days()
        .filter(|d| d.weekday() == weekday)
        .map(|d| d.and_time(time))
        .collect()
}

/// Local wall-clock time to a timeline instant.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times inside
/// a spring-forward gap are pushed forward by the length of the gap.
pub fn to_instant(tz: &Tz, local: NaiveDateTime) -> Ms {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            let before = tz
                .offset_from_utc_datetime(&(local - Duration::hours(6)))
                .fix();
            (local - Duration::seconds(i64::from(before.local_minus_utc())))
                .and_utc()
                .timestamp_millis()
        }
    }
}

/// Timeline instant to local wall-clock time.
pub fn to_local(tz: &Tz, ms: Ms) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(tz)
        .naive_local()
}
