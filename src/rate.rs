//! Hourly rate lookup from a room's tariff.

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};

use crate::model::{Amount, Tariff, UsageCategory};

/// Production use costs 3/2 of the base rate.
pub const PRODUCTION_MARKUP: (Amount, Amount) = (3, 2);

/// Weekday hours `[start_hour, end_hour)` billed at the peak price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakBand {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for PeakBand {
    fn default() -> Self {
        Self {
            start_hour: 18,
            end_hour: 22,
        }
    }
}

impl PeakBand {
    pub fn contains(&self, time: NaiveTime) -> bool {
        let hour = time.hour();
        hour >= self.start_hour && hour < self.end_hour
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Multiply by the production markup, rounding half up.
pub fn apply_markup(price: Amount) -> Amount {
    let (num, den) = PRODUCTION_MARKUP;
    (price * num + den / 2) / den
}

/// Unit price for one hour starting at `start` on `date`.
/// Weekend wins over the time of day.
pub fn resolve_rate(
    tariff: &Tariff,
    band: &PeakBand,
    date: NaiveDate,
    start: NaiveTime,
    category: UsageCategory,
) -> Amount {
    let base = if is_weekend(date) {
        tariff.weekend
    } else if band.contains(start) {
        tariff.peak
    } else {
        tariff.off_peak
    };
    match category {
        UsageCategory::Production => apply_markup(base),
        _ => base,
    }
}
