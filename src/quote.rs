use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::model::{Amount, Tariff, UsageCategory};
use crate::rate::{resolve_rate, PeakBand};

/// Price preview for a booking. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub unit_price: Amount,
    pub duration_minutes: u32,
    pub occurrence_price: Amount,
    pub total: Amount,
    pub dates: Vec<NaiveDate>,
    pub detail: String,
}

impl Quote {
    pub fn occurrences(&self) -> usize {
        self.dates.len()
    }
}

/// `unit × minutes / 60`, rounding half up.
pub fn occurrence_price(unit: Amount, duration_minutes: u32) -> Amount {
    total_price(unit, duration_minutes, 1)
}

/// `unit × minutes × count / 60`, rounded once at the end.
pub fn total_price(unit: Amount, duration_minutes: u32, count: usize) -> Amount {
    (unit * Amount::from(duration_minutes) * count as Amount + 30) / 60
}

/// `dd/MM, dd/MM, …`
pub fn format_dates(dates: &[NaiveDate]) -> String {
    dates
        .iter()
        .map(|d| d.format("%d/%m").to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Price `dates` at the rate resolved for `anchor`. Pure.
pub fn compute_quote(
    tariff: &Tariff,
    band: &PeakBand,
    category: UsageCategory,
    anchor: NaiveDateTime,
    duration_minutes: u32,
    dates: &[NaiveDate],
) -> Quote {
    let unit_price = resolve_rate(tariff, band, anchor.date(), anchor.time(), category);
    let listed = format_dates(dates);
    let detail = if dates.len() > 1 {
        format!("Mensual ({} días): {listed}", dates.len())
    } else {
        format!("Fecha única: {listed}")
    };
    Quote {
        unit_price,
        duration_minutes,
        occurrence_price: occurrence_price(unit_price, duration_minutes),
        total: total_price(unit_price, duration_minutes, dates.len()),
        dates: dates.to_vec(),
        detail,
    }
}
