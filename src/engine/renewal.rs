//! Next-month projections for monthly rental series.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::Serialize;
use ulid::Ulid;

use crate::draft::RentalDraft;
use crate::message::QuoteMessage;
use crate::model::*;
use crate::quote::{compute_quote, format_dates, Quote};
use crate::recurrence::{month_of_week, to_local};

use super::{BatchOutcome, Engine, EngineError};

/// A monthly rental series carried into `target_month`, priced at today's
/// tariff. Nothing is booked until it is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenewalProjection {
    /// Recurrence group of the series being renewed.
    pub source_group: Ulid,
    pub source_month: YearMonth,
    pub target_month: YearMonth,
    pub room_id: Ulid,
    pub room_name: String,
    pub client: Client,
    pub category: UsageCategory,
    pub headcount: u32,
    pub start: NaiveTime,
    pub duration_minutes: u32,
    pub quote: Quote,
}

impl RenewalProjection {
    pub fn dates(&self) -> &[NaiveDate] {
        &self.quote.dates
    }

    pub fn total(&self) -> Amount {
        self.quote.total
    }

    pub fn notes(&self) -> String {
        format!("Renovación automática. Días: {}", format_dates(&self.quote.dates))
    }

    pub fn message(&self) -> String {
        let days = format_dates(&self.quote.dates);
        QuoteMessage {
            client_name: &self.client.name,
            month: self.target_month,
            room_name: &self.room_name,
            headcount: self.headcount,
            days: &days,
            start: self.start,
            duration_minutes: self.duration_minutes,
            total: self.quote.total,
        }
        .render()
    }

    /// The booking request that commits this projection.
    pub fn draft(&self) -> RentalDraft {
        RentalDraft {
            room_id: Some(self.room_id),
            date: self.quote.dates.first().copied(),
            start: self.start,
            duration_minutes: self.duration_minutes,
            client: self.client.clone(),
            category: self.category,
            headcount: self.headcount,
            monthly: Some(self.target_month),
            state: RentalState::Quoted,
            receipt: None,
            renewed_from: Some(self.source_group),
            notes: Some(self.notes()),
        }
    }
}

/// First occurrence of a series plus whether any occurrence is still live.
struct SeriesHead {
    first: RentalOccurrence,
    room: Room,
    live: bool,
}

impl Engine {
    /// One projection per monthly series that is still live, covers a month
    /// before `target`, and has not been renewed yet. Read-only: no conflict
    /// checks happen until [`Engine::commit_renewal`].
    pub async fn project_renewals(&self, target: YearMonth) -> Vec<RenewalProjection> {
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut heads: HashMap<Ulid, SeriesHead> = HashMap::new();
        let mut renewed: HashSet<Ulid> = HashSet::new();

        for rs in handles {
            let guard = rs.read().await;
            // Start order: the first member seen is the series head.
            for booking in &guard.bookings {
                let Booking::Rental(r) = booking else { continue };
                let live = r.state != RentalState::Cancelled;
                if live && let Some(source) = r.renewed_from {
                    renewed.insert(source);
                }
                let (Some(group), Some(_)) = (r.group, r.monthly) else {
                    continue;
                };
                heads
                    .entry(group)
                    .or_insert_with(|| SeriesHead {
                        first: r.clone(),
                        room: guard.room.clone(),
                        live: false,
                    })
                    .live |= live;
            }
        }

        let mut out: Vec<RenewalProjection> = heads
            .into_iter()
            .filter(|(group, head)| head.live && !renewed.contains(group))
            .filter_map(|(group, head)| self.project(group, head, target))
            .collect();
        out.sort_by(|a, b| {
            a.client
                .name
                .cmp(&b.client.name)
                .then(a.start.cmp(&b.start))
                .then(a.room_name.cmp(&b.room_name))
        });
        out
    }

    fn project(&self, group: Ulid, head: SeriesHead, target: YearMonth) -> Option<RenewalProjection> {
        let source_month = head.first.monthly?;
        if source_month >= target {
            return None;
        }
        let local = to_local(&self.calendar.tz, head.first.span.start);
        let starts = month_of_week(target, local.weekday(), local.time());
        let anchor = *starts.first()?;
        let dates: Vec<NaiveDate> = starts.iter().map(|s| s.date()).collect();
        let duration_minutes = u32::try_from(head.first.span.duration_ms() / 60_000).ok()?;

        let quote = compute_quote(
            &head.room.tariff,
            &self.calendar.peak,
            head.first.category,
            anchor,
            duration_minutes,
            &dates,
        );
        Some(RenewalProjection {
            source_group: group,
            source_month,
            target_month: target,
            room_id: head.room.id,
            room_name: head.room.name,
            client: head.first.client,
            category: head.first.category,
            headcount: head.first.headcount,
            start: local.time(),
            duration_minutes,
            quote,
        })
    }

    /// Book a projection as a new quoted series. Goes through the full
    /// conflict check; renewing the same series twice is rejected.
    pub async fn commit_renewal(
        &self,
        projection: &RenewalProjection,
    ) -> Result<BatchOutcome, EngineError> {
        self.schedule_rentals(&projection.draft()).await
    }
}
