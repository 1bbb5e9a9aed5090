use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use ulid::Ulid;

use crate::draft::RentalDraft;
use crate::message::QuoteMessage;
use crate::model::*;
use crate::quote::{compute_quote, format_dates, Quote};
use crate::rate;
use crate::recurrence::expand;

use super::conflict::{find_conflict, validate_span, ConflictDescription};
use super::{Engine, EngineError};

/// What an agenda row shows in its badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgendaKind {
    Class(ClassKind),
    Rental(UsageCategory),
}

/// One row of the day view, across all rooms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgendaEntry {
    pub booking_id: Ulid,
    pub room_id: Ulid,
    pub room_name: String,
    pub venue_name: Option<String>,
    pub kind: AgendaKind,
    /// Class name or client name.
    pub title: String,
    pub span: Span,
    pub group: Option<Ulid>,
}

impl Engine {
    pub async fn room(&self, id: Ulid) -> Option<Room> {
        let rs = self.get_room(&id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    /// All rooms, sorted by name.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(handles.len());
        for rs in handles {
            rooms.push(rs.read().await.room.clone());
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rooms
    }

    pub fn list_venues(&self) -> Vec<Venue> {
        let mut venues: Vec<Venue> = self.venues.iter().map(|e| e.value().clone()).collect();
        venues.sort_by(|a, b| a.name.cmp(&b.name));
        venues
    }

    pub async fn rooms_of_venue(&self, venue_id: Ulid) -> Result<Vec<Room>, EngineError> {
        if !self.venues.contains_key(&venue_id) {
            return Err(EngineError::NotFound(venue_id));
        }
        let ids: Vec<Ulid> = self
            .venue_rooms
            .get(&venue_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(room) = self.room(id).await {
                rooms.push(room);
            }
        }
        Ok(rooms)
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let room_id = *self.booking_to_room.get(&id)?.value();
        let rs = self.get_room(&room_id)?;
        let guard = rs.read().await;
        guard.booking(id).cloned()
    }

    /// Every booking of a room overlapping `window`, in start order.
    pub async fn room_bookings(&self, room_id: Ulid, window: Span) -> Result<Vec<Booking>, EngineError> {
        validate_span(&window)?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.overlapping(&window).cloned().collect())
    }

    /// Every occurrence sharing `group`, in start order.
    pub async fn series(&self, group: Ulid) -> Result<Vec<Booking>, EngineError> {
        let room_id = self
            .series_to_room
            .get(&group)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(group))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| b.group() == Some(group))
            .cloned()
            .collect())
    }

    /// Rentals across rooms, optionally in one state, by start time.
    pub async fn rentals(&self, state: Option<RentalState>) -> Vec<RentalOccurrence> {
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter_map(|b| match b {
                Booking::Rental(r) if state.is_none_or(|s| s == r.state) => Some(r.clone()),
                _ => None,
            }));
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// Active classes and committed rentals of every room overlapping `window`.
    pub async fn agenda(&self, window: Span) -> Result<Vec<AgendaEntry>, EngineError> {
        validate_span(&window)?;
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            let room = &guard.room;
            let venue_name = self.venues.get(&room.venue_id).map(|v| v.name.clone());
            for booking in guard.overlapping(&window) {
                let kind = match booking {
                    Booking::Class(c) if c.state == ClassState::Active => AgendaKind::Class(c.kind),
                    Booking::Rental(r) if r.state.is_committed() => {
                        AgendaKind::Rental(r.category)
                    }
                    _ => continue,
                };
                out.push(AgendaEntry {
                    booking_id: booking.id(),
                    room_id: room.id,
                    room_name: room.name.clone(),
                    venue_name: venue_name.clone(),
                    kind,
                    title: booking.label().to_string(),
                    span: booking.span(),
                    group: booking.group(),
                });
            }
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then_with(|| a.room_name.cmp(&b.room_name)));
        Ok(out)
    }

    /// First committed booking `span` would collide with, if any.
    pub async fn has_conflict(
        &self,
        room_id: Ulid,
        span: Span,
    ) -> Result<Option<ConflictDescription>, EngineError> {
        validate_span(&span)?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(find_conflict(&guard, &span, None))
    }

    /// Hourly unit price for a start in a room. An unknown room is an error,
    /// never a zero price.
    pub async fn resolve_rate(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        category: UsageCategory,
    ) -> Result<Amount, EngineError> {
        let room = self.room(room_id).await.ok_or(EngineError::NotFound(room_id))?;
        Ok(rate::resolve_rate(&room.tariff, &self.calendar.peak, date, start, category))
    }

    /// Price a rental draft without booking it. Reads nothing but the tariff.
    pub async fn quote_rental(&self, draft: &RentalDraft) -> Result<Quote, EngineError> {
        let slot = draft.slot()?;
        let room = self.room(slot.room_id).await.ok_or(EngineError::NotFound(slot.room_id))?;
        let dates: Vec<NaiveDate> = expand(slot.anchor, draft.recurrence())
            .into_iter()
            .map(|d| d.date())
            .collect();
        Ok(compute_quote(
            &room.tariff,
            &self.calendar.peak,
            draft.category,
            slot.anchor,
            slot.duration_minutes,
            &dates,
        ))
    }

    /// The chat message for a rental draft's quote.
    pub async fn quote_message(&self, draft: &RentalDraft) -> Result<String, EngineError> {
        let slot = draft.slot()?;
        let quote = self.quote_rental(draft).await?;
        let room = self.room(slot.room_id).await.ok_or(EngineError::NotFound(slot.room_id))?;
        let days = format_dates(&quote.dates);
        Ok(QuoteMessage {
            client_name: &draft.client.name,
            month: draft.monthly.unwrap_or(YearMonth::of(slot.anchor.date())),
            room_name: &room.name,
            headcount: draft.headcount,
            days: &days,
            start: slot.anchor.time(),
            duration_minutes: slot.duration_minutes,
            total: quote.total,
        }
        .render())
    }
}
