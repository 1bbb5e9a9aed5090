use std::time::Instant;

use chrono::NaiveDateTime;
use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::blob::Attachment;
use crate::draft::{ClassDraft, RentalDraft, Slot};
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, kind_label, rejection_label};
use crate::quote::{compute_quote, Quote};
use crate::recurrence::{expand, to_instant, to_local, Recurrence};

use super::conflict::{find_conflict, validate_span};
use super::error::ConflictError;
use super::{Engine, EngineError, ValidationError, WalCommand};

/// Result of one successful batch write.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub created: usize,
    /// Shared by every occurrence when the batch is recurring.
    pub group: Option<Ulid>,
    pub ids: Vec<Ulid>,
    /// Pricing used for rentals.
    pub quote: Option<Quote>,
}

/// One candidate occurrence: local start and timeline span.
type Candidate = (NaiveDateTime, Span);

impl Engine {
    pub async fn create_venue(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("venue name too long"));
        }
        if self.venues.len() >= MAX_VENUES {
            return Err(EngineError::LimitExceeded("too many venues"));
        }
        if self.venues.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let _wal = self.wal_gate.read().await;
        let event = Event::VenueCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.venues.insert(id, Venue { id, name });
        Ok(())
    }

    pub async fn create_room(&self, room: Room) -> Result<(), EngineError> {
        if room.name.trim().is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if room.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        check_tariff(&room.tariff)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }
        if !self.venues.contains_key(&room.venue_id) {
            return Err(EngineError::NotFound(room.venue_id));
        }

        let _wal = self.wal_gate.read().await;
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        info!(room = %room.id, name = %room.name, "room created");
        self.insert_room(room);
        metrics::gauge!(observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        Ok(())
    }

    /// New prices apply to future quotes only; stored occurrence prices stay.
    pub async fn update_tariff(&self, room_id: Ulid, tariff: Tariff) -> Result<(), EngineError> {
        check_tariff(&tariff)?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let _wal = self.wal_gate.read().await;
        let mut guard = rs.write().await;
        let event = Event::TariffUpdated { room_id, tariff };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let _wal = self.wal_gate.read().await;
        let guard = rs.write().await;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }
        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        drop(guard);
        self.remove_room(&id);
        metrics::gauge!(observability::ROOMS_ACTIVE).set(self.rooms.len() as f64);
        Ok(())
    }

    /// Expand a slot into candidate spans, validating each.
    fn candidates(&self, slot: &Slot, recurrence: Recurrence) -> Result<Vec<Candidate>, EngineError> {
        let duration = chrono::Duration::minutes(i64::from(slot.duration_minutes));
        let starts = expand(slot.anchor, recurrence);
        if starts.is_empty() {
            return Err(ValidationError::NoOccurrences.into());
        }
        if starts.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        starts
            .into_iter()
            .map(|local| -> Result<Candidate, EngineError> {
                let span = Span {
                    start: to_instant(&self.calendar.tz, local),
                    end: to_instant(&self.calendar.tz, local + duration),
                };
                validate_span(&span)?;
                Ok((local, span))
            })
            .collect()
    }

    /// Every candidate against the room's committed bookings. First hit wins.
    fn check_candidates(rs: &RoomState, candidates: &[Candidate]) -> Result<(), EngineError> {
        if rs.bookings.len() + candidates.len() > MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        for (local, span) in candidates {
            if let Some(existing) = find_conflict(rs, span, None) {
                return Err(EngineError::Conflict(ConflictError {
                    date: local.date(),
                    existing,
                }));
            }
        }
        Ok(())
    }

    async fn upload(&self, attachment: Option<&Attachment>) -> Result<Option<String>, EngineError> {
        let Some(attachment) = attachment else {
            return Ok(None);
        };
        if attachment.bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(EngineError::LimitExceeded("attachment too large"));
        }
        self.blobs
            .put(attachment)
            .await
            .map(Some)
            .map_err(|e| EngineError::Storage(format!("upload failed: {e}")))
    }

    /// Book a class, or a weekly series through year end. All-or-nothing:
    /// one conflicting date rejects every date.
    pub async fn schedule_classes(&self, draft: &ClassDraft) -> Result<BatchOutcome, EngineError> {
        let started = Instant::now();
        let result = self.schedule_classes_inner(draft).await;
        record_batch(BookingKind::Class, started, &result);
        result
    }

    async fn schedule_classes_inner(&self, draft: &ClassDraft) -> Result<BatchOutcome, EngineError> {
        let (slot, teacher_id) = draft.validate()?;
        let candidates = self.candidates(&slot, draft.recurrence())?;
        let rs = self.get_room(&slot.room_id).ok_or(EngineError::NotFound(slot.room_id))?;

        // Held from the conflict check through the WAL write.
        let _wal = self.wal_gate.read().await;
        let mut guard = rs.write().await;
        Self::check_candidates(&guard, &candidates)?;
        let image = self.upload(draft.image.as_ref()).await?;

        let group = draft.recurrence().is_recurring().then(Ulid::new);
        let occurrences: Vec<ClassOccurrence> = candidates
            .iter()
            .map(|(_, span)| ClassOccurrence {
                id: Ulid::new(),
                room_id: slot.room_id,
                group,
                span: *span,
                name: draft.name.trim().to_string(),
                description: draft.description.clone(),
                kind: draft.kind,
                level: draft.level.clone(),
                teacher_id,
                agreement: draft.agreement,
                capacity: draft.capacity,
                image: image.clone(),
                state: ClassState::Active,
            })
            .collect();
        let ids: Vec<Ulid> = occurrences.iter().map(|o| o.id).collect();

        let event = Event::ClassesScheduled {
            room_id: slot.room_id,
            occurrences,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        info!(room = %slot.room_id, name = %draft.name, created = ids.len(), "classes scheduled");
        Ok(BatchOutcome {
            created: ids.len(),
            group,
            ids,
            quote: None,
        })
    }

    /// Book a rental, or every matching weekday of a month. Priced once at
    /// the anchor's rate; each occurrence stores that price.
    pub async fn schedule_rentals(&self, draft: &RentalDraft) -> Result<BatchOutcome, EngineError> {
        let started = Instant::now();
        let result = self.schedule_rentals_inner(draft).await;
        record_batch(BookingKind::Rental, started, &result);
        result
    }

    async fn schedule_rentals_inner(&self, draft: &RentalDraft) -> Result<BatchOutcome, EngineError> {
        let slot = draft.validate()?;
        if let Some(notes) = &draft.notes
            && notes.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        // A renewal stays in its source series' room.
        if let Some(source) = draft.renewed_from
            && self.series_to_room.get(&source).map(|e| *e.value()) != Some(slot.room_id)
        {
            return Err(EngineError::NotFound(source));
        }
        let candidates = self.candidates(&slot, draft.recurrence())?;
        let rs = self.get_room(&slot.room_id).ok_or(EngineError::NotFound(slot.room_id))?;

        let _wal = self.wal_gate.read().await;
        let mut guard = rs.write().await;
        if let Some(source) = draft.renewed_from
            && is_renewed(&guard, source)
        {
            return Err(EngineError::AlreadyExists(source));
        }
        Self::check_candidates(&guard, &candidates)?;

        let dates: Vec<_> = candidates.iter().map(|(local, _)| local.date()).collect();
        let quote = compute_quote(
            &guard.room.tariff,
            &self.calendar.peak,
            draft.category,
            slot.anchor,
            slot.duration_minutes,
            &dates,
        );
        let receipt = self.upload(draft.receipt.as_ref()).await?;

        let group = draft.recurrence().is_recurring().then(Ulid::new);
        let notes = draft.notes.clone().unwrap_or_else(|| quote.detail.clone());
        let occurrences: Vec<RentalOccurrence> = candidates
            .iter()
            .map(|(_, span)| RentalOccurrence {
                id: Ulid::new(),
                room_id: slot.room_id,
                group,
                span: *span,
                client: draft.client.clone(),
                category: draft.category,
                headcount: draft.headcount,
                price: quote.occurrence_price,
                state: draft.state,
                monthly: draft.monthly,
                renewed_from: draft.renewed_from,
                receipt: receipt.clone(),
                notes: notes.clone(),
            })
            .collect();
        let ids: Vec<Ulid> = occurrences.iter().map(|o| o.id).collect();

        let event = Event::RentalsScheduled {
            room_id: slot.room_id,
            occurrences,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        info!(
            room = %slot.room_id,
            client = %draft.client.name,
            state = %draft.state,
            created = ids.len(),
            total = quote.total,
            "rentals scheduled"
        );
        Ok(BatchOutcome {
            created: ids.len(),
            group,
            ids,
            quote: Some(quote),
        })
    }

    /// Move one rental along its lifecycle. Entering a committed state
    /// re-checks the room, since a quote never held the slot.
    pub async fn set_rental_state(&self, id: Ulid, to: RentalState) -> Result<(), EngineError> {
        let _wal = self.wal_gate.read().await;
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let Some(Booking::Rental(rental)) = guard.booking(id) else {
            return Err(EngineError::NotFound(id));
        };
        let (from, span) = (rental.state, rental.span);
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        if to.is_committed() && !from.is_committed() {
            self.recheck(&guard, id, span)?;
        }

        let event = Event::RentalStateChanged {
            ids: vec![id],
            room_id,
            state: to,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::STATE_CHANGES_TOTAL, "to" => to.to_string()).increment(1);
        info!(rental = %id, %from, %to, "rental state changed");
        Ok(())
    }

    /// Move every live occurrence of a rental series together. Cancelled
    /// occurrences are left alone; any other member that cannot move
    /// rejects the whole series.
    pub async fn set_rental_series_state(
        &self,
        group: Ulid,
        to: RentalState,
    ) -> Result<usize, EngineError> {
        let _wal = self.wal_gate.read().await;
        let (room_id, mut guard) = self.resolve_series_write(&group).await?;
        let members: Vec<(Ulid, RentalState, Span)> = guard
            .bookings
            .iter()
            .filter_map(|b| match b {
                Booking::Rental(r) if r.group == Some(group) && r.state != RentalState::Cancelled => {
                    Some((r.id, r.state, r.span))
                }
                _ => None,
            })
            .collect();
        if members.is_empty() {
            return Err(EngineError::NotFound(group));
        }
        for &(id, from, span) in &members {
            if !from.can_transition_to(to) {
                return Err(EngineError::InvalidTransition { id, from, to });
            }
            if to.is_committed() && !from.is_committed() {
                self.recheck(&guard, id, span)?;
            }
        }

        let ids: Vec<Ulid> = members.into_iter().map(|(id, _, _)| id).collect();
        let count = ids.len();
        let event = Event::RentalStateChanged { ids, room_id, state: to };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::STATE_CHANGES_TOTAL, "to" => to.to_string())
            .increment(count as u64);
        info!(series = %group, %to, count, "rental series state changed");
        Ok(count)
    }

    fn recheck(&self, rs: &RoomState, id: Ulid, span: Span) -> Result<(), EngineError> {
        match find_conflict(rs, &span, Some(id)) {
            Some(existing) => Err(EngineError::Conflict(ConflictError {
                date: to_local(&self.calendar.tz, span.start).date(),
                existing,
            })),
            None => Ok(()),
        }
    }

    /// Cancelling twice is a no-op.
    pub async fn cancel_class(&self, id: Ulid) -> Result<(), EngineError> {
        let _wal = self.wal_gate.read().await;
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        match guard.booking(id) {
            Some(Booking::Class(c)) if c.state == ClassState::Cancelled => return Ok(()),
            Some(Booking::Class(_)) => {}
            _ => return Err(EngineError::NotFound(id)),
        }
        let event = Event::ClassStateChanged {
            id,
            room_id,
            state: ClassState::Cancelled,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(class = %id, "class cancelled");
        Ok(())
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _wal = self.wal_gate.read().await;
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::BookingDeleted { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_id)
    }

    /// Delete every occurrence sharing `group`. Returns how many went.
    pub async fn delete_series(&self, group: Ulid) -> Result<usize, EngineError> {
        let _wal = self.wal_gate.read().await;
        let (room_id, mut guard) = self.resolve_series_write(&group).await?;
        let count = guard.bookings.iter().filter(|b| b.group() == Some(group)).count();
        let event = Event::SeriesDeleted { group, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(series = %group, count, "series deleted");
        Ok(count)
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    /// Writes wait until the compacted log is in place, so none lands in the
    /// old file after the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _wal = self.wal_gate.write().await;
        let mut events: Vec<Event> = self
            .venues
            .iter()
            .map(|v| Event::VenueCreated {
                id: v.id,
                name: v.name.clone(),
            })
            .collect();

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            let room_id = guard.room.id;
            events.push(Event::RoomCreated { room: guard.room.clone() });

            let mut classes = Vec::new();
            let mut rentals = Vec::new();
            for booking in &guard.bookings {
                match booking {
                    Booking::Class(c) => classes.push(c.clone()),
                    Booking::Rental(r) => rentals.push(r.clone()),
                }
            }
            if !classes.is_empty() {
                events.push(Event::ClassesScheduled { room_id, occurrences: classes });
            }
            if !rentals.is_empty() {
                events.push(Event::RentalsScheduled { room_id, occurrences: rentals });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// A live rental already points back at `source`.
fn is_renewed(rs: &RoomState, source: Ulid) -> bool {
    rs.bookings.iter().any(|b| {
        matches!(b, Booking::Rental(r)
            if r.state != RentalState::Cancelled && r.renewed_from == Some(source))
    })
}

fn check_tariff(tariff: &Tariff) -> Result<(), ValidationError> {
    if tariff.off_peak < 0 || tariff.peak < 0 || tariff.weekend < 0 {
        return Err(ValidationError::NegativePrice);
    }
    Ok(())
}

fn record_batch(kind: BookingKind, started: Instant, result: &Result<BatchOutcome, EngineError>) {
    let kind = kind_label(kind);
    metrics::histogram!(observability::BATCH_DURATION_SECONDS, "kind" => kind)
        .record(started.elapsed().as_secs_f64());
    match result {
        Ok(outcome) => {
            metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "kind" => kind)
                .increment(outcome.created as u64);
        }
        Err(e) => {
            metrics::counter!(
                observability::BATCHES_REJECTED_TOTAL,
                "kind" => kind,
                "reason" => rejection_label(e)
            )
            .increment(1);
            if let EngineError::Conflict(_) = e {
                info!(kind, "batch rejected: {e}");
            } else {
                warn!(kind, "batch rejected: {e}");
            }
        }
    }
}
