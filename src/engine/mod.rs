mod conflict;
mod error;
mod mutations;
mod queries;
mod renewal;
#[cfg(test)]
mod tests;

pub use conflict::ConflictDescription;
pub use error::{ConflictError, EngineError, ValidationError};
pub use mutations::BatchOutcome;
pub use queries::{AgendaEntry, AgendaKind};
pub use renewal::RenewalProjection;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::blob::BlobStore;
use crate::model::*;
use crate::rate::PeakBand;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Local-time rules of the studio.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
    pub tz: Tz,
    pub peak: PeakBand,
}

impl Default for Calendar {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::Argentina::Buenos_Aires,
            peak: PeakBand::default(),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append already queued when the writer wakes up is
/// committed with a single fsync; control commands run after that group.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(first) = rx.recv().await {
        let mut group: Vec<PendingAppend> = Vec::new();
        let mut control = None;
        match first {
            WalCommand::Append { event, response } => group.push((event, response)),
            other => control = Some(other),
        }
        while control.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => group.push((event, response)),
                Ok(other) => control = Some(other),
                Err(_) => break,
            }
        }
        if !group.is_empty() {
            commit_group(&mut wal, group);
        }
        if let Some(cmd) = control {
            run_control(&mut wal, cmd);
        }
    }
}

fn commit_group(wal: &mut Wal, group: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(group.len() as f64);
    let started = std::time::Instant::now();

    let appended = group
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes don't ride along with
    // the next group; every caller in this group is told it failed.
    let flushed = wal.flush_sync();
    let outcome = appended.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in group {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_group(wal, vec![(event, response)]),
    }
}

pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) venues: DashMap<Ulid, Venue>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Booking id → room id.
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    /// Recurrence group → room id. A batch never spans rooms.
    pub(super) series_to_room: DashMap<Ulid, Ulid>,
    /// Venue → rooms.
    pub(super) venue_rooms: DashMap<Ulid, Vec<Ulid>>,
    pub(super) calendar: Calendar,
    pub(super) blobs: Arc<dyn BlobStore>,
    /// Shared by writers from before the room lock until the event is
    /// applied; held exclusively by compaction. Always taken before a room lock.
    pub(super) wal_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, calendar: Calendar, blobs: Arc<dyn BlobStore>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            venues: DashMap::new(),
            wal_tx,
            booking_to_room: DashMap::new(),
            series_to_room: DashMap::new(),
            venue_rooms: DashMap::new(),
            calendar,
            blobs,
            wal_gate: RwLock::new(()),
        };

        // Sole owner of every lock during replay: try_write never contends.
        // Blocking lock calls would panic if we are inside a runtime.
        for event in &events {
            match event {
                Event::VenueCreated { id, name } => {
                    engine.venues.insert(*id, Venue { id: *id, name: name.clone() });
                }
                Event::RoomCreated { room } => engine.insert_room(room.clone()),
                Event::RoomDeleted { id } => engine.remove_room(id),
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(rs) = engine.get_room(&room_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        engine.apply(&mut guard, other);
                    }
                }
            }
        }
        debug!(
            "replayed {} events: {} venues, {} rooms, {} bookings",
            events.len(),
            engine.venues.len(),
            engine.rooms.len(),
            engine.booking_to_room.len()
        );
        metrics::gauge!(crate::observability::ROOMS_ACTIVE).set(engine.rooms.len() as f64);

        Ok(engine)
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub(super) fn insert_room(&self, room: Room) {
        self.venue_rooms.entry(room.venue_id).or_default().push(room.id);
        self.rooms.insert(room.id, Arc::new(RwLock::new(RoomState::new(room))));
    }

    pub(super) fn remove_room(&self, id: &Ulid) {
        if let Some((_, rs)) = self.rooms.remove(id)
            && let Ok(guard) = rs.try_read()
            && let Some(mut ids) = self.venue_rooms.get_mut(&guard.room.venue_id)
        {
            ids.retain(|r| r != id);
        }
    }

    /// Apply an event to a room the caller has locked, keeping the indexes in step.
    pub(super) fn apply(&self, rs: &mut RoomState, event: &Event) {
        let room_id = rs.room.id;
        match event {
            Event::TariffUpdated { tariff, .. } => rs.room.tariff = *tariff,
            Event::ClassesScheduled { occurrences, .. } => {
                for occ in occurrences {
                    self.index_booking(room_id, occ.id, occ.group);
                    rs.insert_booking(Booking::Class(occ.clone()));
                }
            }
            Event::RentalsScheduled { occurrences, .. } => {
                for occ in occurrences {
                    self.index_booking(room_id, occ.id, occ.group);
                    rs.insert_booking(Booking::Rental(occ.clone()));
                }
            }
            Event::ClassStateChanged { id, state, .. } => {
                if let Some(Booking::Class(c)) = rs.booking_mut(*id) {
                    c.state = *state;
                }
            }
            Event::RentalStateChanged { ids, state, .. } => {
                for id in ids {
                    if let Some(Booking::Rental(r)) = rs.booking_mut(*id) {
                        r.state = *state;
                    }
                }
            }
            Event::BookingDeleted { id, .. } => {
                rs.remove_booking(*id);
                self.booking_to_room.remove(id);
            }
            Event::SeriesDeleted { group, .. } => {
                rs.bookings.retain(|b| {
                    let member = b.group() == Some(*group);
                    if member {
                        self.booking_to_room.remove(&b.id());
                    }
                    !member
                });
                self.series_to_room.remove(group);
            }
            // Venue and room lifecycle lives in the maps, not in a room's state.
            Event::VenueCreated { .. } | Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
        }
    }

    fn index_booking(&self, room_id: Ulid, id: Ulid, group: Option<Ulid>) {
        self.booking_to_room.insert(id, room_id);
        if let Some(g) = group {
            self.series_to_room.insert(g, room_id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Durably log, then apply to the locked room.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(rs, event);
        Ok(())
    }

    /// Lookup booking → room, acquire the room's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .booking_to_room
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        Ok((room_id, rs.write_owned().await))
    }

    /// Lookup series → room, acquire the room's write lock.
    pub(super) async fn resolve_series_write(
        &self,
        group: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .series_to_room
            .get(group)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*group))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        Ok((room_id, rs.write_owned().await))
    }
}

/// The room a booking-level event touches.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::TariffUpdated { room_id, .. }
        | Event::ClassesScheduled { room_id, .. }
        | Event::RentalsScheduled { room_id, .. }
        | Event::ClassStateChanged { room_id, .. }
        | Event::RentalStateChanged { room_id, .. }
        | Event::BookingDeleted { room_id, .. }
        | Event::SeriesDeleted { room_id, .. } => Some(*room_id),
        Event::VenueCreated { .. } | Event::RoomCreated { .. } | Event::RoomDeleted { .. } => None,
    }
}
