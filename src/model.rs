use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type on the timeline.
pub type Ms = i64;

/// Money in whole currency units.
pub type Amount = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `a < d && c < b` for `[a, b)` and `[c, d)`. Touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Calendar month, e.g. `2024-06`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("YearMonth holds a valid month")
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    /// Every date of the month, ascending.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let month = *self;
        self.first_day()
            .iter_days()
            .take_while(move |d| YearMonth::of(*d) == month)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {s:?}"))?;
        let year: i32 = y.parse().map_err(|_| format!("bad year in {s:?}"))?;
        let month: u32 = m.parse().map_err(|_| format!("bad month in {s:?}"))?;
        YearMonth::new(year, month).ok_or_else(|| format!("month out of range in {s:?}"))
    }
}

// ── Rooms ────────────────────────────────────────────────────────

/// Hourly unit prices per time band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tariff {
    pub off_peak: Amount,
    pub peak: Amount,
    pub weekend: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub venue_id: Ulid,
    pub name: String,
    pub tariff: Tariff,
}

// ── Bookings ─────────────────────────────────────────────────────

/// What a room is used for. Fixed at creation, never inferred from a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageCategory {
    Class,
    Rehearsal,
    Production,
    Event,
    ClassRental,
}

impl UsageCategory {
    pub fn label(&self) -> &'static str {
        match self {
            UsageCategory::Class => "Clase",
            UsageCategory::Rehearsal => "Ensayo",
            UsageCategory::Production => "Producción",
            UsageCategory::Event => "Evento",
            UsageCategory::ClassRental => "Alquiler para clase",
        }
    }
}

/// Kind of class, drives badge colour on the agenda.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClassKind {
    #[default]
    Regular,
    Special,
    Training,
    Company,
}

/// How the teacher is paid for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayAgreement {
    /// Percent of the class takings.
    Percentage(u32),
    /// Fixed amount per session.
    Fixed(Amount),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassState {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RentalState {
    /// Tentative hold. Never blocks the timeline.
    Quoted,
    Confirmed,
    Paid,
    Cancelled,
}

impl RentalState {
    /// Confirmed and paid rentals occupy the room.
    pub fn is_committed(&self) -> bool {
        matches!(self, RentalState::Confirmed | RentalState::Paid)
    }

    pub fn can_transition_to(&self, next: RentalState) -> bool {
        use RentalState::*;
        matches!(
            (self, next),
            (Quoted, Confirmed)
                | (Quoted, Paid)
                | (Quoted, Cancelled)
                | (Confirmed, Paid)
                | (Confirmed, Cancelled)
                | (Paid, Cancelled)
        )
    }
}

impl fmt::Display for RentalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RentalState::Quoted => "quoted",
            RentalState::Confirmed => "confirmed",
            RentalState::Paid => "paid",
            RentalState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassOccurrence {
    pub id: Ulid,
    pub room_id: Ulid,
    pub group: Option<Ulid>,
    pub span: Span,
    pub name: String,
    pub description: String,
    pub kind: ClassKind,
    pub level: String,
    pub teacher_id: Ulid,
    pub agreement: PayAgreement,
    pub capacity: u32,
    pub image: Option<String>,
    pub state: ClassState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalOccurrence {
    pub id: Ulid,
    pub room_id: Ulid,
    pub group: Option<Ulid>,
    pub span: Span,
    pub client: Client,
    pub category: UsageCategory,
    pub headcount: u32,
    /// Price of this occurrence (unit price × hours).
    pub price: Amount,
    pub state: RentalState,
    /// Set for monthly rentals: the month this series covers.
    pub monthly: Option<YearMonth>,
    /// Recurrence group of the series this one renews.
    pub renewed_from: Option<Ulid>,
    pub receipt: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingKind {
    Class,
    Rental,
}

/// One occurrence on a room's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Booking {
    Class(ClassOccurrence),
    Rental(RentalOccurrence),
}

impl Booking {
    pub fn id(&self) -> Ulid {
        match self {
            Booking::Class(c) => c.id,
            Booking::Rental(r) => r.id,
        }
    }

    pub fn room_id(&self) -> Ulid {
        match self {
            Booking::Class(c) => c.room_id,
            Booking::Rental(r) => r.room_id,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Booking::Class(c) => c.span,
            Booking::Rental(r) => r.span,
        }
    }

    pub fn group(&self) -> Option<Ulid> {
        match self {
            Booking::Class(c) => c.group,
            Booking::Rental(r) => r.group,
        }
    }

    pub fn kind(&self) -> BookingKind {
        match self {
            Booking::Class(_) => BookingKind::Class,
            Booking::Rental(_) => BookingKind::Rental,
        }
    }

    /// Class name or client name.
    pub fn label(&self) -> &str {
        match self {
            Booking::Class(c) => &c.name,
            Booking::Rental(r) => &r.client.name,
        }
    }

    /// Whether this occurrence takes part in the no-overlap invariant.
    pub fn blocks_timeline(&self) -> bool {
        match self {
            Booking::Class(c) => c.state != ClassState::Cancelled,
            Booking::Rental(r) => r.state.is_committed(),
        }
    }
}

/// A room plus its bookings, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let start = booking.span().start;
        let pos = self
            .bookings
            .binary_search_by_key(&start, |b| b.span().start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id() == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id() == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id() == id)
    }

    /// Bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span().start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span().end > query.start)
    }
}

/// WAL record format. A scheduled batch is a single record so replay sees
/// all of it or none of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VenueCreated {
        id: Ulid,
        name: String,
    },
    RoomCreated {
        room: Room,
    },
    TariffUpdated {
        room_id: Ulid,
        tariff: Tariff,
    },
    RoomDeleted {
        id: Ulid,
    },
    ClassesScheduled {
        room_id: Ulid,
        occurrences: Vec<ClassOccurrence>,
    },
    RentalsScheduled {
        room_id: Ulid,
        occurrences: Vec<RentalOccurrence>,
    },
    ClassStateChanged {
        id: Ulid,
        room_id: Ulid,
        state: ClassState,
    },
    RentalStateChanged {
        ids: Vec<Ulid>,
        room_id: Ulid,
        state: RentalState,
    },
    BookingDeleted {
        id: Ulid,
        room_id: Ulid,
    },
    SeriesDeleted {
        group: Ulid,
        room_id: Ulid,
    },
}
