use std::fmt;

use chrono::NaiveDate;
use ulid::Ulid;

use super::conflict::ConflictDescription;
use crate::model::{BookingKind, RentalState};

/// Missing or malformed input, caught before any storage access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingRoom,
    MissingDate,
    MissingTeacher,
    MissingClient,
    EmptyName,
    NameTooLong,
    ZeroDuration,
    DurationTooLong(u32),
    /// `UsageCategory::Class` is reserved for class occurrences.
    ClassCategoryOnRental,
    BadHeadcount(u32),
    CancelledOnCreate,
    NegativePrice,
    NoOccurrences,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingRoom => write!(f, "no room selected"),
            ValidationError::MissingDate => write!(f, "no date selected"),
            ValidationError::MissingTeacher => write!(f, "no teacher selected"),
            ValidationError::MissingClient => write!(f, "client name is required"),
            ValidationError::EmptyName => write!(f, "name is required"),
            ValidationError::NameTooLong => write!(f, "name too long"),
            ValidationError::ZeroDuration => write!(f, "duration must be positive"),
            ValidationError::DurationTooLong(m) => write!(f, "duration of {m} minutes is too long"),
            ValidationError::ClassCategoryOnRental => {
                write!(f, "rentals cannot use the class category")
            }
            ValidationError::BadHeadcount(n) => write!(f, "headcount {n} out of range"),
            ValidationError::CancelledOnCreate => {
                write!(f, "a new rental cannot start cancelled")
            }
            ValidationError::NegativePrice => write!(f, "prices cannot be negative"),
            ValidationError::NoOccurrences => write!(f, "recurrence produced no dates"),
        }
    }
}

impl ValidationError {
    fn user_message(&self) -> &'static str {
        match self {
            ValidationError::MissingRoom => "Elegí una sala",
            ValidationError::MissingDate => "Elegí una fecha",
            ValidationError::MissingTeacher => "Elegí un profesor",
            ValidationError::MissingClient => "Falta el nombre del cliente",
            ValidationError::EmptyName => "Falta el nombre",
            ValidationError::NameTooLong => "El nombre es demasiado largo",
            ValidationError::ZeroDuration | ValidationError::DurationTooLong(_) => {
                "Duración inválida"
            }
            ValidationError::ClassCategoryOnRental => "Tipo de uso inválido",
            ValidationError::BadHeadcount(_) => "Cantidad de personas inválida",
            ValidationError::CancelledOnCreate => "Estado inicial inválido",
            ValidationError::NegativePrice => "Los precios no pueden ser negativos",
            ValidationError::NoOccurrences => "No hay fechas para reservar",
        }
    }
}

/// A candidate occurrence collides with a committed booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictError {
    /// Local date of the rejected candidate.
    pub date: NaiveDate,
    pub existing: ConflictDescription,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Conflict(ConflictError),
    Validation(ValidationError),
    InvalidTransition {
        id: Ulid,
        from: RentalState,
        to: RentalState,
    },
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    Storage(String),
}

impl EngineError {
    /// Text shown at the front desk.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Conflict(c) => {
                let what = match c.existing.kind {
                    BookingKind::Class => "Clase existente",
                    BookingKind::Rental => "Alquiler existente",
                };
                format!(
                    "Conflicto el {}: {what}: {}",
                    c.date.format("%d/%m"),
                    c.existing.label
                )
            }
            EngineError::Validation(v) => v.user_message().into(),
            EngineError::NotFound(_) => "No se encontró el registro".into(),
            EngineError::InvalidTransition { from, to, .. } => {
                format!("No se puede pasar de {from} a {to}")
            }
            EngineError::HasBookings(_) => "La sala tiene reservas".into(),
            _ => "Error al guardar".into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(c) => write!(
                f,
                "conflict on {}: {:?} {} ({})",
                c.date, c.existing.kind, c.existing.label, c.existing.booking_id
            ),
            EngineError::Validation(v) => write!(f, "invalid request: {v}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "rental {id} cannot go from {from} to {to}")
            }
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete room {id}: has bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}
