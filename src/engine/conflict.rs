use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// The committed booking a proposed span ran into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictDescription {
    pub kind: BookingKind,
    pub booking_id: Ulid,
    /// Class name or client name.
    pub label: String,
    pub span: Span,
}

impl ConflictDescription {
    fn of(booking: &Booking) -> Self {
        Self {
            kind: booking.kind(),
            booking_id: booking.id(),
            label: booking.label().to_string(),
            span: booking.span(),
        }
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("empty span"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// First committed booking overlapping `span`, classes before rentals.
///
/// Cancelled classes and quoted or cancelled rentals never conflict.
/// `ignore` skips one booking, for re-checking a rental against its own room.
pub(crate) fn find_conflict(
    rs: &RoomState,
    span: &Span,
    ignore: Option<Ulid>,
) -> Option<ConflictDescription> {
    let candidates = || {
        rs.overlapping(span)
            .filter(move |b| Some(b.id()) != ignore && b.blocks_timeline())
    };
    candidates()
        .find(|b| b.kind() == BookingKind::Class)
        .or_else(|| candidates().find(|b| b.kind() == BookingKind::Rental))
        .map(ConflictDescription::of)
}
