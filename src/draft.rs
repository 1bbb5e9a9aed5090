//! Booking requests as the front desk fills them in: any selection may still
//! be missing. Validation turns them into a slot the engine can work with.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::blob::Attachment;
use crate::engine::ValidationError;
use crate::limits::{MAX_DURATION_MINUTES, MAX_HEADCOUNT, MAX_NAME_LEN};
use crate::model::{ClassKind, Client, PayAgreement, RentalState, UsageCategory, YearMonth};
use crate::recurrence::Recurrence;

/// Room, local start and duration, all present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub room_id: Ulid,
    pub anchor: NaiveDateTime,
    pub duration_minutes: u32,
}

fn slot(
    room_id: Option<Ulid>,
    date: Option<NaiveDate>,
    start: NaiveTime,
    duration_minutes: u32,
) -> Result<Slot, ValidationError> {
    let room_id = room_id.ok_or(ValidationError::MissingRoom)?;
    let date = date.ok_or(ValidationError::MissingDate)?;
    if duration_minutes == 0 {
        return Err(ValidationError::ZeroDuration);
    }
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(ValidationError::DurationTooLong(duration_minutes));
    }
    Ok(Slot {
        room_id,
        anchor: date.and_time(start),
        duration_minutes,
    })
}

fn default_start() -> NaiveTime {
    NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN)
}

#[derive(Debug, Clone)]
pub struct ClassDraft {
    pub room_id: Option<Ulid>,
    pub teacher_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub start: NaiveTime,
    pub duration_minutes: u32,
    pub name: String,
    pub description: String,
    pub kind: ClassKind,
    pub level: String,
    pub agreement: PayAgreement,
    pub capacity: u32,
    /// Repeat every week until the end of the year.
    pub repeat_weekly: bool,
    pub image: Option<Attachment>,
}

impl Default for ClassDraft {
    fn default() -> Self {
        Self {
            room_id: None,
            teacher_id: None,
            date: None,
            start: default_start(),
            duration_minutes: 60,
            name: String::new(),
            description: String::new(),
            kind: ClassKind::Regular,
            level: "Open".into(),
            agreement: PayAgreement::Percentage(50),
            capacity: 20,
            repeat_weekly: false,
            image: None,
        }
    }
}

impl ClassDraft {
    /// The slot and the teacher.
    pub fn validate(&self) -> Result<(Slot, Ulid), ValidationError> {
        let slot = slot(self.room_id, self.date, self.start, self.duration_minutes)?;
        let teacher = self.teacher_id.ok_or(ValidationError::MissingTeacher)?;
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong);
        }
        Ok((slot, teacher))
    }

    pub fn recurrence(&self) -> Recurrence {
        if self.repeat_weekly {
            Recurrence::WeeklyUntilYearEnd
        } else {
            Recurrence::Single
        }
    }
}

#[derive(Debug, Clone)]
pub struct RentalDraft {
    pub room_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub start: NaiveTime,
    pub duration_minutes: u32,
    pub client: Client,
    pub category: UsageCategory,
    pub headcount: u32,
    /// Book every matching weekday of this month instead of one date.
    pub monthly: Option<YearMonth>,
    pub state: RentalState,
    pub receipt: Option<Attachment>,
    pub renewed_from: Option<Ulid>,
    /// Defaults to the quote breakdown.
    pub notes: Option<String>,
}

impl Default for RentalDraft {
    fn default() -> Self {
        Self {
            room_id: None,
            date: None,
            start: default_start(),
            duration_minutes: 60,
            client: Client::default(),
            category: UsageCategory::Rehearsal,
            headcount: 1,
            monthly: None,
            state: RentalState::Quoted,
            receipt: None,
            renewed_from: None,
            notes: None,
        }
    }
}

impl RentalDraft {
    /// Enough to price the rental.
    pub fn slot(&self) -> Result<Slot, ValidationError> {
        if self.category == UsageCategory::Class {
            return Err(ValidationError::ClassCategoryOnRental);
        }
        slot(self.room_id, self.date, self.start, self.duration_minutes)
    }

    /// Enough to book it.
    pub fn validate(&self) -> Result<Slot, ValidationError> {
        let slot = self.slot()?;
        if self.client.name.trim().is_empty() {
            return Err(ValidationError::MissingClient);
        }
        if self.client.name.len() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong);
        }
        if self.headcount == 0 || self.headcount > MAX_HEADCOUNT {
            return Err(ValidationError::BadHeadcount(self.headcount));
        }
        if self.state == RentalState::Cancelled {
            return Err(ValidationError::CancelledOnCreate);
        }
        Ok(slot)
    }

    pub fn recurrence(&self) -> Recurrence {
        match self.monthly {
            Some(month) => Recurrence::MonthOfWeek { month },
            None => Recurrence::Single,
        }
    }
}
