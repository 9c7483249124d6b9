use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The three document collections the service persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Patients,
    Schedules,
    Reservations,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Patients,
        Collection::Schedules,
        Collection::Reservations,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Patients => "patients",
            Collection::Schedules => "schedules",
            Collection::Reservations => "reservations",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Collection::Patients => 0,
            Collection::Schedules => 1,
            Collection::Reservations => 2,
        }
    }
}

// ── Patients ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gender {
    Male,
    Female,
}

/// Patient fields as supplied by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPatient {
    pub sort_number: i64,
    pub name: String,
    pub age: i32,
    pub gender: Gender,
    pub contact_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Ulid,
    pub sort_number: i64,
    pub name: String,
    pub age: i32,
    pub gender: Gender,
    pub contact_number: String,
}

impl Patient {
    pub fn new(id: Ulid, fields: NewPatient) -> Self {
        Self {
            id,
            sort_number: fields.sort_number,
            name: fields.name,
            age: fields.age,
            gender: fields.gender,
            contact_number: fields.contact_number,
        }
    }
}

/// Partial patient update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_number: Option<String>,
}

impl PatientPatch {
    /// The patient's fields with this patch applied.
    pub fn merged(&self, current: &Patient) -> NewPatient {
        NewPatient {
            sort_number: self.sort_number.unwrap_or(current.sort_number),
            name: self.name.clone().unwrap_or_else(|| current.name.clone()),
            age: self.age.unwrap_or(current.age),
            gender: self.gender.unwrap_or(current.gender),
            contact_number: self
                .contact_number
                .clone()
                .unwrap_or_else(|| current.contact_number.clone()),
        }
    }
}

// ── Schedules ────────────────────────────────────────────────────

/// Schedule fields as supplied by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchedule {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM` or `HH:MM:SS`
    pub start_time: String,
    pub end_time: String,
    pub doctor_id: String,
    /// Max active reservations.
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub doctor_id: String,
    pub capacity: u32,
    /// Highest queue number ever issued on this schedule. Survives
    /// administrative deletion of reservations so numbers are never reissued.
    #[serde(default)]
    pub last_queue_number: u32,
}

impl Schedule {
    pub fn new(id: Ulid, fields: NewSchedule) -> Self {
        Self {
            id,
            date: fields.date,
            start_time: fields.start_time,
            end_time: fields.end_time,
            doctor_id: fields.doctor_id,
            capacity: fields.capacity,
            last_queue_number: 0,
        }
    }

    fn apply(&mut self, fields: NewSchedule) {
        self.date = fields.date;
        self.start_time = fields.start_time;
        self.end_time = fields.end_time;
        self.doctor_id = fields.doctor_id;
        self.capacity = fields.capacity;
    }

    /// Copy of this schedule with `fields` replacing the client-owned fields.
    pub fn with_fields(&self, fields: NewSchedule) -> Self {
        let mut updated = self.clone();
        updated.apply(fields);
        updated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

impl SchedulePatch {
    pub fn merged(&self, current: &Schedule) -> NewSchedule {
        NewSchedule {
            date: self.date.clone().unwrap_or_else(|| current.date.clone()),
            start_time: self
                .start_time
                .clone()
                .unwrap_or_else(|| current.start_time.clone()),
            end_time: self
                .end_time
                .clone()
                .unwrap_or_else(|| current.end_time.clone()),
            doctor_id: self
                .doctor_id
                .clone()
                .unwrap_or_else(|| current.doctor_id.clone()),
            capacity: self.capacity.unwrap_or(current.capacity),
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
    #[default]
    AwaitingConfirmation,
}

impl ReservationStatus {
    /// Active reservations count against schedule capacity.
    pub fn is_active(self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    /// Cancelled is terminal; everything else only moves forward.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (AwaitingConfirmation, Confirmed)
                | (AwaitingConfirmation, Cancelled)
                | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationStatus::Confirmed => "Confirmed",
            ReservationStatus::Cancelled => "Cancelled",
            ReservationStatus::AwaitingConfirmation => "AwaitingConfirmation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub schedule_id: Ulid,
    pub reserved_at: DateTime<Utc>,
    pub queue_number: u32,
    pub status: ReservationStatus,
}

/// Reservation request. Ids arrive as raw strings and are checked before use;
/// the queue number is always assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub patient_id: String,
    pub schedule_id: String,
    #[serde(default)]
    pub status: Option<ReservationStatus>,
    #[serde(default)]
    pub reserved_at: Option<DateTime<Utc>>,
}

/// Reservation update request. `patient_id`, `schedule_id` and
/// `queue_number` are accepted only so a change to them can be rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationUpdate {
    #[serde(default)]
    pub status: Option<ReservationStatus>,
    #[serde(default)]
    pub reserved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub queue_number: Option<u32>,
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. One flat event per store write.
///
/// Bodies are JSON text: bincode cannot decode self-describing values, and
/// documents are schemaless at the store level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Inserted {
        collection: Collection,
        id: Ulid,
        body: String,
    },
    /// Full document after the update was merged.
    Updated {
        collection: Collection,
        id: Ulid,
        body: String,
    },
    Deleted {
        collection: Collection,
        id: Ulid,
    },
}

impl Event {
    pub fn collection(&self) -> Collection {
        match self {
            Event::Inserted { collection, .. }
            | Event::Updated { collection, .. }
            | Event::Deleted { collection, .. } => *collection,
        }
    }
}
