use std::fmt;

use ulid::Ulid;

use crate::model::ReservationStatus;
use crate::store::StoreError;
use crate::validate::Violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Patient,
    Schedule,
    Reservation,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Patient => "patient",
            Entity::Schedule => "schedule",
            Entity::Reservation => "reservation",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} not found: {1}")]
    NotFound(Entity, String),
    #[error("validation failed: {}", join(.0))]
    ValidationFailed(Vec<Violation>),
    #[error("schedule {schedule_id} is full: capacity {capacity} reached")]
    CapacityExceeded { schedule_id: Ulid, capacity: u32 },
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("patient with sort_number {0} already exists")]
    AlreadyExists(i64),
    #[error("cannot delete schedule {0}: reservations still reference it")]
    ScheduleInUse(Ulid),
    #[error("contention on {0}: lock not acquired in time")]
    Contention(String),
    #[error("malformed identifier: {0:?}")]
    MalformedIdentifier(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub(crate) fn not_found(entity: Entity, key: impl fmt::Display) -> Self {
        EngineError::NotFound(entity, key.to_string())
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "NotFound",
            EngineError::ValidationFailed(_) => "ValidationFailed",
            EngineError::CapacityExceeded { .. } => "CapacityExceeded",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::AlreadyExists(_) => "AlreadyExists",
            EngineError::ScheduleInUse(_) => "ScheduleInUse",
            EngineError::Contention(_) => "Contention",
            EngineError::MalformedIdentifier(_) => "MalformedIdentifier",
            EngineError::Store(_) => "StoreError",
        }
    }
}

impl From<Vec<Violation>> for EngineError {
    fn from(violations: Vec<Violation>) -> Self {
        EngineError::ValidationFailed(violations)
    }
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
