//! Structural checks on client-supplied records. Pure functions: no store access.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Default)]
struct Checker {
    violations: Vec<Violation>,
}

impl Checker {
    fn require(&mut self, ok: bool, field: &'static str, message: impl Into<String>) {
        if !ok {
            self.violations.push(Violation {
                field,
                message: message.into(),
            });
        }
    }

    fn finish(self) -> Result<(), Vec<Violation>> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(self.violations)
        }
    }
}

pub fn patient(p: &NewPatient) -> Result<(), Vec<Violation>> {
    let mut c = Checker::default();
    c.require(!p.name.trim().is_empty(), "name", "must not be empty");
    c.require(p.name.len() <= MAX_NAME_LEN, "name", "too long");
    c.require(p.age >= 0, "age", "must not be negative");
    c.require(p.age <= MAX_AGE, "age", format!("must be at most {MAX_AGE}"));
    c.require(
        !p.contact_number.trim().is_empty(),
        "contact_number",
        "must not be empty",
    );
    c.require(
        p.contact_number.len() <= MAX_CONTACT_LEN,
        "contact_number",
        "too long",
    );
    c.finish()
}

pub fn schedule(s: &NewSchedule) -> Result<(), Vec<Violation>> {
    let mut c = Checker::default();
    c.require(s.capacity >= 1, "capacity", "must be at least 1");
    c.require(
        s.capacity <= MAX_SCHEDULE_CAPACITY,
        "capacity",
        format!("must be at most {MAX_SCHEDULE_CAPACITY}"),
    );
    c.require(!s.doctor_id.trim().is_empty(), "doctor_id", "must not be empty");
    c.require(s.doctor_id.len() <= MAX_DOCTOR_ID_LEN, "doctor_id", "too long");
    c.require(
        parse_date(&s.date).is_some(),
        "date",
        "expected YYYY-MM-DD",
    );

    let start = parse_time(&s.start_time);
    let end = parse_time(&s.end_time);
    c.require(start.is_some(), "start_time", "expected HH:MM or HH:MM:SS");
    c.require(end.is_some(), "end_time", "expected HH:MM or HH:MM:SS");
    if let (Some(start), Some(end)) = (start, end) {
        c.require(end > start, "end_time", "must be after start_time");
    }
    c.finish()
}

/// A reservation starts either awaiting confirmation or confirmed.
pub fn initial_status(status: ReservationStatus) -> Result<(), Vec<Violation>> {
    let mut c = Checker::default();
    c.require(
        status.is_active(),
        "status",
        "a reservation cannot be created cancelled",
    );
    c.finish()
}

/// Patient, schedule and queue number are fixed once a reservation exists.
pub fn immutable_refs(update: &ReservationUpdate, current: &Reservation) -> Result<(), Vec<Violation>> {
    let mut c = Checker::default();
    if let Some(pid) = &update.patient_id {
        c.require(
            Ulid::from_string(pid.trim()).is_ok_and(|p| p == current.patient_id),
            "patient_id",
            "cannot be changed; cancel and create a new reservation",
        );
    }
    if let Some(sid) = &update.schedule_id {
        c.require(
            Ulid::from_string(sid.trim()).is_ok_and(|s| s == current.schedule_id),
            "schedule_id",
            "cannot be changed; cancel and create a new reservation",
        );
    }
    if let Some(q) = update.queue_number {
        c.require(
            q == current.queue_number,
            "queue_number",
            "is assigned by the server",
        );
    }
    c.finish()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|t| t.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|t| t.date_naive()))
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}
