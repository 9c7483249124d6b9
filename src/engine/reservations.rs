use chrono::Utc;
use tracing::{debug, info};
use ulid::Ulid;

use super::{Engine, EngineError, Entity, parse_id};
use crate::model::{
    Collection, NewReservation, Reservation, ReservationStatus, ReservationUpdate,
};
use crate::observability::{
    RESERVATION_TRANSITIONS_TOTAL, RESERVATIONS_CREATED_TOTAL, RESERVATIONS_REJECTED_TOTAL,
};
use crate::store::{Document, Filter, fields, to_document};
use crate::validate;

/// Next queue number for a schedule: one past the highest number ever issued,
/// whether or not that reservation still exists or is still active.
pub(crate) fn next_queue_number(existing: &[Reservation], high_water: u32) -> u32 {
    existing
        .iter()
        .map(|r| r.queue_number)
        .max()
        .unwrap_or(0)
        .max(high_water)
        + 1
}

impl Engine {
    /// Reserve a slot on a schedule.
    ///
    /// Capacity check, queue number assignment and the insert all happen
    /// under the schedule's lock, so concurrent requests for the same schedule
    /// never oversubscribe it or share a queue number. Nothing is written when
    /// a check fails.
    pub async fn create_reservation(
        &self,
        request: NewReservation,
    ) -> Result<Reservation, EngineError> {
        let patient_id = parse_id(&request.patient_id)?;
        let schedule_id = parse_id(&request.schedule_id)?;
        let status = request.status.unwrap_or_default();
        validate::initial_status(status)?;

        self.get_patient(patient_id).await?;
        self.get_schedule(schedule_id).await?;

        let (_guard, schedule) = self.schedule_locked(schedule_id).await?;
        let existing = self.reservations_on(schedule_id).await?;
        let active = existing.iter().filter(|r| r.status.is_active()).count();
        if active >= schedule.capacity as usize {
            metrics::counter!(RESERVATIONS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
            debug!(
                "schedule {schedule_id} full ({active}/{}), rejecting patient {patient_id}",
                schedule.capacity
            );
            return Err(EngineError::CapacityExceeded {
                schedule_id,
                capacity: schedule.capacity,
            });
        }

        let queue_number = next_queue_number(&existing, schedule.last_queue_number);
        // High-water mark first: a failed insert skips a number, never repeats one.
        self.store
            .update_one(
                Collection::Schedules,
                &Filter::by_id(schedule_id),
                fields([("last_queue_number", queue_number)])?,
            )
            .await?;

        let mut reservation = Reservation {
            id: Ulid::nil(),
            patient_id,
            schedule_id,
            reserved_at: request.reserved_at.unwrap_or_else(Utc::now),
            queue_number,
            status,
        };
        reservation.id = self
            .store
            .insert(Collection::Reservations, to_document(&reservation)?)
            .await?;

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {} created: schedule {schedule_id} queue #{queue_number} ({status})",
            reservation.id
        );
        Ok(reservation)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.find(Collection::Reservations, &Filter::by_id(id))
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Reservation, id))
    }

    /// Apply a status and/or `reserved_at` change. Requesting the current
    /// status again is a no-op, except for `Cancelled`, which is terminal.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        update: ReservationUpdate,
    ) -> Result<Reservation, EngineError> {
        let current = self.get_reservation(id).await?;
        let _guard = self.lock_schedule(current.schedule_id).await?;
        let mut reservation = self.get_reservation(id).await?;
        validate::immutable_refs(&update, &reservation)?;

        let mut changes = Document::new();
        let mut transition = None;
        if let Some(next) = update.status {
            let unchanged = next == reservation.status && next.is_active();
            if !unchanged {
                if !reservation.status.can_transition_to(next) {
                    metrics::counter!(RESERVATIONS_REJECTED_TOTAL, "reason" => "transition")
                        .increment(1);
                    return Err(EngineError::InvalidTransition {
                        from: reservation.status,
                        to: next,
                    });
                }
                changes.extend(fields([("status", next)])?);
                transition = Some((reservation.status, next));
            }
        }
        if let Some(at) = update.reserved_at {
            changes.extend(fields([("reserved_at", at)])?);
        }
        if changes.is_empty() {
            return Ok(reservation);
        }

        let written = self
            .store
            .update_one(Collection::Reservations, &Filter::by_id(id), changes)
            .await?;
        if written == 0 {
            return Err(EngineError::not_found(Entity::Reservation, id));
        }

        if let Some((from, to)) = transition {
            reservation.status = to;
            metrics::counter!(RESERVATION_TRANSITIONS_TOTAL, "to" => to.to_string()).increment(1);
            info!("reservation {id}: {from} -> {to}");
        }
        if let Some(at) = update.reserved_at {
            reservation.reserved_at = at;
        }
        Ok(reservation)
    }

    pub async fn update_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        self.update_reservation(
            id,
            ReservationUpdate {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    /// Reservations on a schedule in queue order. An unknown schedule has none.
    pub async fn list_reservations_by_schedule(
        &self,
        schedule_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut reservations = self.reservations_on(schedule_id).await?;
        reservations.sort_by_key(|r| r.queue_number);
        Ok(reservations)
    }

    /// A patient's reservations, oldest `reserved_at` first.
    pub async fn list_reservations_by_patient(
        &self,
        patient_id: Ulid,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut reservations: Vec<Reservation> = self
            .find_all(
                Collection::Reservations,
                &Filter::new().eq("patient_id", patient_id),
            )
            .await?;
        reservations.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at).then(a.id.cmp(&b.id)));
        Ok(reservations)
    }

    /// Administrative removal. Remaining queue numbers are left as they are
    /// and the removed number is not handed out again.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let current = self.get_reservation(id).await?;
        let _guard = self.lock_schedule(current.schedule_id).await?;
        let deleted = self
            .store
            .delete_one(Collection::Reservations, &Filter::by_id(id))
            .await?;
        if deleted == 0 {
            return Err(EngineError::not_found(Entity::Reservation, id));
        }
        info!(
            "reservation {id} deleted (schedule {}, queue #{})",
            current.schedule_id, current.queue_number
        );
        Ok(())
    }

    async fn reservations_on(&self, schedule_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        self.find_all(
            Collection::Reservations,
            &Filter::new().eq("schedule_id", schedule_id),
        )
        .await
    }

    pub(super) async fn active_reservations(&self, schedule_id: Ulid) -> Result<usize, EngineError> {
        Ok(self
            .reservations_on(schedule_id)
            .await?
            .iter()
            .filter(|r| r.status.is_active())
            .count())
    }
}
