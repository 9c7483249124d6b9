use tracing::info;
use ulid::Ulid;

use super::{Engine, EngineError, Entity};
use crate::model::{Collection, NewSchedule, Schedule, SchedulePatch};
use crate::store::{Filter, to_document};
use crate::validate::{self, Violation};

impl Engine {
    pub async fn create_schedule(&self, fields: NewSchedule) -> Result<Schedule, EngineError> {
        validate::schedule(&fields)?;
        let mut schedule = Schedule::new(Ulid::nil(), fields);
        schedule.id = self
            .store
            .insert(Collection::Schedules, to_document(&schedule)?)
            .await?;
        info!(
            "schedule {} created: {} {}-{} capacity {}",
            schedule.id, schedule.date, schedule.start_time, schedule.end_time, schedule.capacity
        );
        Ok(schedule)
    }

    pub async fn get_schedule(&self, id: Ulid) -> Result<Schedule, EngineError> {
        self.find(Collection::Schedules, &Filter::by_id(id))
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Schedule, id))
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, EngineError> {
        self.find_all(Collection::Schedules, &Filter::new()).await
    }

    /// Partial update. Capacity may not drop below the number of active
    /// reservations already held against the schedule.
    pub async fn update_schedule(
        &self,
        id: Ulid,
        patch: SchedulePatch,
    ) -> Result<Schedule, EngineError> {
        self.get_schedule(id).await?;
        let (_guard, current) = self.schedule_locked(id).await?;

        let merged = patch.merged(&current);
        validate::schedule(&merged)?;
        if merged.capacity < current.capacity {
            let active = self.active_reservations(id).await?;
            if (merged.capacity as usize) < active {
                return Err(EngineError::ValidationFailed(vec![Violation {
                    field: "capacity",
                    message: format!(
                        "{active} active reservations exceed requested capacity {}",
                        merged.capacity
                    ),
                }]));
            }
        }

        let written = self
            .store
            .update_one(
                Collection::Schedules,
                &Filter::by_id(id),
                to_document(&patch)?,
            )
            .await?;
        if written == 0 {
            return Err(EngineError::not_found(Entity::Schedule, id));
        }
        Ok(current.with_fields(merged))
    }

    /// Delete a schedule nothing references. Reservations, cancelled ones
    /// included, keep their schedule alive.
    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), EngineError> {
        self.get_schedule(id).await?;
        let (guard, _) = self.schedule_locked(id).await?;

        let referenced = self
            .store
            .find_one(
                Collection::Reservations,
                &Filter::new().eq("schedule_id", id),
            )
            .await?
            .is_some();
        if referenced {
            return Err(EngineError::ScheduleInUse(id));
        }

        let deleted = self
            .store
            .delete_one(Collection::Schedules, &Filter::by_id(id))
            .await?;
        drop(guard);
        self.forget_schedule_lock(&id);
        if deleted == 0 {
            return Err(EngineError::not_found(Entity::Schedule, id));
        }
        info!("schedule {id} deleted");
        Ok(())
    }
}
