//! Reservation manager: every write to patients, schedules and reservations
//! goes through [`Engine`], which owns the consistency rules the store lacks.

mod error;
mod patients;
mod reservations;
mod schedules;
#[cfg(test)]
mod tests;

pub use error::{EngineError, Entity};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::{Collection, Schedule};
use crate::store::{DocumentStore, Filter, from_document};

pub struct Engine {
    store: Arc<dyn DocumentStore>,
    /// Serialization point per schedule: capacity checks, queue numbering
    /// and status changes of that schedule's reservations run under it.
    schedule_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Guards the `sort_number` uniqueness check-then-write.
    patient_keys: Mutex<()>,
    lock_timeout: Duration,
}

impl Engine {
    pub fn new(store: Arc<dyn DocumentStore>, lock_timeout: Duration) -> Self {
        Self {
            store,
            schedule_locks: DashMap::new(),
            patient_keys: Mutex::new(()),
            lock_timeout,
        }
    }

    /// Acquire the schedule's lock, giving up after `lock_timeout`.
    pub(crate) async fn lock_schedule(&self, id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = self.schedule_locks.entry(id).or_default().clone();
        let started = Instant::now();
        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL, "lock" => "schedule")
                    .increment(1);
                tracing::warn!("schedule {id}: lock wait exceeded {:?}", self.lock_timeout);
                EngineError::Contention(format!("schedule {id}"))
            })?;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS, "lock" => "schedule")
            .record(started.elapsed().as_secs_f64());
        Ok(guard)
    }

    /// Lock a schedule and read it fresh under the lock.
    pub(crate) async fn schedule_locked(
        &self,
        id: Ulid,
    ) -> Result<(OwnedMutexGuard<()>, Schedule), EngineError> {
        let guard = self.lock_schedule(id).await?;
        match self.get_schedule(id).await {
            Ok(schedule) => Ok((guard, schedule)),
            Err(e) => {
                drop(guard);
                // Only a schedule known to be gone may lose its lock entry.
                if matches!(e, EngineError::NotFound(..)) {
                    self.forget_schedule_lock(&id);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn forget_schedule_lock(&self, id: &Ulid) {
        self.schedule_locks.remove(id);
    }

    pub(crate) async fn lock_patient_keys(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        let started = Instant::now();
        let guard = tokio::time::timeout(self.lock_timeout, self.patient_keys.lock())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL, "lock" => "patient_keys")
                    .increment(1);
                EngineError::Contention("patient sort numbers".into())
            })?;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS, "lock" => "patient_keys")
            .record(started.elapsed().as_secs_f64());
        Ok(guard)
    }

    async fn find<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<T>, EngineError> {
        match self.store.find_one(collection, filter).await? {
            Some(doc) => Ok(Some(from_document(doc)?)),
            None => Ok(None),
        }
    }

    async fn find_all<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<T>, EngineError> {
        self.store
            .find_many(collection, filter)
            .await?
            .into_iter()
            .map(|doc| from_document(doc).map_err(EngineError::from))
            .collect()
    }
}

/// Parse a client-supplied identifier.
pub fn parse_id(raw: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(raw.trim()).map_err(|_| EngineError::MalformedIdentifier(raw.to_string()))
}
