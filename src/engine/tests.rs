use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ulid::Ulid;

use super::reservations::next_queue_number;
use super::*;
use crate::limits::DEFAULT_LOCK_TIMEOUT_MS;
use crate::model::*;
use crate::store::{Document, DocumentStore, StoreError, WalStore};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("clinicq_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_at(path: &PathBuf, lock_timeout: Duration) -> (Arc<WalStore>, Engine) {
    let store = Arc::new(WalStore::open(path).unwrap());
    let engine = Engine::new(store.clone(), lock_timeout);
    (store, engine)
}

fn test_engine(name: &str) -> Engine {
    let path = test_wal_path(name);
    engine_at(&path, Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS)).1
}

fn new_patient(sort_number: i64) -> NewPatient {
    NewPatient {
        sort_number,
        name: format!("Patient {sort_number}"),
        age: 30,
        gender: Gender::Male,
        contact_number: "08120000000".into(),
    }
}

fn new_schedule(capacity: u32) -> NewSchedule {
    NewSchedule {
        date: "2024-06-01".into(),
        start_time: "08:00".into(),
        end_time: "12:00".into(),
        doctor_id: "dr-rina".into(),
        capacity,
    }
}

fn request(patient: &Patient, schedule: &Schedule) -> NewReservation {
    NewReservation {
        patient_id: patient.id.to_string(),
        schedule_id: schedule.id.to_string(),
        status: None,
        reserved_at: None,
    }
}

/// One patient plus one schedule of the given capacity.
async fn setup(engine: &Engine, capacity: u32) -> (Patient, Schedule) {
    let patient = engine.create_patient(new_patient(1)).await.unwrap();
    let schedule = engine.create_schedule(new_schedule(capacity)).await.unwrap();
    (patient, schedule)
}

// ── Patients ─────────────────────────────────────────────

#[tokio::test]
async fn patient_roundtrip_by_sort_number() {
    let engine = test_engine("patient_roundtrip.wal");
    let created = engine.create_patient(new_patient(7)).await.unwrap();

    let found = engine.find_patients(Some(7)).await.unwrap();
    assert_eq!(found, vec![created.clone()]);
    assert_eq!(engine.get_patient(created.id).await.unwrap(), created);
    assert!(engine.find_patients(Some(8)).await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_sort_number_rejected() {
    let engine = test_engine("patient_duplicate.wal");
    engine.create_patient(new_patient(3)).await.unwrap();
    let err = engine.create_patient(new_patient(3)).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(3)));
    assert_eq!(engine.find_patients(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_patient_not_stored() {
    let engine = test_engine("patient_invalid.wal");
    let bad = NewPatient {
        name: "".into(),
        ..new_patient(1)
    };
    let err = engine.create_patient(bad).await.unwrap_err();
    match err {
        EngineError::ValidationFailed(v) => assert_eq!(v[0].field, "name"),
        other => panic!("expected ValidationFailed, got {other:?}"),
    }
    assert!(engine.find_patients(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn update_patient_partial() {
    let engine = test_engine("patient_update.wal");
    let created = engine.create_patient(new_patient(4)).await.unwrap();

    let patch = PatientPatch {
        age: Some(31),
        contact_number: Some("0899".into()),
        ..Default::default()
    };
    let updated = engine.update_patient(4, patch).await.unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.age, 31);
    assert_eq!(updated.name, created.name);
    assert_eq!(engine.get_patient(created.id).await.unwrap(), updated);
}

#[tokio::test]
async fn update_patient_checks_key_and_validity() {
    let engine = test_engine("patient_update_rejects.wal");
    engine.create_patient(new_patient(1)).await.unwrap();
    engine.create_patient(new_patient(2)).await.unwrap();

    let taken = PatientPatch {
        sort_number: Some(2),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_patient(1, taken).await,
        Err(EngineError::AlreadyExists(2))
    ));

    let negative = PatientPatch {
        age: Some(-4),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_patient(1, negative).await,
        Err(EngineError::ValidationFailed(_))
    ));
    assert_eq!(engine.find_patients(Some(1)).await.unwrap()[0].age, 30);

    assert!(matches!(
        engine.update_patient(99, PatientPatch::default()).await,
        Err(EngineError::NotFound(Entity::Patient, _))
    ));
}

#[tokio::test]
async fn delete_patient_by_sort_number() {
    let engine = test_engine("patient_delete.wal");
    engine.create_patient(new_patient(5)).await.unwrap();
    engine.delete_patient(5).await.unwrap();
    assert!(engine.find_patients(Some(5)).await.unwrap().is_empty());
    assert!(matches!(
        engine.delete_patient(5).await,
        Err(EngineError::NotFound(Entity::Patient, _))
    ));
}

// ── Schedules ────────────────────────────────────────────

#[tokio::test]
async fn schedule_create_get_list() {
    let engine = test_engine("schedule_crud.wal");
    let a = engine.create_schedule(new_schedule(3)).await.unwrap();
    let b = engine.create_schedule(new_schedule(4)).await.unwrap();
    assert_eq!(a.last_queue_number, 0);

    assert_eq!(engine.get_schedule(a.id).await.unwrap(), a);
    assert_eq!(engine.list_schedules().await.unwrap(), vec![a, b]);
    assert!(matches!(
        engine.get_schedule(Ulid::new()).await,
        Err(EngineError::NotFound(Entity::Schedule, _))
    ));
}

#[tokio::test]
async fn schedule_needs_positive_capacity() {
    let engine = test_engine("schedule_zero_capacity.wal");
    assert!(matches!(
        engine.create_schedule(new_schedule(0)).await,
        Err(EngineError::ValidationFailed(_))
    ));
    assert!(engine.list_schedules().await.unwrap().is_empty());
}

#[tokio::test]
async fn schedule_capacity_cannot_drop_below_active() {
    let engine = test_engine("schedule_shrink.wal");
    let (patient, schedule) = setup(&engine, 3).await;
    let first = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    engine.create_reservation(request(&patient, &schedule)).await.unwrap();

    let shrink = |capacity| SchedulePatch {
        capacity: Some(capacity),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_schedule(schedule.id, shrink(1)).await,
        Err(EngineError::ValidationFailed(_))
    ));

    // A cancelled reservation no longer counts
    engine
        .update_reservation_status(first.id, ReservationStatus::Cancelled)
        .await
        .unwrap();
    let updated = engine.update_schedule(schedule.id, shrink(1)).await.unwrap();
    assert_eq!(updated.capacity, 1);
    assert_eq!(updated.last_queue_number, 2);
    assert_eq!(engine.get_schedule(schedule.id).await.unwrap(), updated);
}

#[tokio::test]
async fn schedule_delete_blocked_by_reservations() {
    let engine = test_engine("schedule_delete.wal");
    let (patient, schedule) = setup(&engine, 2).await;
    let r = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    engine
        .update_reservation_status(r.id, ReservationStatus::Cancelled)
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_schedule(schedule.id).await,
        Err(EngineError::ScheduleInUse(_))
    ));

    engine.delete_reservation(r.id).await.unwrap();
    engine.delete_schedule(schedule.id).await.unwrap();
    assert!(matches!(
        engine.delete_schedule(schedule.id).await,
        Err(EngineError::NotFound(Entity::Schedule, _))
    ));
    assert!(engine.schedule_locks.is_empty());
}

// ── Reservations ─────────────────────────────────────────

#[test]
fn next_queue_number_uses_high_water() {
    assert_eq!(next_queue_number(&[], 0), 1);
    assert_eq!(next_queue_number(&[], 4), 5);
}

#[tokio::test]
async fn capacity_two_scenario() {
    let engine = test_engine("capacity_two.wal");
    let (patient, schedule) = setup(&engine, 2).await;

    let a = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    let b = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    assert_eq!((a.queue_number, b.queue_number), (1, 2));
    assert_eq!(a.status, ReservationStatus::AwaitingConfirmation);

    let err = engine
        .create_reservation(request(&patient, &schedule))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { capacity: 2, .. }));

    engine
        .update_reservation_status(a.id, ReservationStatus::Cancelled)
        .await
        .unwrap();
    let d = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    assert_eq!(d.queue_number, 3);

    // Cancellation does not renumber the others
    let numbers: Vec<u32> = engine
        .list_reservations_by_schedule(schedule.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.queue_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(engine.get_reservation(b.id).await.unwrap().queue_number, 2);
}

#[tokio::test]
async fn missing_references_rejected() {
    let engine = test_engine("reservation_missing_refs.wal");
    let (patient, schedule) = setup(&engine, 2).await;

    let unknown_schedule = NewReservation {
        schedule_id: Ulid::new().to_string(),
        ..request(&patient, &schedule)
    };
    assert!(matches!(
        engine.create_reservation(unknown_schedule).await,
        Err(EngineError::NotFound(Entity::Schedule, _))
    ));

    // Patient is checked before schedule
    let both_unknown = NewReservation {
        patient_id: Ulid::new().to_string(),
        schedule_id: Ulid::new().to_string(),
        status: None,
        reserved_at: None,
    };
    assert!(matches!(
        engine.create_reservation(both_unknown).await,
        Err(EngineError::NotFound(Entity::Patient, _))
    ));

    let malformed = NewReservation {
        patient_id: "not-an-id".into(),
        ..request(&patient, &schedule)
    };
    assert!(matches!(
        engine.create_reservation(malformed).await,
        Err(EngineError::MalformedIdentifier(id)) if id == "not-an-id"
    ));

    assert!(engine
        .list_reservations_by_schedule(schedule.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(engine.get_schedule(schedule.id).await.unwrap().last_queue_number, 0);
}

#[tokio::test]
async fn cannot_create_cancelled() {
    let engine = test_engine("reservation_create_cancelled.wal");
    let (patient, schedule) = setup(&engine, 2).await;
    let req = NewReservation {
        status: Some(ReservationStatus::Cancelled),
        ..request(&patient, &schedule)
    };
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::ValidationFailed(_))
    ));

    let confirmed = NewReservation {
        status: Some(ReservationStatus::Confirmed),
        ..request(&patient, &schedule)
    };
    let r = engine.create_reservation(confirmed).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.queue_number, 1);
}

#[tokio::test]
async fn status_state_machine() {
    use ReservationStatus::*;

    let engine = test_engine("reservation_transitions.wal");
    let (patient, schedule) = setup(&engine, 5).await;
    let r = engine.create_reservation(request(&patient, &schedule)).await.unwrap();

    let confirmed = engine.update_reservation_status(r.id, Confirmed).await.unwrap();
    assert_eq!(confirmed.status, Confirmed);

    // Same active status is a no-op
    let again = engine.update_reservation_status(r.id, Confirmed).await.unwrap();
    assert_eq!(again, confirmed);

    assert!(matches!(
        engine.update_reservation_status(r.id, AwaitingConfirmation).await,
        Err(EngineError::InvalidTransition {
            from: Confirmed,
            to: AwaitingConfirmation
        })
    ));

    engine.update_reservation_status(r.id, Cancelled).await.unwrap();
    for next in [Confirmed, AwaitingConfirmation, Cancelled] {
        assert!(matches!(
            engine.update_reservation_status(r.id, next).await,
            Err(EngineError::InvalidTransition { from: Cancelled, .. })
        ));
    }
    assert_eq!(engine.get_reservation(r.id).await.unwrap().status, Cancelled);
}

#[tokio::test]
async fn update_rejects_reference_changes() {
    let engine = test_engine("reservation_immutable.wal");
    let (patient, schedule) = setup(&engine, 5).await;
    let other = engine.create_schedule(new_schedule(5)).await.unwrap();
    let r = engine.create_reservation(request(&patient, &schedule)).await.unwrap();

    let moved = ReservationUpdate {
        schedule_id: Some(other.id.to_string()),
        status: Some(ReservationStatus::Confirmed),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_reservation(r.id, moved).await,
        Err(EngineError::ValidationFailed(_))
    ));
    // Nothing applied
    assert_eq!(engine.get_reservation(r.id).await.unwrap(), r);

    let at = Utc.with_ymd_and_hms(2024, 6, 1, 7, 30, 0).unwrap();
    let rescheduled = ReservationUpdate {
        reserved_at: Some(at),
        ..Default::default()
    };
    let updated = engine.update_reservation(r.id, rescheduled).await.unwrap();
    assert_eq!(updated.reserved_at, at);
    assert_eq!(updated.queue_number, r.queue_number);
}

#[tokio::test]
async fn delete_never_reuses_numbers() {
    let engine = test_engine("reservation_delete.wal");
    let (patient, schedule) = setup(&engine, 5).await;
    let a = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    let b = engine.create_reservation(request(&patient, &schedule)).await.unwrap();

    engine.delete_reservation(b.id).await.unwrap();
    assert!(matches!(
        engine.get_reservation(b.id).await,
        Err(EngineError::NotFound(Entity::Reservation, _))
    ));
    assert!(matches!(
        engine.delete_reservation(b.id).await,
        Err(EngineError::NotFound(Entity::Reservation, _))
    ));

    let c = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    assert_eq!(c.queue_number, 3);
    assert_eq!(engine.get_reservation(a.id).await.unwrap().queue_number, 1);
}

#[tokio::test]
async fn patient_listing_ordered_by_reserved_at() {
    let engine = test_engine("reservation_by_patient.wal");
    let (patient, schedule) = setup(&engine, 5).await;
    let other = engine.create_patient(new_patient(2)).await.unwrap();

    let at = |hour| Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap();
    let late = engine
        .create_reservation(NewReservation {
            reserved_at: Some(at(11)),
            ..request(&patient, &schedule)
        })
        .await
        .unwrap();
    let early = engine
        .create_reservation(NewReservation {
            reserved_at: Some(at(9)),
            ..request(&patient, &schedule)
        })
        .await
        .unwrap();
    engine.create_reservation(request(&other, &schedule)).await.unwrap();

    let listed = engine.list_reservations_by_patient(patient.id).await.unwrap();
    assert_eq!(listed, vec![early, late]);
    assert!(engine
        .list_reservations_by_patient(Ulid::new())
        .await
        .unwrap()
        .is_empty());
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_respect_capacity() {
    let engine = Arc::new(test_engine("concurrent_capacity.wal"));
    let (patient, schedule) = setup(&engine, 7).await;

    let n = 30;
    let mut handles = Vec::new();
    for _ in 0..n {
        let eng = engine.clone();
        let req = request(&patient, &schedule);
        handles.push(tokio::spawn(async move { eng.create_reservation(req).await }));
    }

    let mut numbers = Vec::new();
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(r) => numbers.push(r.queue_number),
            Err(EngineError::CapacityExceeded { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    numbers.sort_unstable();
    assert_eq!(numbers, (1..=7).collect::<Vec<u32>>());
    assert_eq!(rejected, n - 7);
    assert_eq!(engine.get_schedule(schedule.id).await.unwrap().last_queue_number, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_across_schedules_are_independent() {
    let engine = Arc::new(test_engine("concurrent_schedules.wal"));
    let patient = engine.create_patient(new_patient(1)).await.unwrap();
    let mut schedules = Vec::new();
    for _ in 0..4 {
        schedules.push(engine.create_schedule(new_schedule(10)).await.unwrap());
    }

    let futures = schedules.iter().flat_map(|s| {
        let engine = engine.clone();
        let req = request(&patient, s);
        (0..10).map(move |_| {
            let engine = engine.clone();
            let req = req.clone();
            async move { engine.create_reservation(req).await }
        })
    });
    let results = futures::future::join_all(futures).await;
    assert!(results.iter().all(Result::is_ok));

    for s in &schedules {
        let numbers: HashSet<u32> = engine
            .list_reservations_by_schedule(s.id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.queue_number)
            .collect();
        assert_eq!(numbers, (1..=10).collect::<HashSet<u32>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_apply_once() {
    let engine = Arc::new(test_engine("concurrent_cancel.wal"));
    let (patient, schedule) = setup(&engine, 1).await;
    let r = engine.create_reservation(request(&patient, &schedule)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.update_reservation_status(r.id, ReservationStatus::Cancelled)
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::InvalidTransition { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 1);

    // The freed slot is reusable exactly once
    tokio_test::assert_ok!(engine.create_reservation(request(&patient, &schedule)).await);
    tokio_test::assert_err!(engine.create_reservation(request(&patient, &schedule)).await);
}

#[tokio::test]
async fn held_lock_times_out_as_contention() {
    let path = test_wal_path("contention.wal");
    let (_store, engine) = engine_at(&path, Duration::from_millis(50));
    let (patient, schedule) = setup(&engine, 3).await;

    let held = engine.lock_schedule(schedule.id).await.unwrap();
    assert!(matches!(
        engine.create_reservation(request(&patient, &schedule)).await,
        Err(EngineError::Contention(_))
    ));
    drop(held);

    let r = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    assert_eq!(r.queue_number, 1);
}

/// Delegates to a `WalStore` but can be told to fail every read.
struct FailingReads {
    inner: Arc<WalStore>,
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl DocumentStore for FailingReads {
    async fn insert(&self, collection: Collection, doc: Document) -> Result<Ulid, StoreError> {
        self.inner.insert(collection, doc).await
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Wal("read failed".into()));
        }
        self.inner.find_one(collection, filter).await
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Document>, StoreError> {
        self.inner.find_many(collection, filter).await
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Document,
    ) -> Result<u64, StoreError> {
        self.inner.update_one(collection, filter, fields).await
    }

    async fn delete_one(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.delete_one(collection, filter).await
    }
}

#[tokio::test]
async fn schedule_lock_kept_when_read_fails() {
    let store = Arc::new(FailingReads {
        inner: Arc::new(WalStore::open(&test_wal_path("failing_reads.wal")).unwrap()),
        failing: AtomicBool::new(false),
    });
    let engine = Engine::new(store.clone(), Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS));
    let schedule = engine.create_schedule(new_schedule(2)).await.unwrap();

    let (guard, _) = engine.schedule_locked(schedule.id).await.unwrap();
    drop(guard);
    let lock = engine.schedule_locks.get(&schedule.id).unwrap().clone();

    store.failing.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine.schedule_locked(schedule.id).await,
        Err(EngineError::Store(_))
    ));
    // A transient failure must not split the schedule onto a second mutex
    let after = engine.schedule_locks.get(&schedule.id).unwrap().clone();
    assert!(Arc::ptr_eq(&lock, &after));

    store.failing.store(false, Ordering::SeqCst);
    let gone = Ulid::new();
    assert!(matches!(
        engine.schedule_locked(gone).await,
        Err(EngineError::NotFound(Entity::Schedule, _))
    ));
    assert!(!engine.schedule_locks.contains_key(&gone));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("engine_reopen.wal");
    let timeout = Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS);

    let (store, engine) = engine_at(&path, timeout);
    let (patient, schedule) = setup(&engine, 4).await;
    let a = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    let b = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    engine
        .update_reservation_status(a.id, ReservationStatus::Confirmed)
        .await
        .unwrap();
    engine.delete_reservation(b.id).await.unwrap();
    store.close().await.unwrap();
    drop(engine);

    let (_store, engine) = engine_at(&path, timeout);
    assert_eq!(engine.find_patients(Some(1)).await.unwrap(), vec![patient.clone()]);
    assert_eq!(
        engine.get_reservation(a.id).await.unwrap().status,
        ReservationStatus::Confirmed
    );
    let c = engine.create_reservation(request(&patient, &schedule)).await.unwrap();
    assert_eq!(c.queue_number, 3);
}
