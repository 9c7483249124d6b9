use std::io;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{error, info};
use ulid::{Generator, Ulid};

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::{Collection, Event};
use crate::wal::Wal;

use super::{Document, DocumentStore, Filter, ID_FIELD, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

type Batch = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first command arrives.
/// 2. Buffer every immediately available Append (the batch window).
/// 3. Single flush_sync for the whole batch, then answer all senders.
/// 4. Run the non-append command that ended the window, if any.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let next = match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                pending
            }
            other => Some(other),
        };

        if let Some(cmd) = next
            && !handle_command(&mut wal, cmd)
        {
            break;
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Batch) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &Batch) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Batch, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false once the writer should stop.
fn handle_command(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            return false;
        }
    }
    true
}

/// In-memory document collections made durable by a write-ahead log.
///
/// Reads are lock-free. Writes to one collection are serialized so WAL
/// order equals apply order; different collections write independently.
pub struct WalStore {
    collections: [DashMap<Ulid, Document>; 3],
    write_locks: [Mutex<()>; 3],
    ids: StdMutex<Generator>,
    wal_tx: mpsc::Sender<WalCommand>,
    closed: AtomicBool,
}

impl WalStore {
    /// Replay the WAL at `path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            collections: std::array::from_fn(|_| DashMap::new()),
            write_locks: std::array::from_fn(|_| Mutex::new(())),
            ids: StdMutex::new(Generator::new()),
            wal_tx,
            closed: AtomicBool::new(false),
        };
        for event in &events {
            store.replay_event(event).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("replaying {} event: {e}", event.collection().name()),
                )
            })?;
        }
        info!(
            "store opened from {}: {} events, {} patients, {} schedules, {} reservations",
            path.display(),
            events.len(),
            store.count(Collection::Patients),
            store.count(Collection::Schedules),
            store.count(Collection::Reservations),
        );
        Ok(store)
    }

    fn replay_event(&self, event: &Event) -> Result<(), StoreError> {
        match event {
            Event::Inserted {
                collection,
                id,
                body,
            }
            | Event::Updated {
                collection,
                id,
                body,
            } => {
                let doc: Document = serde_json::from_str(body)?;
                self.map(*collection).insert(*id, doc);
            }
            Event::Deleted { collection, id } => {
                self.map(*collection).remove(id);
            }
        }
        Ok(())
    }

    fn map(&self, collection: Collection) -> &DashMap<Ulid, Document> {
        &self.collections[collection.index()]
    }

    fn write_lock(&self, collection: Collection) -> &Mutex<()> {
        &self.write_locks[collection.index()]
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.map(collection).len()
    }

    fn next_id(&self) -> Ulid {
        match self.ids.lock() {
            Ok(mut generator) => generator.generate().unwrap_or_else(|_| Ulid::new()),
            Err(_) => Ulid::new(),
        }
    }

    /// Matching documents ordered by id, i.e. insertion order.
    fn matching(&self, collection: Collection, filter: &Filter) -> Vec<(Ulid, Document)> {
        let map = self.map(collection);
        if let Some(id) = filter.id() {
            return map
                .get(&id)
                .map(|doc| vec![(id, doc.value().clone())])
                .unwrap_or_default();
        }
        let mut hits: Vec<(Ulid, Document)> = map
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        hits.sort_by_key(|(id, _)| *id);
        hits
    }

    fn first_match(&self, collection: Collection, filter: &Filter) -> Option<(Ulid, Document)> {
        let map = self.map(collection);
        let id = match filter.id() {
            Some(id) => id,
            None => map
                .iter()
                .filter(|e| filter.matches(e.value()))
                .map(|e| *e.key())
                .min()?,
        };
        map.get(&id).map(|doc| (id, doc.value().clone()))
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Rewrite the WAL with one insert per live document.
    pub async fn compact(&self) -> Result<(), StoreError> {
        // Hold every collection's write lock so no append lands between
        // the snapshot and the file swap.
        let mut guards = Vec::with_capacity(self.write_locks.len());
        for lock in &self.write_locks {
            guards.push(lock.lock().await);
        }

        let mut events = Vec::new();
        for collection in Collection::ALL {
            for (id, doc) in self.matching(collection, &Filter::new()) {
                events.push(Event::Inserted {
                    collection,
                    id,
                    body: serde_json::to_string(&doc)?,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Flush and stop the WAL writer. Later writes fail with `Closed`;
    /// reads keep serving the in-memory state.
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        info!("store closed");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for WalStore {
    async fn insert(&self, collection: Collection, mut doc: Document) -> Result<Ulid, StoreError> {
        let _guard = self.write_lock(collection).lock().await;
        let id = self.next_id();
        doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        let body = serde_json::to_string(&doc)?;
        self.wal_append(Event::Inserted {
            collection,
            id,
            body,
        })
        .await?;
        self.map(collection).insert(id, doc);
        Ok(id)
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.first_match(collection, filter).map(|(_, doc)| doc))
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .matching(collection, filter)
            .into_iter()
            .map(|(_, doc)| doc)
            .collect())
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        fields: Document,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock(collection).lock().await;
        let Some((id, mut doc)) = self.first_match(collection, filter) else {
            return Ok(0);
        };
        for (field, value) in fields {
            if field != ID_FIELD {
                doc.insert(field, value);
            }
        }
        let body = serde_json::to_string(&doc)?;
        self.wal_append(Event::Updated {
            collection,
            id,
            body,
        })
        .await?;
        self.map(collection).insert(id, doc);
        Ok(1)
    }

    async fn delete_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock(collection).lock().await;
        let Some((id, _)) = self.first_match(collection, filter) else {
            return Ok(0);
        };
        self.wal_append(Event::Deleted { collection, id }).await?;
        self.map(collection).remove(&id);
        Ok(1)
    }
}
