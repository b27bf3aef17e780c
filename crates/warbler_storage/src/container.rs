//! StatusContainer: one namespace's store, indexes, batcher and
//! collaborators behind a single API.
//!
//! ## Commit path
//! ```text
//! submit(draft) ─ validate ─► WriteBatcher ─[flush section]─► commit_one
//!                                                              ├─ PrimaryStore.insert
//!                                                              ├─ SecondaryIndexes.index
//!                                                              └─ unpersisted.push(Added)
//!                       section released ─► observers.on_added
//! persist() ─► Durability.commit(unpersisted)   (embedding system or timer)
//! ```
//!
//! Changes between a flush and the next successful `persist()` live only in
//! memory and are lost on crash.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use warbler_common::clock::{Clock, SystemClock};
use warbler_common::config::BatchConfig;
use warbler_common::error::StorageError;
use warbler_common::types::{Namespace, StatusId};

use crate::batcher::{BatchStatsSnapshot, BatcherState, FlushOutcome, WriteBatcher};
use crate::durability::{Change, Durability, NullDurability};
use crate::index::{DimensionKeys, SecondaryIndexes};
use crate::observer::{StatusAdded, StatusObserver};
use crate::primary::{IdRange, PrimaryStore};
use crate::query::QueryEngine;
use crate::record::{StatusDraft, StatusUpdate};

/// What `submit` did with the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Batching is off; the update was committed under `id`.
    Written { id: StatusId },
    /// The submit triggered a flush that committed `written` updates,
    /// this one included.
    Flushed { written: usize },
    /// Queued; a later submit or the fallback timer will commit it.
    Queued,
}

impl SubmitOutcome {
    /// True when the call wrote into the store.
    pub fn wrote(&self) -> bool {
        !matches!(self, SubmitOutcome::Queued)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub records: usize,
    pub pending: usize,
    pub unpersisted: usize,
    pub id_collisions: u64,
    pub batch: BatchStatsSnapshot,
}

pub struct StatusContainerBuilder {
    namespace: Namespace,
    batch: BatchConfig,
    durability: Arc<dyn Durability>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn StatusObserver>>,
}

impl StatusContainerBuilder {
    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn durability(mut self, durability: Arc<dyn Durability>) -> Self {
        self.durability = durability;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Arc<StatusContainer> {
        tracing::debug!(
            namespace = %self.namespace,
            batch_window_ms = self.batch.batch_window_ms,
            durability = self.durability.name(),
            "status container created"
        );
        Arc::new_cyclic(|weak_self| StatusContainer {
            batcher: WriteBatcher::new(self.batch, Arc::clone(&self.clock)),
            namespace: self.namespace,
            store: PrimaryStore::new(),
            indexes: SecondaryIndexes::new(),
            durability: self.durability,
            clock: self.clock,
            observers: RwLock::new(self.observers),
            unpersisted: Mutex::new(Vec::new()),
            persist_lock: Mutex::new(()),
            weak_self: weak_self.clone(),
        })
    }
}

pub struct StatusContainer {
    namespace: Namespace,
    store: PrimaryStore,
    indexes: SecondaryIndexes,
    batcher: WriteBatcher,
    durability: Arc<dyn Durability>,
    clock: Arc<dyn Clock>,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
    /// Committed changes not yet accepted by `durability`, in commit order.
    unpersisted: Mutex<Vec<Change>>,
    /// Serializes `persist()` so changes reach `durability` in order.
    persist_lock: Mutex<()>,
    /// Handed to the fallback timer so a pending timer never keeps the
    /// container alive.
    weak_self: Weak<StatusContainer>,
}

impl StatusContainer {
    pub fn builder(namespace: impl Into<Namespace>) -> StatusContainerBuilder {
        StatusContainerBuilder {
            namespace: namespace.into(),
            batch: BatchConfig::default(),
            durability: Arc::new(NullDurability),
            clock: Arc::new(SystemClock),
            observers: Vec::new(),
        }
    }

    /// In-memory container on the system clock.
    pub fn new(namespace: impl Into<Namespace>, batch: BatchConfig) -> Arc<Self> {
        Self::builder(namespace).batch(batch).build()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Validate and submit one status update.
    ///
    /// Invalid drafts are rejected before anything is queued. With batching
    /// enabled the update is queued, the fallback timer is armed if idle,
    /// and the queue is flushed if the batch window has elapsed.
    pub fn submit(&self, draft: StatusDraft) -> Result<SubmitOutcome, StorageError> {
        let update = draft.validate(self.clock.as_ref())?;

        if self.batcher.is_synchronous() {
            let record = self
                .batcher
                .write_through(update, |u| self.commit_one(u))?;
            let id = record.id();
            self.notify(std::slice::from_ref(&record));
            return Ok(SubmitOutcome::Written { id });
        }

        self.batcher.enqueue(update);
        let weak = self.weak_self.clone();
        self.batcher.arm_fallback(move || {
            if let Some(container) = weak.upgrade() {
                container.scheduled_flush();
            }
        });

        match self.autoflush() {
            0 => Ok(SubmitOutcome::Queued),
            written => Ok(SubmitOutcome::Flushed { written }),
        }
    }

    /// Flush if more than the batch window has passed since the last flush.
    /// Returns the number of updates written.
    pub fn autoflush(&self) -> usize {
        match self.batcher.flush_if_due(|u| self.commit_one(u)) {
            Some(outcome) => self.finish_flush(outcome),
            None => 0,
        }
    }

    /// Commit everything queued now. Returns the number of updates written;
    /// an empty queue is a no-op that still resets the batch window.
    pub fn flush(&self) -> usize {
        let outcome = self.batcher.flush_with(|u| self.commit_one(u));
        self.finish_flush(outcome)
    }

    /// Fallback timer entry point: runs outside any caller, so it persists
    /// its own writes. Failures are logged and left for the next `persist()`.
    fn scheduled_flush(&self) {
        self.batcher.note_timer_fired();
        let written = self.flush();
        if written == 0 {
            return;
        }
        if let Err(e) = self.persist() {
            tracing::error!(
                namespace = %self.namespace,
                "persist after scheduled flush failed, {} changes kept: {}",
                self.unpersisted_len(),
                e
            );
        }
    }

    // Runs inside the flush section.
    fn commit_one(&self, update: StatusUpdate) -> Result<Arc<StatusUpdate>, StorageError> {
        let record = self.store.insert(update)?;
        self.indexes.index(&record);
        self.unpersisted
            .lock()
            .push(Change::Added(Arc::clone(&record)));
        Ok(record)
    }

    fn finish_flush(&self, outcome: FlushOutcome) -> usize {
        self.notify(&outcome.committed);
        outcome.written
    }

    fn notify(&self, records: &[Arc<StatusUpdate>]) {
        if records.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        for record in records {
            let event = StatusAdded {
                record: Arc::clone(record),
                id: record.id(),
                parent: self.namespace.clone(),
            };
            for observer in &observers {
                observer.on_added(&event);
            }
        }
    }

    /// Hand committed changes to the durability collaborator.
    /// Returns how many were persisted. On failure nothing is dropped: the
    /// changes stay queued, ahead of any committed since.
    pub fn persist(&self) -> Result<usize, StorageError> {
        let _persisting = self.persist_lock.lock();
        let changes = std::mem::take(&mut *self.unpersisted.lock());
        if changes.is_empty() {
            return Ok(0);
        }
        match self.durability.commit(&changes) {
            Ok(()) => {
                tracing::debug!(
                    namespace = %self.namespace,
                    "persisted {} changes",
                    changes.len()
                );
                Ok(changes.len())
            }
            Err(e) => {
                let mut pending = self.unpersisted.lock();
                let newer = std::mem::replace(&mut *pending, changes);
                pending.extend(newer);
                tracing::warn!(
                    namespace = %self.namespace,
                    "persist failed, {} changes kept for retry: {}",
                    pending.len(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Flush the queue and persist. Returns the number of changes persisted.
    pub fn close(&self) -> Result<usize, StorageError> {
        let written = self.flush();
        let persisted = self.persist()?;
        tracing::info!(
            namespace = %self.namespace,
            written,
            persisted,
            "status container closed"
        );
        Ok(persisted)
    }

    /// Drop every committed update together with its index entries.
    /// Pending updates stay queued. Returns the number removed.
    pub fn clear(&self) -> usize {
        let removed = self.batcher.exclusive(|| {
            let n = self.store.clear();
            self.indexes.clear();
            self.unpersisted.lock().push(Change::Cleared);
            n
        });
        tracing::info!(namespace = %self.namespace, removed, "status container cleared");
        removed
    }

    /// Re-apply journaled changes without notifying observers or marking
    /// them unpersisted. An `Added` already present with identical content
    /// is skipped, so a journal holding a retried commit replays cleanly.
    pub fn replay<I>(&self, changes: I) -> Result<usize, StorageError>
    where
        I: IntoIterator<Item = Change>,
    {
        self.batcher.exclusive(|| {
            let mut applied = 0usize;
            for change in changes {
                match change {
                    Change::Added(record) => {
                        if self.store.get(record.id()).as_deref() == Some(&*record) {
                            continue;
                        }
                        let stored = self.store.insert(StatusUpdate::clone(&record))?;
                        self.indexes.index(&stored);
                    }
                    Change::Cleared => {
                        self.store.clear();
                        self.indexes.clear();
                    }
                }
                applied += 1;
            }
            Ok(applied)
        })
    }

    // ── Read path ───────────────────────────────────────────────────────

    pub fn get(&self, id: StatusId) -> Option<Arc<StatusUpdate>> {
        self.store.get(id)
    }

    pub fn contains(&self, id: StatusId) -> bool {
        self.store.contains(id)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn query(&self) -> QueryEngine<'_> {
        QueryEngine::new(&self.store, &self.indexes)
    }

    pub fn keys(&self, range: IdRange) -> Vec<StatusId> {
        self.query().keys(range)
    }

    pub fn values(&self, range: IdRange) -> Vec<Arc<StatusUpdate>> {
        self.query().values(range)
    }

    pub fn items(&self, range: IdRange) -> Vec<(StatusId, Arc<StatusUpdate>)> {
        self.query().items(range)
    }

    pub fn filtered_keys(&self, keys: impl Into<DimensionKeys>, range: IdRange) -> Vec<StatusId> {
        self.query().filtered_keys(keys, range)
    }

    pub fn filtered_values(
        &self,
        keys: impl Into<DimensionKeys>,
        range: IdRange,
    ) -> Vec<Arc<StatusUpdate>> {
        self.query().filtered_values(keys, range)
    }

    pub fn filtered_items(
        &self,
        keys: impl Into<DimensionKeys>,
        range: IdRange,
    ) -> Vec<(StatusId, Arc<StatusUpdate>)> {
        self.query().filtered_items(keys, range)
    }

    // ── Rejected raw mutations ──────────────────────────────────────────

    pub fn put(&self, key: StatusId, value: StatusUpdate) -> Result<(), StorageError> {
        self.store.put(key, value)
    }

    pub fn set_default(
        &self,
        key: StatusId,
        value: StatusUpdate,
    ) -> Result<Arc<StatusUpdate>, StorageError> {
        self.store.set_default(key, value)
    }

    pub fn pop(&self, key: StatusId) -> Result<Arc<StatusUpdate>, StorageError> {
        self.store.pop(key)
    }

    pub fn merge<I>(&self, entries: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = (StatusId, StatusUpdate)>,
    {
        self.store.merge(entries)
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.observers.write().push(observer);
    }

    pub fn state(&self) -> BatcherState {
        self.batcher.state()
    }

    pub fn pending_len(&self) -> usize {
        self.batcher.pending_len()
    }

    pub fn unpersisted_len(&self) -> usize {
        self.unpersisted.lock().len()
    }

    pub fn batch_config(&self) -> &BatchConfig {
        self.batcher.config()
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            records: self.store.len(),
            pending: self.batcher.pending_len(),
            unpersisted: self.unpersisted_len(),
            id_collisions: self.store.allocator().collisions(),
            batch: self.batcher.stats(),
        }
    }
}

impl Drop for StatusContainer {
    fn drop(&mut self) {
        let pending = self.batcher.pending_len();
        let unpersisted = self.unpersisted.get_mut().len();
        if pending > 0 || unpersisted > 0 {
            tracing::warn!(
                namespace = %self.namespace,
                pending,
                unpersisted,
                "status container dropped without close(); these changes are lost"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warbler_common::clock::ManualClock;

    struct FailingDurability {
        fail: std::sync::atomic::AtomicBool,
        seen: Mutex<Vec<Change>>,
    }

    impl Durability for FailingDurability {
        fn commit(&self, changes: &[Change]) -> Result<(), StorageError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Durability("disk unavailable".into()));
            }
            self.seen.lock().extend(changes.iter().cloned());
            Ok(())
        }
    }

    fn manual(window_ms: u64) -> (Arc<StatusContainer>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(5_000_000));
        let c = StatusContainer::builder("test")
            .batch(BatchConfig::with_window_ms(window_ms))
            .clock(clock.clone())
            .build();
        (c, clock)
    }

    #[test]
    fn test_synchronous_submit_is_visible_immediately() {
        let c = StatusContainer::new("sync", BatchConfig::synchronous());
        let outcome = c.submit(StatusDraft::new("a", "now").with_id(42)).unwrap();
        assert_eq!(outcome, SubmitOutcome::Written { id: StatusId(42) });
        assert!(outcome.wrote());
        assert_eq!(c.get(StatusId(42)).unwrap().author(), "a");
        assert_eq!(c.state(), BatcherState::Idle);
    }

    #[test]
    fn test_invalid_draft_is_not_enqueued() {
        let (c, _clock) = manual(1000);
        let err = c.submit(StatusDraft::default()).unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert_eq!(c.pending_len(), 0);
        assert_eq!(c.stats().batch.submitted, 0);
    }

    #[test]
    fn test_queue_then_flush_on_next_due_submit() {
        let (c, clock) = manual(60_000);
        assert_eq!(c.submit(StatusDraft::new("a", "1")).unwrap(), SubmitOutcome::Flushed { written: 1 });

        clock.advance_millis(10);
        assert_eq!(c.submit(StatusDraft::new("a", "2")).unwrap(), SubmitOutcome::Queued);
        clock.advance_millis(10);
        assert_eq!(c.submit(StatusDraft::new("a", "3")).unwrap(), SubmitOutcome::Queued);
        assert_eq!(c.len(), 1);
        assert_eq!(c.state(), BatcherState::Queued);

        clock.advance_millis(60_000);
        assert_eq!(c.submit(StatusDraft::new("a", "4")).unwrap(), SubmitOutcome::Flushed { written: 3 });
        assert_eq!(c.len(), 4);
        c.close().unwrap();
    }

    #[test]
    fn test_observers_fire_once_per_commit_and_may_reenter() {
        let c = StatusContainer::new("obs", BatchConfig::synchronous());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let weak = Arc::downgrade(&c);
        c.subscribe(Arc::new(move |event: &StatusAdded| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(event.parent.as_str(), "obs");
            assert_eq!(event.id, event.record.id());
            // echo once; runs after the flush section is released
            if event.record.author() == "a" {
                if let Some(c) = weak.upgrade() {
                    c.submit(StatusDraft::new("echo", "re")).unwrap();
                }
            }
        }));
        c.submit(StatusDraft::new("a", "hi")).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(c.len(), 2);

        // empty flush notifies nobody
        c.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_persist_failure_keeps_changes_in_order() {
        let durability = Arc::new(FailingDurability {
            fail: std::sync::atomic::AtomicBool::new(true),
            seen: Mutex::new(Vec::new()),
        });
        let c = StatusContainer::builder("p")
            .batch(BatchConfig::synchronous())
            .durability(durability.clone())
            .build();
        c.submit(StatusDraft::new("a", "1").with_id(1)).unwrap();
        assert!(c.persist().is_err());
        assert_eq!(c.unpersisted_len(), 1);

        c.submit(StatusDraft::new("a", "2").with_id(2)).unwrap();
        durability.fail.store(false, Ordering::SeqCst);
        assert_eq!(c.persist().unwrap(), 2);
        assert_eq!(c.unpersisted_len(), 0);

        let seen = durability.seen.lock();
        let ids: Vec<u64> = seen
            .iter()
            .filter_map(|ch| match ch {
                Change::Added(u) => Some(u.id().0),
                Change::Cleared => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_clear_empties_store_and_indexes_but_not_queue() {
        let (c, _clock) = manual(60_000);
        c.submit(StatusDraft::new("a", "1").with_tag("x")).unwrap();
        c.submit(StatusDraft::new("a", "2").with_tag("x")).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.pending_len(), 1);

        assert_eq!(c.clear(), 1);
        assert!(c.is_empty());
        assert!(c.filtered_keys("x", IdRange::all()).is_empty());
        assert_eq!(c.pending_len(), 1);

        assert_eq!(c.flush(), 1);
        assert_eq!(c.filtered_keys("a", IdRange::all()).len(), 1);
    }

    #[test]
    fn test_replay_skips_identical_duplicates() {
        let c = StatusContainer::new("r", BatchConfig::synchronous());
        let u = StatusDraft::new("a", "x")
            .with_id(7)
            .validate(&ManualClock::new(0))
            .unwrap();
        let added = Change::Added(Arc::new(u));
        let applied = c
            .replay(vec![added.clone(), added.clone(), added])
            .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(c.len(), 1);
        assert_eq!(c.unpersisted_len(), 0);
    }

    #[test]
    fn test_rejected_mutations_delegate() {
        let c = StatusContainer::new("m", BatchConfig::synchronous());
        let u = StatusDraft::new("a", "x")
            .validate(&ManualClock::new(1))
            .unwrap();
        assert!(matches!(
            c.put(StatusId(1), u),
            Err(StorageError::UnsupportedOperation { operation: "put", .. })
        ));
        assert!(c.pop(StatusId(1)).is_err());
        assert!(c.is_empty());
    }
}
