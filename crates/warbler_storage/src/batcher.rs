//! Write batcher. Defers commits into the primary store to bound write
//! frequency without losing updates.
//!
//! Submitting threads push into the lock-free [`PendingQueue`] and then call
//! `autoflush()`, which commits the whole queue once the batch window has
//! elapsed since the previous flush. Under steady traffic the next submit
//! performs the flush; with no further traffic the fallback timer does.
//!
//! ```text
//! submit ─► queue.push ─► arm_fallback (if none) ─► autoflush
//!                                                      │ due?
//!                                  ┌───────────────────┘
//!                                  ▼
//!               [flush section] last_flush = now, disarm timer,
//!                               drain (id order), commit each
//! ```
//!
//! The flush section is the only writer into the store. A timer that fires
//! after a submit-driven flush superseded it finds an empty queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use warbler_common::clock::Clock;
use warbler_common::config::BatchConfig;
use warbler_common::error::StorageError;

use crate::queue::PendingQueue;
use crate::record::StatusUpdate;
use crate::timer::FallbackTimer;

/// Observable batcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    /// Nothing pending.
    Idle,
    /// Records are waiting for the next flush.
    Queued,
    /// A flush is draining the queue right now.
    Flushing,
}

/// Result of one flush.
#[derive(Debug, Clone, Default)]
pub struct FlushOutcome {
    /// Records committed into the store.
    pub written: usize,
    /// Records dropped because they could not be committed.
    pub rejected: usize,
    /// The committed records with their final ids, in commit order.
    pub committed: Vec<Arc<StatusUpdate>>,
}

impl FlushOutcome {
    /// True when the flush actually wrote something.
    pub fn wrote(&self) -> bool {
        self.written > 0
    }
}

// ── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct BatchStats {
    pub submitted: AtomicU64,
    /// Flushes that ran, including empty ones.
    pub flushes: AtomicU64,
    pub empty_flushes: AtomicU64,
    pub records_flushed: AtomicU64,
    pub rejected: AtomicU64,
    pub largest_batch: AtomicU64,
    pub timers_armed: AtomicU64,
    pub timers_fired: AtomicU64,
    /// Timers cleared by a flush, including the flush a timer triggers itself.
    pub timers_disarmed: AtomicU64,
}

impl BatchStats {
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            empty_flushes: self.empty_flushes.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
            timers_armed: self.timers_armed.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            timers_disarmed: self.timers_disarmed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BatchStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStatsSnapshot {
    pub submitted: u64,
    pub flushes: u64,
    pub empty_flushes: u64,
    pub records_flushed: u64,
    pub rejected: u64,
    pub largest_batch: u64,
    pub timers_armed: u64,
    pub timers_fired: u64,
    pub timers_disarmed: u64,
}

// ── Batcher ────────────────────────────────────────────────────────────────

/// State guarded by the exclusive flush section.
struct FlushSection {
    timer: Option<FallbackTimer>,
}

pub struct WriteBatcher {
    config: BatchConfig,
    queue: PendingQueue,
    section: Mutex<FlushSection>,
    /// Wall-clock ms of the last flush. Starts at 0, so the first submit
    /// after a quiet period flushes immediately.
    last_flush_ms: AtomicU64,
    flushing: AtomicBool,
    clock: Arc<dyn Clock>,
    stats: BatchStats,
}

impl WriteBatcher {
    pub fn new(config: BatchConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            queue: PendingQueue::new(),
            section: Mutex::new(FlushSection { timer: None }),
            last_flush_ms: AtomicU64::new(0),
            flushing: AtomicBool::new(false),
            clock,
            stats: BatchStats::default(),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Window zero: every submit commits before returning.
    pub fn is_synchronous(&self) -> bool {
        self.config.is_synchronous()
    }

    /// Queue a validated update for the next flush.
    pub fn enqueue(&self, update: StatusUpdate) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.queue.push(update);
    }

    /// Commit one update immediately under the flush section.
    /// Used when batching is disabled.
    pub fn write_through<F>(
        &self,
        update: StatusUpdate,
        commit: F,
    ) -> Result<Arc<StatusUpdate>, StorageError>
    where
        F: FnOnce(StatusUpdate) -> Result<Arc<StatusUpdate>, StorageError>,
    {
        let _section = self.section.lock();
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let result = commit(update);
        match &result {
            Ok(_) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats.records_flushed.fetch_add(1, Ordering::Relaxed);
                self.last_flush_ms
                    .store(self.clock.now_millis(), Ordering::Release);
            }
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Arm the fallback timer unless one is already armed.
    /// Returns true if a new timer was started.
    ///
    /// If the timer thread cannot be spawned the batcher keeps working:
    /// pending records are then flushed only by later submits or an explicit
    /// `flush()`.
    pub fn arm_fallback<F>(&self, on_fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_synchronous() {
            return false;
        }
        let mut section = self.section.lock();
        if section.timer.is_some() {
            return false;
        }
        let delay = self.config.fallback_delay();
        match FallbackTimer::start(delay, on_fire) {
            Ok(timer) => {
                section.timer = Some(timer);
                self.stats.timers_armed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(delay_ms = delay.as_millis() as u64, "fallback timer armed");
                true
            }
            Err(e) => {
                tracing::error!("failed to spawn fallback flush timer: {}", e);
                false
            }
        }
    }

    pub fn has_armed_timer(&self) -> bool {
        self.section.lock().timer.is_some()
    }

    /// Called from the timer callback before it flushes.
    pub fn note_timer_fired(&self) {
        self.stats.timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// True when more than the batch window has passed since the last flush.
    pub fn is_due(&self) -> bool {
        self.due_at(self.clock.now_millis())
    }

    fn due_at(&self, now_ms: u64) -> bool {
        let last = self.last_flush_ms.load(Ordering::Acquire);
        now_ms.saturating_sub(last) > self.config.batch_window_ms
    }

    /// Flush only if the batch window has elapsed. `None` means not due.
    ///
    /// The due check is repeated inside the flush section so that submitters
    /// racing past the first check coalesce into a single flush.
    pub fn flush_if_due<F>(&self, commit: F) -> Option<FlushOutcome>
    where
        F: FnMut(StatusUpdate) -> Result<Arc<StatusUpdate>, StorageError>,
    {
        if !self.is_due() {
            return None;
        }
        self.run_flush(true, commit)
    }

    /// Drain and commit everything queued at this moment.
    pub fn flush_with<F>(&self, commit: F) -> FlushOutcome
    where
        F: FnMut(StatusUpdate) -> Result<Arc<StatusUpdate>, StorageError>,
    {
        self.run_flush(false, commit).unwrap_or_default()
    }

    fn run_flush<F>(&self, only_if_due: bool, mut commit: F) -> Option<FlushOutcome>
    where
        F: FnMut(StatusUpdate) -> Result<Arc<StatusUpdate>, StorageError>,
    {
        let mut section = self.section.lock();
        let now = self.clock.now_millis();
        if only_if_due && !self.due_at(now) {
            return None;
        }

        self.flushing.store(true, Ordering::Release);
        self.last_flush_ms.store(now, Ordering::Release);
        if let Some(timer) = section.timer.take() {
            timer.cancel();
            self.stats.timers_disarmed.fetch_add(1, Ordering::Relaxed);
        }

        let batch = self.queue.drain();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        if batch.is_empty() {
            self.stats.empty_flushes.fetch_add(1, Ordering::Relaxed);
            self.flushing.store(false, Ordering::Release);
            return Some(FlushOutcome::default());
        }

        let drained = batch.len();
        let mut outcome = FlushOutcome {
            committed: Vec::with_capacity(drained),
            ..FlushOutcome::default()
        };
        for update in batch {
            let requested = update.id();
            match commit(update) {
                Ok(record) => outcome.committed.push(record),
                Err(e) => {
                    tracing::error!(
                        requested = requested.0,
                        "dropping queued status update: {}",
                        e
                    );
                    outcome.rejected += 1;
                }
            }
        }
        outcome.written = outcome.committed.len();

        self.stats
            .records_flushed
            .fetch_add(outcome.written as u64, Ordering::Relaxed);
        self.stats
            .rejected
            .fetch_add(outcome.rejected as u64, Ordering::Relaxed);
        self.stats
            .largest_batch
            .fetch_max(drained as u64, Ordering::Relaxed);
        self.flushing.store(false, Ordering::Release);
        drop(section);

        tracing::debug!(
            written = outcome.written,
            rejected = outcome.rejected,
            "flushed pending status updates"
        );
        Some(outcome)
    }

    /// Run `f` inside the flush section, excluding any concurrent flush.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _section = self.section.lock();
        f()
    }

    pub fn state(&self) -> BatcherState {
        if self.flushing.load(Ordering::Acquire) {
            BatcherState::Flushing
        } else if !self.queue.is_empty() {
            BatcherState::Queued
        } else {
            BatcherState::Idle
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn last_flush_ms(&self) -> u64 {
        self.last_flush_ms.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BatchStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StatusDraft;
    use std::time::{Duration, Instant};
    use warbler_common::clock::ManualClock;
    use warbler_common::types::StatusId;

    fn update(id: u64) -> StatusUpdate {
        StatusDraft::new("a", "t")
            .with_id(id)
            .validate(&ManualClock::new(0))
            .unwrap()
    }

    fn accept(update: StatusUpdate) -> Result<Arc<StatusUpdate>, StorageError> {
        Ok(Arc::new(update))
    }

    fn batcher(window_ms: u64) -> (WriteBatcher, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let b = WriteBatcher::new(BatchConfig::with_window_ms(window_ms), clock.clone());
        (b, clock)
    }

    #[test]
    fn test_first_autoflush_is_due_immediately() {
        let (b, _clock) = batcher(1000);
        b.enqueue(update(1));
        let outcome = b.flush_if_due(accept).expect("due");
        assert_eq!(outcome.written, 1);
        assert_eq!(b.state(), BatcherState::Idle);
    }

    #[test]
    fn test_submissions_within_window_coalesce() {
        let (b, clock) = batcher(1000);
        b.flush_with(accept);

        for id in 1..=5 {
            b.enqueue(update(id));
            clock.advance_millis(100);
            assert!(b.flush_if_due(accept).is_none());
        }
        assert_eq!(b.state(), BatcherState::Queued);
        assert_eq!(b.pending_len(), 5);

        clock.advance_millis(600);
        let outcome = b.flush_if_due(accept).expect("window elapsed");
        assert_eq!(outcome.written, 5);
        let ids: Vec<u64> = outcome.committed.iter().map(|u| u.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(b.stats().largest_batch, 5);
    }

    #[test]
    fn test_window_boundary_is_strict() {
        let (b, clock) = batcher(1000);
        b.flush_with(accept);
        clock.advance_millis(1000);
        assert!(!b.is_due());
        clock.advance_millis(1);
        assert!(b.is_due());
    }

    #[test]
    fn test_empty_flush_is_noop_but_updates_timestamp() {
        let (b, clock) = batcher(1000);
        clock.advance_millis(5);
        let outcome = b.flush_with(accept);
        assert!(!outcome.wrote());
        assert_eq!(b.last_flush_ms(), clock.now_millis());
        let stats = b.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.empty_flushes, 1);
    }

    #[test]
    fn test_commit_failure_rejects_only_that_record() {
        let (b, _clock) = batcher(1000);
        b.enqueue(update(1));
        b.enqueue(update(2));
        b.enqueue(update(3));
        let outcome = b.flush_with(|u| {
            if u.id() == StatusId(2) {
                Err(StorageError::AllocationExhausted { requested: u.id() })
            } else {
                Ok(Arc::new(u))
            }
        });
        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(b.stats().rejected, 1);
    }

    #[test]
    fn test_write_through_commits_under_section() {
        let clock = Arc::new(ManualClock::new(1_000));
        let b = WriteBatcher::new(BatchConfig::synchronous(), clock);
        assert!(b.is_synchronous());
        let stored = b.write_through(update(9), accept).unwrap();
        assert_eq!(stored.id(), StatusId(9));
        assert!(!b.arm_fallback(|| {}));
        assert_eq!(b.stats().records_flushed, 1);
    }

    #[test]
    fn test_only_one_timer_is_armed_and_flush_disarms_it() {
        let (b, _clock) = batcher(60_000);
        assert!(b.arm_fallback(|| {}));
        assert!(!b.arm_fallback(|| {}));
        assert!(b.has_armed_timer());
        b.flush_with(accept);
        assert!(!b.has_armed_timer());
        let stats = b.stats();
        assert_eq!(stats.timers_armed, 1);
        assert_eq!(stats.timers_disarmed, 1);
        assert_eq!(stats.timers_fired, 0);
    }

    #[test]
    fn test_timer_fires_callback() {
        let clock = Arc::new(ManualClock::new(0));
        let b = WriteBatcher::new(
            BatchConfig {
                batch_window_ms: 5,
                timer_granularity_ms: 1,
            },
            clock,
        );
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(b.arm_fallback(move || {
            let _ = tx.send(Instant::now());
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
