//! Pending write queue: validated updates waiting for the next flush.
//!
//! Producers push without taking the container's flush lock. A drain takes
//! a length snapshot and pops at most that many entries, so records pushed
//! during the drain wait for the following flush.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;

use crate::record::StatusUpdate;

pub struct PendingQueue {
    entries: SegQueue<(u64, StatusUpdate)>,
    /// Arrival counter; ties on id drain in arrival order.
    next_seq: AtomicU64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: SegQueue::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn push(&self, update: StatusUpdate) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.push((seq, update));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove the entries present at call time, ordered by requested id and
    /// then by arrival.
    pub fn drain(&self) -> Vec<StatusUpdate> {
        let snapshot = self.entries.len();
        let mut batch = Vec::with_capacity(snapshot);
        for _ in 0..snapshot {
            match self.entries.pop() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        batch.sort_by_key(|(seq, update)| (update.id(), *seq));
        batch.into_iter().map(|(_, update)| update).collect()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StatusDraft;
    use warbler_common::clock::ManualClock;
    use warbler_common::types::StatusId;

    fn update(id: u64, author: &str) -> StatusUpdate {
        StatusDraft::new(author, "t")
            .with_id(id)
            .validate(&ManualClock::new(0))
            .unwrap()
    }

    #[test]
    fn test_drain_orders_by_id_then_arrival() {
        let q = PendingQueue::new();
        q.push(update(30, "late"));
        q.push(update(10, "first"));
        q.push(update(10, "second"));
        q.push(update(20, "mid"));

        let drained = q.drain();
        let got: Vec<(u64, &str)> = drained.iter().map(|u| (u.id().0, u.author())).collect();
        assert_eq!(
            got,
            vec![(10, "first"), (10, "second"), (20, "mid"), (30, "late")]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn test_drain_empty() {
        let q = PendingQueue::new();
        assert!(q.drain().is_empty());
    }

    #[test]
    fn test_concurrent_push_then_drain_loses_nothing() {
        let q = std::sync::Arc::new(PendingQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        q.push(update(t * 1000 + i, "w"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 1000);
        let drained = q.drain();
        assert_eq!(drained.len(), 1000);
        assert!(drained.windows(2).all(|w| w[0].id() <= w[1].id()));
        assert_eq!(drained[0].id(), StatusId(0));
    }
}
