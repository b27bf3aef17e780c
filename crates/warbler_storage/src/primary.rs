//! Primary store: ordered `StatusId → StatusUpdate` map, the source of truth.
//!
//! ## Write path
//! ```text
//! WriteBatcher.flush()
//!   → PrimaryStore.insert(record)       [allocator places the id]
//!   → SecondaryIndexes.index(record)    [author / tag / context fan-out]
//! ```
//!
//! ## Prohibited Patterns
//! - Inserting under a caller-chosen key → two records could share an id
//! - Removing one record → its index entries would dangle
//!
//! Both are exposed only as methods that fail with `UnsupportedOperation`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use warbler_common::error::StorageError;
use warbler_common::types::StatusId;

use crate::allocator::IdentifierAllocator;
use crate::record::StatusUpdate;

/// Inclusive id range; `None` leaves that side unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdRange {
    pub min: Option<StatusId>,
    pub max: Option<StatusId>,
}

impl IdRange {
    pub const ALL: IdRange = IdRange {
        min: None,
        max: None,
    };

    pub fn all() -> Self {
        Self::ALL
    }

    pub fn new(min: Option<StatusId>, max: Option<StatusId>) -> Self {
        Self { min, max }
    }

    pub fn between(min: StatusId, max: StatusId) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn at_least(min: StatusId) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: StatusId) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn contains(&self, id: StatusId) -> bool {
        self.min.map_or(true, |lo| lo <= id) && self.max.map_or(true, |hi| id <= hi)
    }

    /// True when `min > max`; such a range matches nothing.
    pub fn is_empty(&self) -> bool {
        matches!((self.min, self.max), (Some(lo), Some(hi)) if lo > hi)
    }

    /// Bounds for `BTreeMap::range`. Callers must check `is_empty()` first:
    /// `range` panics on an inverted interval.
    pub(crate) fn bounds(&self) -> (Bound<StatusId>, Bound<StatusId>) {
        let lo = self.min.map_or(Bound::Unbounded, Bound::Included);
        let hi = self.max.map_or(Bound::Unbounded, Bound::Included);
        (lo, hi)
    }
}

/// Ordered map of committed status updates.
pub struct PrimaryStore {
    entries: RwLock<BTreeMap<StatusId, Arc<StatusUpdate>>>,
    allocator: IdentifierAllocator,
}

impl PrimaryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            allocator: IdentifierAllocator::new(),
        }
    }

    /// Store `record` under the first free id at or above its own id.
    /// Never overwrites. Returns the stored record with its final id.
    pub fn insert(&self, mut record: StatusUpdate) -> Result<Arc<StatusUpdate>, StorageError> {
        let mut entries = self.entries.write();
        let id = self
            .allocator
            .allocate(record.id(), |candidate| entries.contains_key(&candidate))?;
        record.set_id(id);
        let record = Arc::new(record);
        entries.insert(id, Arc::clone(&record));
        Ok(record)
    }

    pub fn get(&self, id: StatusId) -> Option<Arc<StatusUpdate>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn contains(&self, id: StatusId) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn keys(&self, range: IdRange) -> Vec<StatusId> {
        if range.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.read();
        entries.range(range.bounds()).map(|(k, _)| *k).collect()
    }

    pub fn values(&self, range: IdRange) -> Vec<Arc<StatusUpdate>> {
        if range.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.read();
        entries.range(range.bounds()).map(|(_, v)| Arc::clone(v)).collect()
    }

    pub fn items(&self, range: IdRange) -> Vec<(StatusId, Arc<StatusUpdate>)> {
        if range.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.read();
        entries
            .range(range.bounds())
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect()
    }

    /// Up to `limit` records in `range`, newest first.
    pub fn latest(&self, range: IdRange, limit: usize) -> Vec<Arc<StatusUpdate>> {
        if range.is_empty() {
            return Vec::new();
        }
        let entries = self.entries.read();
        entries
            .range(range.bounds())
            .rev()
            .take(limit)
            .map(|(_, v)| Arc::clone(v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove everything. Returns the number of records dropped.
    /// Callers clear the secondary indexes in the same exclusive section.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn allocator(&self) -> &IdentifierAllocator {
        &self.allocator
    }

    // ── Rejected raw mutations ──────────────────────────────────────────

    pub fn put(&self, _key: StatusId, _value: StatusUpdate) -> Result<(), StorageError> {
        Err(StorageError::unsupported(
            "put",
            "ids are assigned by the allocator; caller-chosen keys could collide and skip indexing",
        ))
    }

    pub fn set_default(
        &self,
        _key: StatusId,
        _value: StatusUpdate,
    ) -> Result<Arc<StatusUpdate>, StorageError> {
        Err(StorageError::unsupported(
            "set_default",
            "ids are assigned by the allocator; caller-chosen keys could collide and skip indexing",
        ))
    }

    pub fn pop(&self, _key: StatusId) -> Result<Arc<StatusUpdate>, StorageError> {
        Err(StorageError::unsupported(
            "pop",
            "removing one update would orphan its secondary index entries; use clear()",
        ))
    }

    pub fn merge<I>(&self, _entries: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = (StatusId, StatusUpdate)>,
    {
        Err(StorageError::unsupported(
            "merge",
            "bulk merge bypasses id allocation and secondary indexing",
        ))
    }
}

impl Default for PrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StatusDraft;
    use warbler_common::clock::ManualClock;

    fn update(id: u64, author: &str) -> StatusUpdate {
        StatusDraft::new(author, "text")
            .with_id(id)
            .validate(&ManualClock::new(0))
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = PrimaryStore::new();
        let stored = store.insert(update(100, "a")).unwrap();
        assert_eq!(stored.id(), StatusId(100));
        assert_eq!(store.get(StatusId(100)).unwrap().author(), "a");
        assert!(store.get(StatusId(101)).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insert_never_overwrites() {
        let store = PrimaryStore::new();
        store.insert(update(100, "first")).unwrap();
        let second = store.insert(update(100, "second")).unwrap();
        let third = store.insert(update(100, "third")).unwrap();
        assert_eq!(second.id(), StatusId(101));
        assert_eq!(third.id(), StatusId(102));
        assert_eq!(store.get(StatusId(100)).unwrap().author(), "first");
        assert_eq!(store.allocator().collisions(), 3);
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let store = PrimaryStore::new();
        for id in [10, 20, 30, 40] {
            store.insert(update(id, "a")).unwrap();
        }
        let ids = |r| store.keys(r).into_iter().map(|k| k.0).collect::<Vec<_>>();
        assert_eq!(ids(IdRange::all()), vec![10, 20, 30, 40]);
        assert_eq!(ids(IdRange::between(StatusId(20), StatusId(30))), vec![20, 30]);
        assert_eq!(ids(IdRange::at_least(StatusId(25))), vec![30, 40]);
        assert_eq!(ids(IdRange::at_most(StatusId(10))), vec![10]);
        assert_eq!(store.values(IdRange::at_least(StatusId(40))).len(), 1);
        let items = store.items(IdRange::between(StatusId(11), StatusId(29)));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, StatusId(20));
        assert_eq!(items[0].1.id(), StatusId(20));
    }

    #[test]
    fn test_inverted_range_is_empty_not_panic() {
        let store = PrimaryStore::new();
        store.insert(update(10, "a")).unwrap();
        let inverted = IdRange::between(StatusId(50), StatusId(5));
        assert!(inverted.is_empty());
        assert!(store.keys(inverted).is_empty());
        assert!(store.values(inverted).is_empty());
        assert!(store.items(inverted).is_empty());
        assert!(store.latest(inverted, 10).is_empty());
    }

    #[test]
    fn test_latest_is_newest_first() {
        let store = PrimaryStore::new();
        for id in 1..=5 {
            store.insert(update(id, "a")).unwrap();
        }
        let ids: Vec<u64> = store
            .latest(IdRange::all(), 3)
            .iter()
            .map(|u| u.id().0)
            .collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_raw_mutations_rejected_and_store_unchanged() {
        let store = PrimaryStore::new();
        store.insert(update(1, "a")).unwrap();
        let before = store.items(IdRange::all());

        let errs = vec![
            store.put(StatusId(2), update(2, "b")).unwrap_err(),
            store.set_default(StatusId(3), update(3, "c")).map(|_| ()).unwrap_err(),
            store.pop(StatusId(1)).map(|_| ()).unwrap_err(),
            store.merge(vec![(StatusId(4), update(4, "d"))]).unwrap_err(),
        ];
        for err in errs {
            assert!(
                matches!(err, StorageError::UnsupportedOperation { .. }),
                "unexpected: {:?}",
                err
            );
        }
        let after = store.items(IdRange::all());
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].1, after[0].1);
    }

    #[test]
    fn test_clear_reports_count() {
        let store = PrimaryStore::new();
        store.insert(update(1, "a")).unwrap();
        store.insert(update(2, "a")).unwrap();
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
    }
}
