//! Range scans composed with secondary-index filtering.
//!
//! Reads take short read locks on the store and each index in turn. They are
//! not isolated from a concurrent flush and may see part of a batch; records
//! still in the pending queue are not visible at all.

use std::collections::BTreeSet;
use std::sync::Arc;

use warbler_common::types::StatusId;

use crate::index::{DimensionKeys, IndexDimension, SecondaryIndexes};
use crate::primary::{IdRange, PrimaryStore};
use crate::record::StatusUpdate;

/// Dimensions searched by the `filtered_*` accessors.
const FILTER_DIMENSIONS: [IndexDimension; 2] = [IndexDimension::Author, IndexDimension::Tag];

/// Conjunctive filter across dimensions. Within a dimension the keys are
/// OR-ed; an unset dimension does not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFilter {
    pub authors: Option<DimensionKeys>,
    pub tags: Option<DimensionKeys>,
    pub context: Option<String>,
}

impl StatusFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authors(mut self, keys: impl Into<DimensionKeys>) -> Self {
        self.authors = Some(keys.into());
        self
    }

    pub fn tags(mut self, keys: impl Into<DimensionKeys>) -> Self {
        self.tags = Some(keys.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// True when no dimension is constrained.
    pub fn is_empty(&self) -> bool {
        self.authors.is_none() && self.tags.is_none() && self.context.is_none()
    }
}

pub struct QueryEngine<'a> {
    store: &'a PrimaryStore,
    indexes: &'a SecondaryIndexes,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a PrimaryStore, indexes: &'a SecondaryIndexes) -> Self {
        Self { store, indexes }
    }

    pub fn keys(&self, range: IdRange) -> Vec<StatusId> {
        self.store.keys(range)
    }

    pub fn values(&self, range: IdRange) -> Vec<Arc<StatusUpdate>> {
        self.store.values(range)
    }

    pub fn items(&self, range: IdRange) -> Vec<(StatusId, Arc<StatusUpdate>)> {
        self.store.items(range)
    }

    /// Ids whose author or any tag matches one of `keys`, ascending.
    pub fn filtered_keys(&self, keys: impl Into<DimensionKeys>, range: IdRange) -> Vec<StatusId> {
        self.indexes
            .lookup_any(&FILTER_DIMENSIONS, &keys.into(), range)
    }

    pub fn filtered_values(
        &self,
        keys: impl Into<DimensionKeys>,
        range: IdRange,
    ) -> Vec<Arc<StatusUpdate>> {
        self.resolve(self.filtered_keys(keys, range))
    }

    pub fn filtered_items(
        &self,
        keys: impl Into<DimensionKeys>,
        range: IdRange,
    ) -> Vec<(StatusId, Arc<StatusUpdate>)> {
        self.resolve_items(self.filtered_keys(keys, range))
    }

    pub fn author_keys(&self, authors: impl Into<DimensionKeys>, range: IdRange) -> Vec<StatusId> {
        self.indexes
            .lookup(IndexDimension::Author, &authors.into(), range)
    }

    pub fn tag_keys(&self, tags: impl Into<DimensionKeys>, range: IdRange) -> Vec<StatusId> {
        self.indexes.lookup(IndexDimension::Tag, &tags.into(), range)
    }

    pub fn context_keys(&self, contexts: impl Into<DimensionKeys>, range: IdRange) -> Vec<StatusId> {
        self.indexes
            .lookup(IndexDimension::Context, &contexts.into(), range)
    }

    /// Ids matching every constrained dimension of `filter`, ascending.
    pub fn select(&self, filter: &StatusFilter, range: IdRange) -> Vec<StatusId> {
        if filter.is_empty() {
            return self.store.keys(range);
        }

        let mut constraints: Vec<(IndexDimension, DimensionKeys)> = Vec::with_capacity(3);
        if let Some(authors) = &filter.authors {
            constraints.push((IndexDimension::Author, authors.clone()));
        }
        if let Some(tags) = &filter.tags {
            constraints.push((IndexDimension::Tag, tags.clone()));
        }
        if let Some(ctx) = &filter.context {
            constraints.push((IndexDimension::Context, DimensionKeys::from(ctx)));
        }

        let mut result: Option<BTreeSet<StatusId>> = None;
        for (dimension, keys) in constraints {
            let ids: BTreeSet<StatusId> = self
                .indexes
                .lookup(dimension, &keys, range)
                .into_iter()
                .collect();
            let narrowed = match result {
                None => ids,
                Some(acc) => acc.intersection(&ids).copied().collect(),
            };
            if narrowed.is_empty() {
                return Vec::new();
            }
            result = Some(narrowed);
        }
        result.map(|ids| ids.into_iter().collect()).unwrap_or_default()
    }

    pub fn select_values(&self, filter: &StatusFilter, range: IdRange) -> Vec<Arc<StatusUpdate>> {
        self.resolve(self.select(filter, range))
    }

    /// The newest `limit` records matching `filter`, newest first.
    pub fn recent(&self, filter: &StatusFilter, limit: usize) -> Vec<Arc<StatusUpdate>> {
        if limit == 0 {
            return Vec::new();
        }
        if filter.is_empty() {
            return self.store.latest(IdRange::all(), limit);
        }
        let ids = self.select(filter, IdRange::all());
        self.resolve(ids.into_iter().rev().take(limit).collect())
    }

    // An id can vanish between the index lookup and the store read when a
    // clear runs concurrently; such ids are skipped.
    fn resolve(&self, ids: Vec<StatusId>) -> Vec<Arc<StatusUpdate>> {
        ids.into_iter().filter_map(|id| self.store.get(id)).collect()
    }

    fn resolve_items(&self, ids: Vec<StatusId>) -> Vec<(StatusId, Arc<StatusUpdate>)> {
        ids.into_iter()
            .filter_map(|id| self.store.get(id).map(|u| (id, u)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StatusDraft;
    use warbler_common::clock::ManualClock;

    struct Fixture {
        store: PrimaryStore,
        indexes: SecondaryIndexes,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: PrimaryStore::new(),
                indexes: SecondaryIndexes::new(),
            }
        }

        fn add(&self, draft: StatusDraft) -> StatusId {
            let update = draft.validate(&ManualClock::new(0)).unwrap();
            let stored = self.store.insert(update).unwrap();
            self.indexes.index(&stored);
            stored.id()
        }

        fn engine(&self) -> QueryEngine<'_> {
            QueryEngine::new(&self.store, &self.indexes)
        }
    }

    fn ids(v: &[StatusId]) -> Vec<u64> {
        v.iter().map(|id| id.0).collect()
    }

    fn seeded() -> Fixture {
        let f = Fixture::new();
        f.add(StatusDraft::new("a", "1").with_id(1).with_tag("x"));
        f.add(StatusDraft::new("a", "2").with_id(2).with_tags(["x", "y"]).in_context("w1"));
        f.add(StatusDraft::new("b", "3").with_id(3).with_tag("y").in_context("w1"));
        f.add(StatusDraft::new("c", "4").with_id(4).in_context("w2"));
        f
    }

    #[test]
    fn test_filtered_keys_unions_author_and_tag() {
        let f = seeded();
        let q = f.engine();
        assert_eq!(ids(&q.filtered_keys("a", IdRange::all())), vec![1, 2]);
        assert_eq!(ids(&q.filtered_keys("y", IdRange::all())), vec![2, 3]);
        assert_eq!(ids(&q.filtered_keys(["b", "x"], IdRange::all())), vec![1, 2, 3]);
        assert!(q.filtered_keys(Vec::<String>::new(), IdRange::all()).is_empty());
    }

    #[test]
    fn test_filtered_values_resolve_in_order() {
        let f = seeded();
        let q = f.engine();
        let values = q.filtered_values("x", IdRange::at_least(StatusId(2)));
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].id(), StatusId(2));
        let items = q.filtered_items("y", IdRange::all());
        assert_eq!(items.iter().map(|(k, _)| k.0).collect::<Vec<_>>(), vec![2, 3]);
        assert!(items.iter().all(|(k, v)| *k == v.id()));
    }

    #[test]
    fn test_single_dimension_lookups() {
        let f = seeded();
        let q = f.engine();
        // "a" is an author, never a tag
        assert!(q.tag_keys("a", IdRange::all()).is_empty());
        assert_eq!(ids(&q.author_keys(["a", "c"], IdRange::all())), vec![1, 2, 4]);
        assert_eq!(ids(&q.context_keys("w1", IdRange::all())), vec![2, 3]);
    }

    #[test]
    fn test_select_intersects_dimensions() {
        let f = seeded();
        let q = f.engine();
        let filter = StatusFilter::new().authors("a").tags("y");
        assert_eq!(ids(&q.select(&filter, IdRange::all())), vec![2]);

        let filter = StatusFilter::new().tags(["x", "y"]).context("w1");
        assert_eq!(ids(&q.select(&filter, IdRange::all())), vec![2, 3]);

        let filter = StatusFilter::new().authors("c").context("w1");
        assert!(q.select(&filter, IdRange::all()).is_empty());

        let filter = StatusFilter::new().authors(Vec::<String>::new());
        assert!(q.select(&filter, IdRange::all()).is_empty());
    }

    #[test]
    fn test_empty_filter_selects_range() {
        let f = seeded();
        let q = f.engine();
        let all = q.select(&StatusFilter::new(), IdRange::between(StatusId(2), StatusId(3)));
        assert_eq!(ids(&all), vec![2, 3]);
        assert_eq!(q.select_values(&StatusFilter::new(), IdRange::all()).len(), 4);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let f = seeded();
        let q = f.engine();
        let newest: Vec<u64> = q
            .recent(&StatusFilter::new(), 2)
            .iter()
            .map(|u| u.id().0)
            .collect();
        assert_eq!(newest, vec![4, 3]);

        let by_a: Vec<u64> = q
            .recent(&StatusFilter::new().authors("a"), 10)
            .iter()
            .map(|u| u.id().0)
            .collect();
        assert_eq!(by_a, vec![2, 1]);
        assert!(q.recent(&StatusFilter::new(), 0).is_empty());
    }

    #[test]
    fn test_plain_range_accessors() {
        let f = seeded();
        let q = f.engine();
        assert_eq!(ids(&q.keys(IdRange::at_most(StatusId(2)))), vec![1, 2]);
        assert_eq!(q.values(IdRange::all()).len(), 4);
        assert_eq!(q.items(IdRange::at_least(StatusId(4))).len(), 1);
    }
}
