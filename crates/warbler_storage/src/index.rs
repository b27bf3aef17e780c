//! Secondary indexes: dimension key → ordered set of status ids.
//!
//! Derived state only. Every entry mirrors a committed record in the
//! primary store, and the whole structure can be rebuilt from it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::RwLock;

use warbler_common::types::StatusId;

use crate::primary::{IdRange, PrimaryStore};
use crate::record::StatusUpdate;

/// Which attribute of a status update an index is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexDimension {
    Author,
    Tag,
    Context,
}

impl IndexDimension {
    pub const ALL: [IndexDimension; 3] = [
        IndexDimension::Author,
        IndexDimension::Tag,
        IndexDimension::Context,
    ];
}

impl fmt::Display for IndexDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexDimension::Author => write!(f, "author"),
            IndexDimension::Tag => write!(f, "tag"),
            IndexDimension::Context => write!(f, "context"),
        }
    }
}

/// A collection of dimension keys to look up. A lone string converts into a
/// one-element collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionKeys(Vec<String>);

impl DimensionKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DimensionKeys(keys.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<&str> for DimensionKeys {
    fn from(key: &str) -> Self {
        DimensionKeys(vec![key.to_string()])
    }
}

impl From<String> for DimensionKeys {
    fn from(key: String) -> Self {
        DimensionKeys(vec![key])
    }
}

impl From<&String> for DimensionKeys {
    fn from(key: &String) -> Self {
        DimensionKeys(vec![key.clone()])
    }
}

impl From<Vec<String>> for DimensionKeys {
    fn from(keys: Vec<String>) -> Self {
        DimensionKeys(keys)
    }
}

impl From<Vec<&str>> for DimensionKeys {
    fn from(keys: Vec<&str>) -> Self {
        DimensionKeys::new(keys)
    }
}

impl From<&[&str]> for DimensionKeys {
    fn from(keys: &[&str]) -> Self {
        DimensionKeys::new(keys.iter().copied())
    }
}

impl From<&[String]> for DimensionKeys {
    fn from(keys: &[String]) -> Self {
        DimensionKeys(keys.to_vec())
    }
}

impl<const N: usize> From<[&str; N]> for DimensionKeys {
    fn from(keys: [&str; N]) -> Self {
        DimensionKeys::new(keys)
    }
}

/// One ordered multi-map for a single dimension.
pub struct SecondaryIndex {
    dimension: IndexDimension,
    tree: RwLock<BTreeMap<String, BTreeSet<StatusId>>>,
}

impl SecondaryIndex {
    pub fn new(dimension: IndexDimension) -> Self {
        Self {
            dimension,
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dimension(&self) -> IndexDimension {
        self.dimension
    }

    /// Add `id` under `key`, creating the key's set on first reference.
    pub fn insert(&self, key: &str, id: StatusId) {
        let mut tree = self.tree.write();
        tree.entry(key.to_string()).or_default().insert(id);
    }

    /// Union of the id sets of `keys`, restricted to `range`, ascending.
    /// No keys → no ids.
    pub fn lookup(&self, keys: &DimensionKeys, range: IdRange) -> Vec<StatusId> {
        let mut merged = BTreeSet::new();
        self.collect_into(keys, range, &mut merged);
        merged.into_iter().collect()
    }

    pub(crate) fn collect_into(
        &self,
        keys: &DimensionKeys,
        range: IdRange,
        out: &mut BTreeSet<StatusId>,
    ) {
        if keys.is_empty() || range.is_empty() {
            return;
        }
        let tree = self.tree.read();
        for key in keys.iter() {
            if let Some(ids) = tree.get(key) {
                out.extend(ids.range(range.bounds()));
            }
        }
    }

    pub fn contains(&self, key: &str, id: StatusId) -> bool {
        self.tree.read().get(key).map_or(false, |ids| ids.contains(&id))
    }

    /// All keys currently present, ascending.
    pub fn keys(&self) -> Vec<String> {
        self.tree.read().keys().cloned().collect()
    }

    pub fn key_count(&self) -> usize {
        self.tree.read().len()
    }

    /// Total (key, id) pairs held.
    pub fn entry_count(&self) -> usize {
        self.tree.read().values().map(BTreeSet::len).sum()
    }

    pub fn clear(&self) {
        self.tree.write().clear();
    }
}

/// The author, tag and context indexes of one container.
pub struct SecondaryIndexes {
    author: SecondaryIndex,
    tag: SecondaryIndex,
    context: SecondaryIndex,
}

impl SecondaryIndexes {
    pub fn new() -> Self {
        Self {
            author: SecondaryIndex::new(IndexDimension::Author),
            tag: SecondaryIndex::new(IndexDimension::Tag),
            context: SecondaryIndex::new(IndexDimension::Context),
        }
    }

    pub fn dimension(&self, dimension: IndexDimension) -> &SecondaryIndex {
        match dimension {
            IndexDimension::Author => &self.author,
            IndexDimension::Tag => &self.tag,
            IndexDimension::Context => &self.context,
        }
    }

    /// Fan a committed record out into every dimension it references.
    pub fn index(&self, record: &StatusUpdate) {
        let id = record.id();
        self.author.insert(record.author(), id);
        for tag in record.tags() {
            self.tag.insert(tag, id);
        }
        if let Some(ctx) = record.context() {
            self.context.insert(ctx, id);
        }
    }

    pub fn lookup(
        &self,
        dimension: IndexDimension,
        keys: &DimensionKeys,
        range: IdRange,
    ) -> Vec<StatusId> {
        self.dimension(dimension).lookup(keys, range)
    }

    /// Union of `keys` looked up in each of `dimensions`, ascending.
    pub fn lookup_any(
        &self,
        dimensions: &[IndexDimension],
        keys: &DimensionKeys,
        range: IdRange,
    ) -> Vec<StatusId> {
        let mut merged = BTreeSet::new();
        for dimension in dimensions {
            self.dimension(*dimension).collect_into(keys, range, &mut merged);
        }
        merged.into_iter().collect()
    }

    pub fn clear(&self) {
        self.author.clear();
        self.tag.clear();
        self.context.clear();
    }

    /// Drop all entries and re-derive them from `store`.
    /// Returns the number of records indexed.
    pub fn rebuild(&self, store: &PrimaryStore) -> usize {
        self.clear();
        let records = store.values(IdRange::all());
        for record in &records {
            self.index(record);
        }
        tracing::debug!("secondary indexes rebuilt from {} records", records.len());
        records.len()
    }
}

impl Default for SecondaryIndexes {
    fn default() -> Self {
        Self::new()
    }
}
