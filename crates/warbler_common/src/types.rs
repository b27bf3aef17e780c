use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a committed status update.
///
/// Starts life as a microsecond Unix timestamp; the allocator may bump it to
/// resolve collisions, so it doubles as primary key and chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusId(pub u64);

impl StatusId {
    pub const MIN: StatusId = StatusId(0);
    pub const MAX: StatusId = StatusId(u64::MAX);

    /// The next identifier, or `None` at the top of the id space.
    pub fn checked_next(self) -> Option<StatusId> {
        self.0.checked_add(1).map(StatusId)
    }
}

impl fmt::Display for StatusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StatusId {
    fn from(v: u64) -> Self {
        StatusId(v)
    }
}

/// Logical scope a status container lives in (a site or a workspace).
///
/// The store never interprets it; the embedding system picks the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Namespace(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendering, used to name the namespace's journal dir.
    pub fn dir_name(&self) -> String {
        let hex: String = self.0.bytes().map(|b| format!("{:02x}", b)).collect();
        format!("ns_{}", hex)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Namespace(s.to_string())
    }
}

impl From<String> for Namespace {
    fn from(s: String) -> Self {
        Namespace(s)
    }
}
