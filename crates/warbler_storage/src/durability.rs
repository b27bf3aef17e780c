//! Durability collaborator: where committed changes go when persisted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use warbler_common::error::StorageError;

use crate::record::StatusUpdate;

/// One committed mutation of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// A status update was committed under its final id.
    Added(Arc<StatusUpdate>),
    /// The container was emptied.
    Cleared,
}

/// Receives committed changes in commit order.
///
/// An `Err` leaves the changes with the caller, who hands the same slice
/// (possibly extended) to the next `commit`.
pub trait Durability: Send + Sync {
    fn commit(&self, changes: &[Change]) -> Result<(), StorageError>;

    fn name(&self) -> &'static str {
        "durability"
    }
}

/// In-memory only. Every commit succeeds and nothing survives the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDurability;

impl Durability for NullDurability {
    fn commit(&self, _changes: &[Change]) -> Result<(), StorageError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
