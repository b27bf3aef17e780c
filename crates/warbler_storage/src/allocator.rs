//! Collision-free placement of time-derived identifiers.
//!
//! Ids are microsecond timestamps, so two updates created in the same
//! microsecond ask for the same id. The allocator walks upward from the
//! requested id to the first free slot; it never wraps past `u64::MAX`.

use std::sync::atomic::{AtomicU64, Ordering};

use warbler_common::error::StorageError;
use warbler_common::types::StatusId;

#[derive(Debug, Default)]
pub struct IdentifierAllocator {
    /// Total increments performed to resolve collisions.
    collisions: AtomicU64,
}

impl IdentifierAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest id `>= requested` for which `is_taken` is false.
    pub fn allocate<F>(&self, requested: StatusId, is_taken: F) -> Result<StatusId, StorageError>
    where
        F: Fn(StatusId) -> bool,
    {
        let mut candidate = requested;
        let mut bumps = 0u64;
        while is_taken(candidate) {
            candidate = candidate
                .checked_next()
                .ok_or(StorageError::AllocationExhausted { requested })?;
            bumps += 1;
        }
        if bumps > 0 {
            self.collisions.fetch_add(bumps, Ordering::Relaxed);
            tracing::trace!(requested = requested.0, assigned = candidate.0, "id collision resolved");
        }
        Ok(candidate)
    }

    pub fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }
}
