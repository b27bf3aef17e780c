//! Added-event notification for the embedding system.

use std::sync::Arc;

use warbler_common::types::{Namespace, StatusId};

use crate::record::StatusUpdate;

/// Fired once per committed status update, after the flush section is
/// released.
#[derive(Debug, Clone)]
pub struct StatusAdded {
    pub record: Arc<StatusUpdate>,
    /// Final id; may differ from the requested one after a collision.
    pub id: StatusId,
    pub parent: Namespace,
}

pub trait StatusObserver: Send + Sync {
    fn on_added(&self, event: &StatusAdded);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusAdded) + Send + Sync,
{
    fn on_added(&self, event: &StatusAdded) {
        self(event)
    }
}
