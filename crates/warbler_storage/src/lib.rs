pub mod allocator;
pub mod batcher;
pub mod container;
pub mod durability;
pub mod index;
pub mod journal;
pub mod observer;
pub mod primary;
pub mod query;
pub mod queue;
pub mod record;
pub mod registry;
pub mod timer;

pub use batcher::{BatchStatsSnapshot, BatcherState};
pub use container::{ContainerStats, StatusContainer, SubmitOutcome};
pub use durability::{Change, Durability, NullDurability};
pub use index::DimensionKeys;
pub use observer::{StatusAdded, StatusObserver};
pub use primary::IdRange;
pub use query::StatusFilter;
pub use record::{StatusDraft, StatusUpdate};
pub use registry::ContainerRegistry;
