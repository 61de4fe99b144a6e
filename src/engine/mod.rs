//! The sync engine and its parts.
//!
//! - [`TopicWatcher`]: subscription on the topic collection, ordering
//! - [`ReplyAggregator`]: one reply subscription per topic, merged by topic id
//! - [`LoadBarrier`]: initial-load completion over the first topic set
//! - [`SyncEngine`]: orchestration, lifecycle, snapshots and mutations

mod barrier;
mod registry;
mod snapshot;
mod sync;
mod watcher;

pub use barrier::LoadBarrier;
pub use registry::{Reconciled, ReplyAggregator, ReplyUpdate};
pub use snapshot::{ReplyView, SyncSnapshot, TopicView};
pub use sync::{EngineState, SyncConfig, SyncEngine, TopicDeletion};
pub use watcher::{order_topics, TopicWatcher};
