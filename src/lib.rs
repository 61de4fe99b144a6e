//! # Forum Sync
//!
//! A real-time synchronization engine for two-level data: a live set of
//! topics, each owning a live set of replies, read from a push-based store.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: Every subscription delivers the full current collection
//! - **Reply registry**: One reply subscription per known topic, opened and
//!   closed as topics appear and disappear
//! - **Load barrier**: Loading ends once every initial topic has answered
//! - **Cancellation**: Late deliveries for closed subscriptions are dropped
//!
//! ## Example
//!
//! ```ignore
//! use forum_sync::{MemoryStore, SyncEngine, Topic};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! store.insert_topic(Topic::new("t1", "Welcome", "admin", "general"))?;
//!
//! let mut engine = SyncEngine::new(Arc::clone(&store));
//! let updates = engine.subscribe_updates();
//! engine.start()?;
//! engine.process_pending();
//!
//! let snapshot = updates.try_iter().last().unwrap();
//! assert!(!snapshot.loading);
//!
//! // Writes go to the store; the view follows the next snapshot
//! engine.set_pinned(&"t1".into(), true)?;
//! engine.process_pending();
//!
//! engine.dispose();
//! ```

pub mod engine;
pub mod error;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use engine::{
    order_topics, EngineState, LoadBarrier, ReplyAggregator, ReplyView, SyncConfig, SyncEngine,
    SyncSnapshot, TopicDeletion, TopicView, TopicWatcher,
};
pub use error::{Result, SyncError};
pub use store::{Backend, MemoryStore, StoreConfig};
pub use subscriptions::{
    CancelToken, Delivery, DropReason, SubscriptionEvent, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
pub use types::*;
