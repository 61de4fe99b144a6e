//! Subscription plumbing between a backing store and the sync engine.
//!
//! A subscription is opened on a [`StorePath`](crate::types::StorePath) and
//! pushes full replacement snapshots into a caller-supplied sink. All
//! subscriptions owned by one engine share a single sink, so the engine sees
//! one queue of [`Delivery`] values in arrival order.
//!
//! Every subscription carries a [`CancelToken`]. Cancelling is synchronous,
//! and deliveries already queued for a cancelled subscription must be dropped
//! by the receiver before it touches any state.
//!
//! # Example
//!
//! ```ignore
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let manager = SubscriptionManager::new();
//!
//! let handle = manager.subscribe(StorePath::Topics, tx);
//! manager.broadcast(&StorePath::Topics, SubscriptionEvent::Topics { topics });
//!
//! while let Ok(delivery) = rx.try_recv() {
//!     if handle.accepts(&delivery) {
//!         println!("Got {:?}", delivery.event);
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    CancelToken, Delivery, DropReason, SubscriptionEvent, SubscriptionHandle, SubscriptionId,
};
