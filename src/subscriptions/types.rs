//! Subscription types for snapshot delivery.

use crate::types::{Reply, StorePath, Topic, TopicId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Shared cancellation flag.
///
/// Cancelling is synchronous: once `cancel` returns, every clone reports
/// cancelled, including those held by deliveries still queued.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Events pushed by a subscription. Every data event is a full replacement
/// of the subscribed collection, never a delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    /// Complete current topic set.
    Topics { topics: Vec<Topic> },

    /// Complete current reply list of one topic.
    Replies {
        topic_id: TopicId,
        replies: Vec<Reply>,
    },

    /// The subscription died. No further events follow.
    Failed { reason: DropReason },
}

/// Why a subscription stopped delivering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Consumer end of the sink went away.
    Disconnected,
    /// Access to the path was revoked.
    PermissionDenied,
    /// Backend error.
    Error(String),
    /// Explicitly unsubscribed.
    Unsubscribed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Disconnected => write!(f, "disconnected"),
            DropReason::PermissionDenied => write!(f, "permission denied"),
            DropReason::Error(msg) => write!(f, "{}", msg),
            DropReason::Unsubscribed => write!(f, "unsubscribed"),
        }
    }
}

/// One event on the shared delivery queue, stamped with its origin.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub path: StorePath,
    pub event: SubscriptionEvent,
}

/// Handle to an open subscription.
///
/// Dropping the handle does not unsubscribe; the owner must hand the id back
/// to the backend. The handle only carries identity and the cancellation flag.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub path: StorePath,
    token: CancelToken,
}

impl SubscriptionHandle {
    pub fn new(id: SubscriptionId, path: StorePath, token: CancelToken) -> Self {
        Self { id, path, token }
    }

    /// Mark the handle cancelled. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True if `delivery` came from this handle and the handle is still live.
    pub fn accepts(&self, delivery: &Delivery) -> bool {
        delivery.subscription == self.id && !self.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}
