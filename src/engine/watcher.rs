//! Topic watcher: the subscription on the topic collection.

use crate::error::{Result, SyncError};
use crate::store::Backend;
use crate::subscriptions::{Delivery, SubscriptionHandle};
use crate::types::{StorePath, Topic, TopicId};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use tracing::{info, warn};

/// Sort topics for display: pinned first, then most recent activity.
///
/// The sort is stable, so topics that tie keep their delivery order.
pub fn order_topics(topics: &mut [Topic]) {
    topics.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.last_activity.cmp(&a.last_activity))
    });
}

/// Collapse duplicate ids. The last occurrence wins but keeps the position
/// of the first.
fn dedupe_topics(topics: Vec<Topic>) -> Vec<Topic> {
    let mut index: HashMap<TopicId, usize> = HashMap::with_capacity(topics.len());
    let mut unique: Vec<Topic> = Vec::with_capacity(topics.len());

    for topic in topics {
        match index.get(&topic.id) {
            Some(&at) => {
                warn!(topic = %topic.id, "duplicate topic id in snapshot");
                unique[at] = topic;
            }
            None => {
                index.insert(topic.id.clone(), unique.len());
                unique.push(topic);
            }
        }
    }
    unique
}

/// Owns the topic subscription and the last ordered topic list.
#[derive(Debug, Default)]
pub struct TopicWatcher {
    handle: Option<SubscriptionHandle>,
    topics: Vec<Topic>,
}

impl TopicWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the topic subscription. Snapshots arrive on `sink`.
    pub fn start<B: Backend>(&mut self, backend: &B, sink: Sender<Delivery>) -> Result<()> {
        if self.is_open() {
            return Err(SyncError::InvalidState(
                "topic watcher already running".to_string(),
            ));
        }

        let handle = backend.subscribe(&StorePath::Topics, sink)?;
        info!(subscription = ?handle.id, "topic watcher started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Cancel and close the subscription. Returns false if it was not open.
    pub fn stop<B: Backend>(&mut self, backend: &B) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.cancel();
                backend.unsubscribe(handle.id);
                true
            }
            None => false,
        }
    }

    /// Close after a terminal error. The watcher stays silent until restarted.
    pub fn fail<B: Backend>(&mut self, backend: &B, reason: impl Into<String>) -> SyncError {
        let reason = reason.into();
        warn!(reason = %reason, "topic watcher failed");
        self.stop(backend);
        SyncError::SubscriptionSetup {
            path: StorePath::Topics,
            reason,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_cancelled())
    }

    /// True if `delivery` belongs to the live topic subscription.
    pub fn owns(&self, delivery: &Delivery) -> bool {
        self.handle.as_ref().is_some_and(|h| h.accepts(delivery))
    }

    /// Replace the topic list with a fresh snapshot and return it ordered.
    pub fn apply(&mut self, topics: Vec<Topic>) -> &[Topic] {
        let mut topics = dedupe_topics(topics);
        order_topics(&mut topics);
        self.topics = topics;
        &self.topics
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }
}
