//! Initial-load barrier over a dynamically sized set of reply subscriptions.

use crate::types::TopicId;
use std::collections::HashSet;

/// Tracks which topics of the initial topic set have produced their first
/// reply event (or error).
///
/// The barrier governs the initial load only. Topics discovered after
/// [`reset`](Self::reset) never reopen it.
#[derive(Debug, Default)]
pub struct LoadBarrier {
    /// Topics still awaited. `None` until armed by `reset`.
    pending: Option<HashSet<TopicId>>,
}

impl LoadBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the barrier with the initial topic set. An empty set is loaded
    /// immediately.
    pub fn reset<'a, I>(&mut self, topic_ids: I)
    where
        I: IntoIterator<Item = &'a TopicId>,
    {
        self.pending = Some(topic_ids.into_iter().cloned().collect());
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Settle one topic. Returns true only the first time an awaited topic
    /// settles; repeats and topics outside the initial set are no-ops.
    pub fn mark_settled(&mut self, topic_id: &TopicId) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        pending.remove(topic_id)
    }

    /// Stop waiting for a topic that disappeared before it settled.
    pub fn withdraw(&mut self, topic_id: &TopicId) -> bool {
        match self.pending.as_mut() {
            Some(pending) => pending.remove(topic_id),
            None => false,
        }
    }

    /// True once armed and every awaited topic has settled or withdrawn.
    pub fn is_loaded(&self) -> bool {
        matches!(&self.pending, Some(pending) if pending.is_empty())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.as_ref().map_or(0, HashSet::len)
    }
}
