//! Reply aggregation: one reply subscription per known topic, merged into a
//! map keyed by topic id.
//!
//! The registry is the only place subscriptions for replies are opened or
//! closed. Its key set always equals the topic set of the last reconcile,
//! including topics whose subscription failed (those keep a slot with no
//! live handle so they can be retried).

use crate::error::SyncError;
use crate::store::Backend;
use crate::subscriptions::{Delivery, SubscriptionEvent, SubscriptionHandle, SubscriptionId};
use crate::types::{Reply, ReplyId, StorePath, TopicId};
use crossbeam_channel::Sender;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct ReplySlot {
    handle: Option<SubscriptionHandle>,
    /// Whether this attach cycle has produced its first event.
    seen_first: bool,
    failure: Option<SyncError>,
}

/// Outcome of routing one delivery through the aggregator.
#[derive(Debug, PartialEq)]
pub enum ReplyUpdate {
    /// The delivery came from a cancelled or unknown subscription.
    Stale,
    /// A reply snapshot replaced the topic's entry.
    Merged {
        topic_id: TopicId,
        first: bool,
        changed: bool,
    },
    /// The topic's subscription died.
    Failed {
        topic_id: TopicId,
        first: bool,
        error: SyncError,
    },
}

/// Result of reconciling the registry against a new topic id set.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub added: Vec<TopicId>,
    pub removed: Vec<TopicId>,
    pub retried: Vec<TopicId>,
    /// Topics whose subscription could not be opened.
    pub failed: Vec<(TopicId, SyncError)>,
}

/// Registry of reply subscriptions plus the aggregate reply map.
#[derive(Debug, Default)]
pub struct ReplyAggregator {
    slots: HashMap<TopicId, ReplySlot>,
    by_subscription: HashMap<SubscriptionId, TopicId>,
    replies: HashMap<TopicId, Vec<Reply>>,
}

impl ReplyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a reply subscription for `topic_id`, replacing any previous one.
    ///
    /// A setup failure still leaves a slot behind, marked failed.
    pub fn attach<B: Backend>(
        &mut self,
        backend: &B,
        topic_id: &TopicId,
        sink: Sender<Delivery>,
    ) -> Result<(), SyncError> {
        self.close_handle(backend, topic_id);
        let slot = self.slots.entry(topic_id.clone()).or_default();
        slot.seen_first = false;

        match backend.subscribe(&StorePath::Replies(topic_id.clone()), sink) {
            Ok(handle) => {
                debug!(topic = %topic_id, subscription = ?handle.id, "attached reply subscription");
                self.by_subscription.insert(handle.id, topic_id.clone());
                slot.handle = Some(handle);
                slot.failure = None;
                Ok(())
            }
            Err(err) => {
                let error = SyncError::SubscriptionDelivery {
                    path: StorePath::Replies(topic_id.clone()),
                    reason: err.to_string(),
                };
                warn!(topic = %topic_id, error = %error, "reply subscription failed to open");
                slot.seen_first = true;
                slot.failure = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Cancel the topic's subscription and purge its replies.
    /// Returns false if the topic was not registered.
    pub fn detach<B: Backend>(&mut self, backend: &B, topic_id: &TopicId) -> bool {
        self.close_handle(backend, topic_id);
        self.replies.remove(topic_id);
        let known = self.slots.remove(topic_id).is_some();
        if known {
            debug!(topic = %topic_id, "detached reply subscription");
        }
        known
    }

    /// Cancel and unsubscribe every topic's subscription, leaving merged
    /// replies in place. Returns the number of slots closed.
    pub fn close_all<B: Backend>(&mut self, backend: &B) -> usize {
        let topics: Vec<TopicId> = self.slots.keys().cloned().collect();
        for topic_id in &topics {
            self.close_handle(backend, topic_id);
        }
        self.slots.clear();
        topics.len()
    }

    /// Bring the registry in line with `topic_ids`.
    ///
    /// Removed topics are detached and purged before any new subscription
    /// opens. With `retry_failed`, topics whose subscription failed earlier
    /// are attached again.
    pub fn reconcile<B: Backend>(
        &mut self,
        backend: &B,
        topic_ids: &[TopicId],
        sink: &Sender<Delivery>,
        retry_failed: bool,
    ) -> Reconciled {
        let wanted: HashSet<&TopicId> = topic_ids.iter().collect();
        let mut result = Reconciled::default();

        let mut removed: Vec<TopicId> = self
            .slots
            .keys()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();
        removed.sort();
        for topic_id in &removed {
            self.detach(backend, topic_id);
        }
        result.removed = removed;

        let mut seen: HashSet<&TopicId> = HashSet::with_capacity(topic_ids.len());
        for topic_id in topic_ids {
            if !seen.insert(topic_id) {
                continue;
            }

            let retry = match self.slots.get(topic_id) {
                None => {
                    result.added.push(topic_id.clone());
                    true
                }
                Some(slot) => retry_failed && slot.handle.is_none() && slot.failure.is_some(),
            };
            if !retry {
                continue;
            }
            if self.slots.contains_key(topic_id) {
                result.retried.push(topic_id.clone());
            }
            if let Err(err) = self.attach(backend, topic_id, sink.clone()) {
                result.failed.push((topic_id.clone(), err));
            }
        }

        result
    }

    /// Route one delivery. Cancellation is checked before any state is read
    /// or written, so late events for detached topics are dropped whole.
    pub fn apply<B: Backend>(&mut self, backend: &B, delivery: Delivery) -> ReplyUpdate {
        let Some(topic_id) = self.by_subscription.get(&delivery.subscription).cloned() else {
            trace!(subscription = ?delivery.subscription, "dropped delivery for unknown subscription");
            return ReplyUpdate::Stale;
        };
        let live = self
            .slots
            .get(&topic_id)
            .and_then(|slot| slot.handle.as_ref())
            .is_some_and(|handle| handle.accepts(&delivery));
        if !live {
            trace!(topic = %topic_id, "dropped delivery for cancelled subscription");
            return ReplyUpdate::Stale;
        }

        match delivery.event {
            SubscriptionEvent::Replies { replies, .. } => {
                let replies = normalize_replies(&topic_id, replies);
                let changed = self.replies.get(&topic_id) != Some(&replies);
                self.replies.insert(topic_id.clone(), replies);

                let first = self.mark_first(&topic_id);
                ReplyUpdate::Merged {
                    topic_id,
                    first,
                    changed,
                }
            }
            SubscriptionEvent::Failed { reason } => {
                let error = SyncError::SubscriptionDelivery {
                    path: delivery.path,
                    reason: reason.to_string(),
                };
                warn!(topic = %topic_id, error = %error, "reply subscription failed");
                self.close_handle(backend, &topic_id);
                if let Some(slot) = self.slots.get_mut(&topic_id) {
                    slot.failure = Some(error.clone());
                }

                let first = self.mark_first(&topic_id);
                ReplyUpdate::Failed {
                    topic_id,
                    first,
                    error,
                }
            }
            SubscriptionEvent::Topics { .. } => {
                warn!(topic = %topic_id, "topic snapshot on a reply subscription ignored");
                ReplyUpdate::Stale
            }
        }
    }

    // --- Queries ---

    /// Topics that currently have a registry slot.
    pub fn registered_ids(&self) -> BTreeSet<TopicId> {
        self.slots.keys().cloned().collect()
    }

    pub fn handle(&self, topic_id: &TopicId) -> Option<&SubscriptionHandle> {
        self.slots.get(topic_id).and_then(|s| s.handle.as_ref())
    }

    /// Failure recorded for a topic whose reply data is degraded.
    pub fn failure(&self, topic_id: &TopicId) -> Option<&SyncError> {
        self.slots.get(topic_id).and_then(|s| s.failure.as_ref())
    }

    pub fn replies(&self, topic_id: &TopicId) -> &[Reply] {
        self.replies.get(topic_id).map_or(&[], Vec::as_slice)
    }

    // --- Internals ---

    fn close_handle<B: Backend>(&mut self, backend: &B, topic_id: &TopicId) {
        let Some(slot) = self.slots.get_mut(topic_id) else {
            return;
        };
        if let Some(handle) = slot.handle.take() {
            handle.cancel();
            self.by_subscription.remove(&handle.id);
            backend.unsubscribe(handle.id);
        }
    }

    fn mark_first(&mut self, topic_id: &TopicId) -> bool {
        match self.slots.get_mut(topic_id) {
            Some(slot) if !slot.seen_first => {
                slot.seen_first = true;
                true
            }
            _ => false,
        }
    }
}

/// Tag every reply with its topic and collapse duplicate ids (last wins,
/// first position kept).
fn normalize_replies(topic_id: &TopicId, replies: Vec<Reply>) -> Vec<Reply> {
    let mut index: HashMap<ReplyId, usize> = HashMap::with_capacity(replies.len());
    let mut unique: Vec<Reply> = Vec::with_capacity(replies.len());

    for mut reply in replies {
        reply.topic_id = topic_id.clone();
        match index.get(&reply.id) {
            Some(&at) => unique[at] = reply,
            None => {
                index.insert(reply.id.clone(), unique.len());
                unique.push(reply);
            }
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscriptions::DropReason;
    use crate::types::Topic;
    use crossbeam_channel::{unbounded, Receiver};

    fn setup(topics: &[&str]) -> (MemoryStore, Sender<Delivery>, Receiver<Delivery>) {
        let store = MemoryStore::new();
        for id in topics {
            store.insert_topic(Topic::new(*id, *id, "ann", "general")).unwrap();
        }
        let (tx, rx) = unbounded();
        (store, tx, rx)
    }

    fn ids(raw: &[&str]) -> Vec<TopicId> {
        raw.iter().map(|s| TopicId::from(*s)).collect()
    }

    fn drain(agg: &mut ReplyAggregator, store: &MemoryStore, rx: &Receiver<Delivery>) -> Vec<ReplyUpdate> {
        rx.try_iter().map(|d| agg.apply(store, d)).collect()
    }

    #[test]
    fn test_reconcile_adds_and_removes() {
        let (store, tx, _rx) = setup(&["t1", "t2", "t3"]);
        let mut agg = ReplyAggregator::new();

        let result = agg.reconcile(&store, &ids(&["t1", "t2"]), &tx, true);
        assert_eq!(result.added, ids(&["t1", "t2"]));
        assert!(result.removed.is_empty());

        let result = agg.reconcile(&store, &ids(&["t2", "t3"]), &tx, true);
        assert_eq!(result.added, ids(&["t3"]));
        assert_eq!(result.removed, ids(&["t1"]));

        let expected: BTreeSet<TopicId> = ids(&["t2", "t3"]).into_iter().collect();
        assert_eq!(agg.registered_ids(), expected);
        assert_eq!(store.subscription_count(), 2);
    }

    #[test]
    fn test_first_event_flag() {
        let (store, tx, rx) = setup(&["t1"]);
        let mut agg = ReplyAggregator::new();
        agg.reconcile(&store, &ids(&["t1"]), &tx, true);

        let updates = drain(&mut agg, &store, &rx);
        assert_eq!(
            updates,
            vec![ReplyUpdate::Merged {
                topic_id: TopicId::from("t1"),
                first: true,
                changed: true,
            }]
        );

        store.insert_reply(Reply::new("t1", "r1", "bob", "hi")).unwrap();
        let updates = drain(&mut agg, &store, &rx);
        assert_eq!(
            updates,
            vec![ReplyUpdate::Merged {
                topic_id: TopicId::from("t1"),
                first: false,
                changed: true,
            }]
        );
        assert_eq!(agg.replies(&TopicId::from("t1")).len(), 1);
    }

    #[test]
    fn test_identical_snapshot_is_idempotent() {
        let (store, tx, rx) = setup(&["t1"]);
        store.insert_reply(Reply::new("t1", "r1", "bob", "hi")).unwrap();
        let mut agg = ReplyAggregator::new();
        agg.reconcile(&store, &ids(&["t1"]), &tx, true);
        drain(&mut agg, &store, &rx);

        let handle_id = agg.handle(&TopicId::from("t1")).unwrap().id;
        let snapshot = Delivery {
            subscription: handle_id,
            path: StorePath::replies("t1"),
            event: SubscriptionEvent::Replies {
                topic_id: TopicId::from("t1"),
                replies: store.replies(&TopicId::from("t1")),
            },
        };

        let update = agg.apply(&store, snapshot.clone());
        assert!(matches!(update, ReplyUpdate::Merged { changed: false, .. }));
        agg.apply(&store, snapshot);
        assert_eq!(agg.replies(&TopicId::from("t1")).len(), 1);
    }

    #[test]
    fn test_detach_purges_and_cancels() {
        let (store, tx, rx) = setup(&["t1", "t2"]);
        for i in 0..3 {
            store
                .insert_reply(Reply::new("t2", format!("r{}", i), "bob", "hi"))
                .unwrap();
        }
        let mut agg = ReplyAggregator::new();
        agg.reconcile(&store, &ids(&["t1", "t2"]), &tx, true);
        drain(&mut agg, &store, &rx);
        assert_eq!(agg.replies(&TopicId::from("t2")).len(), 3);

        let token = agg.handle(&TopicId::from("t2")).unwrap().token().clone();
        agg.reconcile(&store, &ids(&["t1"]), &tx, true);

        assert!(agg.replies(&TopicId::from("t2")).is_empty());
        assert!(token.is_cancelled());
        assert_eq!(store.subscribers_of(&StorePath::replies("t2")), 0);
    }

    #[test]
    fn test_stale_delivery_after_detach() {
        let (store, tx, rx) = setup(&["t1"]);
        let mut agg = ReplyAggregator::new();
        agg.reconcile(&store, &ids(&["t1"]), &tx, true);

        // Initial snapshot is queued but not yet applied
        let queued = rx.try_recv().unwrap();
        agg.detach(&store, &TopicId::from("t1"));

        assert_eq!(agg.apply(&store, queued), ReplyUpdate::Stale);
        assert!(agg.replies(&TopicId::from("t1")).is_empty());
    }

    #[test]
    fn test_stale_delivery_from_superseded_handle() {
        let (store, tx, rx) = setup(&["t1"]);
        let mut agg = ReplyAggregator::new();
        agg.attach(&store, &TopicId::from("t1"), tx.clone()).unwrap();
        let old = rx.try_recv().unwrap();

        agg.attach(&store, &TopicId::from("t1"), tx).unwrap();
        assert_eq!(agg.apply(&store, old), ReplyUpdate::Stale);
        assert_eq!(store.subscription_count(), 1);
    }

    #[test]
    fn test_failure_keeps_slot_and_stale_data() {
        let (store, tx, rx) = setup(&["t1"]);
        store.insert_reply(Reply::new("t1", "r1", "bob", "hi")).unwrap();
        let mut agg = ReplyAggregator::new();
        agg.reconcile(&store, &ids(&["t1"]), &tx, true);
        drain(&mut agg, &store, &rx);

        store.fail_path(&StorePath::replies("t1"), DropReason::PermissionDenied);
        let updates = drain(&mut agg, &store, &rx);
        assert!(matches!(
            updates.as_slice(),
            [ReplyUpdate::Failed { first: false, .. }]
        ));

        let topic = TopicId::from("t1");
        assert!(agg.registered_ids().contains(&topic));
        assert!(agg.handle(&topic).is_none());
        assert!(agg.failure(&topic).is_some());
        assert_eq!(agg.replies(&topic).len(), 1);
    }

    #[test]
    fn test_setup_failure_then_retry() {
        let (store, tx, rx) = setup(&["t1"]);
        store.reject_path(StorePath::replies("t1"));
        let mut agg = ReplyAggregator::new();

        let result = agg.reconcile(&store, &ids(&["t1"]), &tx, true);
        assert_eq!(result.failed.len(), 1);
        assert!(matches!(result.failed[0].1, SyncError::SubscriptionDelivery { .. }));
        assert!(agg.registered_ids().contains(&TopicId::from("t1")));

        store.accept_path(&StorePath::replies("t1"));
        let result = agg.reconcile(&store, &ids(&["t1"]), &tx, true);
        assert_eq!(result.retried, ids(&["t1"]));
        assert!(result.failed.is_empty());
        assert!(agg.failure(&TopicId::from("t1")).is_none());

        let updates = drain(&mut agg, &store, &rx);
        assert!(matches!(updates.as_slice(), [ReplyUpdate::Merged { first: true, .. }]));
    }

    #[test]
    fn test_no_retry_when_disabled() {
        let (store, tx, _rx) = setup(&["t1"]);
        store.reject_path(StorePath::replies("t1"));
        let mut agg = ReplyAggregator::new();
        agg.reconcile(&store, &ids(&["t1"]), &tx, false);

        store.accept_path(&StorePath::replies("t1"));
        let result = agg.reconcile(&store, &ids(&["t1"]), &tx, false);
        assert!(result.retried.is_empty());
        assert!(agg.handle(&TopicId::from("t1")).is_none());
    }

    #[test]
    fn test_duplicate_reply_ids_collapse() {
        let first = Reply::new("t1", "r1", "bob", "old");
        let second = Reply::new("t1", "r2", "cy", "other");
        let third = Reply::new("t1", "r1", "bob", "edited");

        let merged = normalize_replies(&TopicId::from("t1"), vec![first, second, third]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "edited");
        assert_eq!(merged[1].id, ReplyId::from("r2"));
    }

    #[test]
    fn test_close_all_keeps_replies() {
        let (store, tx, rx) = setup(&["t1", "t2"]);
        store.insert_reply(Reply::new("t1", "r1", "bob", "hi")).unwrap();
        let mut agg = ReplyAggregator::new();
        agg.reconcile(&store, &ids(&["t1", "t2"]), &tx, true);
        drain(&mut agg, &store, &rx);
        let token = agg.handle(&TopicId::from("t1")).unwrap().token().clone();

        assert_eq!(agg.close_all(&store), 2);
        assert!(agg.registered_ids().is_empty());
        assert!(token.is_cancelled());
        assert_eq!(store.subscription_count(), 0);
        assert_eq!(agg.replies(&TopicId::from("t1")).len(), 1);

        // Nothing routes any more
        store.insert_reply(Reply::new("t1", "r2", "bob", "late")).unwrap();
        assert!(drain(&mut agg, &store, &rx).is_empty());
    }
}
