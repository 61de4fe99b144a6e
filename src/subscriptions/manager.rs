//! Subscription manager for fanning out snapshots to delivery sinks.

use crate::types::StorePath;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::types::{
    CancelToken, Delivery, DropReason, SubscriptionEvent, SubscriptionHandle, SubscriptionId,
};

/// Internal subscription state.
struct Subscription {
    id: SubscriptionId,
    path: StorePath,
    sender: Sender<Delivery>,
    token: CancelToken,
}

impl Subscription {
    fn delivery(&self, event: SubscriptionEvent) -> Delivery {
        Delivery {
            subscription: self.id,
            path: self.path.clone(),
            event,
        }
    }

    /// Try to send an event. Returns false if the sink is gone.
    fn try_send(&self, event: SubscriptionEvent) -> bool {
        match self.sender.try_send(self.delivery(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// A delivery that left the store but has not reached its sink yet.
struct InFlight {
    sender: Sender<Delivery>,
    delivery: Delivery,
}

/// Manages subscriptions and broadcasts snapshots by path.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Paths whose deliveries are parked in `in_flight`.
    held: RwLock<HashSet<StorePath>>,
    in_flight: Mutex<Vec<InFlight>>,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            held: RwLock::new(HashSet::new()),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Register a sink for `path`.
    pub fn subscribe(&self, path: StorePath, sender: Sender<Delivery>) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let token = CancelToken::new();

        let subscription = Subscription {
            id,
            path: path.clone(),
            sender,
            token: token.clone(),
        };

        self.subscriptions.write().insert(id, subscription);
        debug!(subscription = ?id, path = %path, "subscribed");

        SubscriptionHandle::new(id, path, token)
    }

    /// Unsubscribe and clean up. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        match subs.remove(&id) {
            Some(sub) => {
                sub.token.cancel();
                debug!(subscription = ?id, path = %sub.path, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Count live subscriptions on one path.
    pub fn subscribers_of(&self, path: &StorePath) -> usize {
        self.subscriptions
            .read()
            .values()
            .filter(|s| &s.path == path && !s.token.is_cancelled())
            .count()
    }

    // --- Broadcasting ---

    /// Send an event to one subscription (initial snapshot).
    /// Returns false if the subscription was dropped.
    pub fn send_to(&self, id: SubscriptionId, event: SubscriptionEvent) -> bool {
        let delivered = {
            let subs = self.subscriptions.read();
            match subs.get(&id) {
                Some(sub) => self.dispatch(sub, event),
                None => return false,
            }
        };

        if !delivered {
            self.subscriptions.write().remove(&id);
        }
        delivered
    }

    /// Broadcast a snapshot to every subscription on `path`.
    pub fn broadcast(&self, path: &StorePath, event: SubscriptionEvent) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if &sub.path != path {
                    continue;
                }
                if sub.token.is_cancelled() || !self.dispatch(sub, event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                subs.remove(&id);
                trace!(subscription = ?id, "dropped dead subscription");
            }
        }
    }

    /// Terminate every subscription on `path` with a `Failed` event.
    /// Returns the number of subscriptions failed.
    pub fn fail(&self, path: &StorePath, reason: DropReason) -> usize {
        let mut subs = self.subscriptions.write();
        let ids: Vec<SubscriptionId> = subs
            .values()
            .filter(|s| &s.path == path)
            .map(|s| s.id)
            .collect();

        for id in &ids {
            if let Some(sub) = subs.remove(id) {
                let _ = self.dispatch(
                    &sub,
                    SubscriptionEvent::Failed {
                        reason: reason.clone(),
                    },
                );
            }
        }
        ids.len()
    }

    /// Either park the event (held path) or push it into the sink.
    fn dispatch(&self, sub: &Subscription, event: SubscriptionEvent) -> bool {
        if self.held.read().contains(&sub.path) {
            self.in_flight.lock().push(InFlight {
                sender: sub.sender.clone(),
                delivery: sub.delivery(event),
            });
            return true;
        }
        sub.try_send(event)
    }

    // --- Latency simulation ---

    /// Park deliveries for `path` until `release`.
    pub fn hold(&self, path: StorePath) {
        self.held.write().insert(path);
    }

    /// Push parked deliveries for `path` into their sinks, in order.
    ///
    /// Parked deliveries are already on the wire: they are delivered even if
    /// their subscription was cancelled after they were parked.
    pub fn release(&self, path: &StorePath) -> usize {
        self.held.write().remove(path);

        let released: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock();
            let (matching, rest): (Vec<InFlight>, Vec<InFlight>) = in_flight
                .drain(..)
                .partition(|f| &f.delivery.path == path);
            *in_flight = rest;
            matching
        };

        let count = released.len();
        for InFlight { sender, delivery } in released {
            let _ = sender.try_send(delivery);
        }
        count
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Topic, TopicId};
    use crossbeam_channel::unbounded;

    fn topics_event(ids: &[&str]) -> SubscriptionEvent {
        SubscriptionEvent::Topics {
            topics: ids
                .iter()
                .map(|id| Topic::new(*id, "title", "author", "general"))
                .collect(),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = SubscriptionManager::new();
        let (tx, _rx) = unbounded();

        let handle = manager.subscribe(StorePath::Topics, tx);
        assert_eq!(manager.subscription_count(), 1);

        assert!(manager.unsubscribe(handle.id));
        assert_eq!(manager.subscription_count(), 0);
        assert!(handle.is_cancelled());
        assert!(!manager.unsubscribe(handle.id));
    }

    #[test]
    fn test_broadcast_to_matching_path() {
        let manager = SubscriptionManager::new();
        let (tx, rx) = unbounded();

        let topics = manager.subscribe(StorePath::Topics, tx.clone());
        let _replies = manager.subscribe(StorePath::replies("t1"), tx);

        manager.broadcast(&StorePath::Topics, topics_event(&["t1"]));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.subscription, topics.id);
        assert_eq!(delivery.path, StorePath::Topics);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_sink_is_dropped() {
        let manager = SubscriptionManager::new();
        let (tx, rx) = unbounded();
        manager.subscribe(StorePath::Topics, tx);
        drop(rx);

        manager.broadcast(&StorePath::Topics, topics_event(&[]));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_fail_sends_terminal_event() {
        let manager = SubscriptionManager::new();
        let (tx, rx) = unbounded();
        let path = StorePath::replies("t1");
        manager.subscribe(path.clone(), tx);

        assert_eq!(manager.fail(&path, DropReason::PermissionDenied), 1);
        assert_eq!(manager.subscription_count(), 0);

        let delivery = rx.try_recv().unwrap();
        assert_eq!(
            delivery.event,
            SubscriptionEvent::Failed {
                reason: DropReason::PermissionDenied
            }
        );
    }

    #[test]
    fn test_held_deliveries_survive_cancellation() {
        let manager = SubscriptionManager::new();
        let (tx, rx) = unbounded();
        let path = StorePath::replies("t1");
        let handle = manager.subscribe(path.clone(), tx);

        manager.hold(path.clone());
        manager.broadcast(
            &path,
            SubscriptionEvent::Replies {
                topic_id: TopicId::from("t1"),
                replies: vec![],
            },
        );
        assert!(rx.try_recv().is_err());

        // Cancelled after the event left the store
        manager.unsubscribe(handle.id);

        assert_eq!(manager.release(&path), 1);
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.subscription, handle.id);
    }

    #[test]
    fn test_release_only_matching_path() {
        let manager = SubscriptionManager::new();
        let (tx, rx) = unbounded();
        manager.subscribe(StorePath::Topics, tx.clone());
        manager.subscribe(StorePath::replies("t1"), tx);

        manager.hold(StorePath::Topics);
        manager.hold(StorePath::replies("t1"));
        manager.broadcast(&StorePath::Topics, topics_event(&["t1"]));
        manager.broadcast(
            &StorePath::replies("t1"),
            SubscriptionEvent::Replies {
                topic_id: TopicId::from("t1"),
                replies: vec![],
            },
        );

        assert_eq!(manager.release(&StorePath::replies("t1")), 1);
        assert_eq!(rx.try_recv().unwrap().path, StorePath::replies("t1"));
        assert!(rx.try_recv().is_err());

        assert_eq!(manager.release(&StorePath::Topics), 1);
        assert_eq!(rx.try_recv().unwrap().path, StorePath::Topics);
    }
}
