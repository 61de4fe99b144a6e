//! The sync engine: wires the topic watcher, reply aggregator and load
//! barrier together and emits snapshots.

use super::barrier::LoadBarrier;
use super::registry::{ReplyAggregator, ReplyUpdate};
use super::snapshot::{ReplyView, SyncSnapshot, TopicView};
use super::watcher::TopicWatcher;
use crate::error::{Result, SyncError};
use crate::store::Backend;
use crate::subscriptions::{Delivery, SubscriptionEvent, SubscriptionHandle};
use crate::types::{ReplyId, TopicId};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a [`SyncEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Created, not started.
    Idle,
    /// Topic watcher open, no topic snapshot yet.
    Initializing,
    /// At least one topic snapshot applied.
    Syncing,
    /// The topic watcher died. Last good data is kept; `start` retries.
    Errored,
    /// Torn down for good.
    Disposed,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Capacity of each consumer update channel. A consumer whose channel is
    /// full or closed is dropped.
    /// Default: 1000
    pub update_buffer: usize,

    /// Re-attach failed reply subscriptions on the next topic snapshot.
    /// Default: true
    pub retry_failed_replies: bool,

    /// Max deliveries handled per `process_pending` call (0 = no limit).
    pub max_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_buffer: 1000,
            retry_failed_replies: true,
            max_batch: 0,
        }
    }
}

type UpdateCallback = Box<dyn FnMut(&Arc<SyncSnapshot>) + Send>;

/// A registered consumer of snapshots.
enum UpdateSink {
    Channel(Sender<Arc<SyncSnapshot>>),
    Callback(UpdateCallback),
}

impl UpdateSink {
    /// Returns false if the consumer should be dropped.
    fn deliver(&mut self, snapshot: &Arc<SyncSnapshot>) -> bool {
        match self {
            UpdateSink::Channel(sender) => match sender.try_send(Arc::clone(snapshot)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("update consumer fell behind, dropping it");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            UpdateSink::Callback(callback) => {
                callback(snapshot);
                true
            }
        }
    }
}

/// A topic deletion the caller has been shown and agreed to.
///
/// Deleting a topic orphans its replies in the backing store, so the write
/// can only be issued with a value obtained from
/// [`SyncEngine::prepare_delete_topic`].
#[derive(Debug, PartialEq, Eq)]
pub struct TopicDeletion {
    topic_id: TopicId,
    title: String,
    orphaned_replies: usize,
}

impl TopicDeletion {
    pub fn topic_id(&self) -> &TopicId {
        &self.topic_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Replies known locally that the deletion will orphan.
    pub fn orphaned_replies(&self) -> usize {
        self.orphaned_replies
    }
}

/// Keeps a consistent local view of topics and all their replies.
///
/// The engine is single-threaded: every subscription pushes into one inbox
/// and all state changes happen inside [`process_pending`] (or
/// [`wait_and_process`]). Deliveries from different subscriptions may
/// interleave in any order; a delivery whose subscription was cancelled
/// before it is handled is dropped without touching state.
///
/// [`process_pending`]: SyncEngine::process_pending
/// [`wait_and_process`]: SyncEngine::wait_and_process
pub struct SyncEngine<B: Backend> {
    backend: B,
    config: SyncConfig,
    state: EngineState,

    /// Shared sink handed to every subscription.
    inbox: Sender<Delivery>,
    inbox_rx: Receiver<Delivery>,

    watcher: TopicWatcher,
    replies: ReplyAggregator,
    barrier: LoadBarrier,
    /// Fatal topic-level error, cleared by the next good topic snapshot.
    error: Option<SyncError>,

    /// Last emitted snapshot.
    snapshot: Arc<SyncSnapshot>,
    sinks: Vec<UpdateSink>,
}

impl<B: Backend> SyncEngine<B> {
    /// Create an idle engine over `backend`.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, SyncConfig::default())
    }

    pub fn with_config(backend: B, config: SyncConfig) -> Self {
        let (inbox, inbox_rx) = unbounded();
        Self {
            backend,
            config,
            state: EngineState::Idle,
            inbox,
            inbox_rx,
            watcher: TopicWatcher::new(),
            replies: ReplyAggregator::new(),
            barrier: LoadBarrier::new(),
            error: None,
            snapshot: Arc::new(SyncSnapshot::empty()),
            sinks: Vec::new(),
        }
    }

    // --- Lifecycle ---

    /// Open the topic watcher. Also retries after a topic-level error.
    ///
    /// A setup failure moves the engine to `Errored`, is reflected in the
    /// emitted snapshot, and is returned.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            EngineState::Disposed => return Err(SyncError::Disposed),
            EngineState::Initializing | EngineState::Syncing => {
                return Err(SyncError::InvalidState(format!(
                    "cannot start while {:?}",
                    self.state
                )))
            }
            EngineState::Idle | EngineState::Errored => {}
        }

        match self.watcher.start(&self.backend, self.inbox.clone()) {
            Ok(()) => {
                self.state = EngineState::Initializing;
                info!("sync engine started");
                self.emit();
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "topic watcher failed to start");
                self.state = EngineState::Errored;
                self.error = Some(err.clone());
                self.emit();
                Err(err)
            }
        }
    }

    /// Tear everything down. Idempotent and valid from any state.
    ///
    /// Every reply subscription and the topic subscription are cancelled
    /// before this returns. The last emitted snapshot stays readable through
    /// [`snapshot`](Self::snapshot); consumers get no further updates.
    pub fn dispose(&mut self) {
        if self.state == EngineState::Disposed {
            return;
        }

        // Topics and merged replies stay as of the last snapshot
        let closed = self.replies.close_all(&self.backend);
        self.watcher.stop(&self.backend);
        self.state = EngineState::Disposed;

        let discarded = self.inbox_rx.try_iter().count();
        self.sinks.clear();
        info!(closed, discarded, "sync engine disposed");
    }

    // --- Event loop ---

    /// Handle every queued delivery without blocking. Returns the number of
    /// deliveries taken off the queue.
    pub fn process_pending(&mut self) -> usize {
        if self.state == EngineState::Disposed {
            self.inbox_rx.try_iter().count();
            return 0;
        }

        let mut handled = 0;
        while self.config.max_batch == 0 || handled < self.config.max_batch {
            match self.inbox_rx.try_recv() {
                Ok(delivery) => {
                    self.handle(delivery);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    /// Block up to `timeout` for the next delivery, then drain the queue.
    pub fn wait_and_process(&mut self, timeout: Duration) -> Result<usize> {
        if self.state == EngineState::Disposed {
            return Err(SyncError::Disposed);
        }

        match self.inbox_rx.recv_timeout(timeout) {
            Ok(delivery) => {
                self.handle(delivery);
                Ok(1 + self.process_pending())
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            // The engine holds a sender, so the queue cannot disconnect.
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    fn handle(&mut self, delivery: Delivery) {
        if self.watcher.owns(&delivery) {
            self.on_topic_event(delivery.event);
        } else {
            self.on_reply_delivery(delivery);
        }
    }

    fn on_topic_event(&mut self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Topics { topics } => {
                let topic_ids: Vec<TopicId> = self
                    .watcher
                    .apply(topics)
                    .iter()
                    .map(|t| t.id.clone())
                    .collect();
                let was_armed = self.barrier.is_armed();
                let was_loaded = self.barrier.is_loaded();

                let reconciled = self.replies.reconcile(
                    &self.backend,
                    &topic_ids,
                    &self.inbox,
                    self.config.retry_failed_replies,
                );

                if was_armed {
                    for topic_id in &reconciled.removed {
                        self.barrier.withdraw(topic_id);
                    }
                } else {
                    self.barrier.reset(&topic_ids);
                    debug!(topics = topic_ids.len(), "load barrier armed");
                }
                for (topic_id, _) in &reconciled.failed {
                    self.barrier.mark_settled(topic_id);
                }
                self.log_load_complete(was_loaded);

                debug!(
                    topics = topic_ids.len(),
                    added = reconciled.added.len(),
                    removed = reconciled.removed.len(),
                    retried = reconciled.retried.len(),
                    "topic snapshot applied"
                );

                self.state = EngineState::Syncing;
                self.error = None;
            }
            SubscriptionEvent::Failed { reason } => {
                self.error = Some(self.watcher.fail(&self.backend, reason.to_string()));
                self.state = EngineState::Errored;
            }
            SubscriptionEvent::Replies { topic_id, .. } => {
                warn!(topic = %topic_id, "reply snapshot on the topic subscription ignored");
                return;
            }
        }
        self.emit();
    }

    fn on_reply_delivery(&mut self, delivery: Delivery) {
        let was_loaded = self.barrier.is_loaded();
        match self.replies.apply(&self.backend, delivery) {
            ReplyUpdate::Stale => return,
            ReplyUpdate::Merged {
                first: false,
                changed: false,
                ..
            } => return,
            ReplyUpdate::Merged {
                topic_id, first, ..
            }
            | ReplyUpdate::Failed {
                topic_id, first, ..
            } => {
                // Success or failure, the first event settles the topic.
                if first {
                    self.barrier.mark_settled(&topic_id);
                }
            }
        }
        self.log_load_complete(was_loaded);
        self.emit();
    }

    fn log_load_complete(&self, was_loaded: bool) {
        if !was_loaded && self.barrier.is_loaded() {
            info!("initial load complete");
        }
    }

    // --- Snapshots ---

    /// Loading until every initial topic has settled, and never while
    /// errored or idle. Frozen at its last value once disposed.
    pub fn is_loading(&self) -> bool {
        match self.state {
            EngineState::Initializing | EngineState::Syncing => !self.barrier.is_loaded(),
            EngineState::Disposed => self.snapshot.loading,
            EngineState::Idle | EngineState::Errored => false,
        }
    }

    fn build_snapshot(&self) -> SyncSnapshot {
        let topics = self.watcher.topics();

        let mut replies = Vec::new();
        let mut failed_topics = Vec::new();
        for topic in topics {
            replies.extend(
                self.replies
                    .replies(&topic.id)
                    .iter()
                    .map(|reply| ReplyView::new(topic, reply)),
            );
            if self.replies.failure(&topic.id).is_some() {
                failed_topics.push(topic.id.clone());
            }
        }

        SyncSnapshot {
            revision: self.snapshot.revision,
            state: self.state,
            topics: topics
                .iter()
                .map(|t| TopicView::new(t, self.replies.replies(&t.id).len()))
                .collect(),
            replies,
            loading: self.is_loading(),
            error: self.error.clone(),
            failed_topics,
        }
    }

    /// Publish a new snapshot if anything visible changed.
    fn emit(&mut self) {
        if self.state == EngineState::Disposed {
            return;
        }

        let mut next = self.build_snapshot();
        if next.same_content(&self.snapshot) {
            return;
        }
        next.revision = self.snapshot.revision + 1;
        let next = Arc::new(next);
        self.snapshot = Arc::clone(&next);

        let before = self.sinks.len();
        self.sinks.retain_mut(|sink| sink.deliver(&next));
        if self.sinks.len() < before {
            debug!(dropped = before - self.sinks.len(), "removed update consumers");
        }
    }

    /// The last emitted snapshot.
    pub fn snapshot(&self) -> Arc<SyncSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Receive every future snapshot, starting with the current one.
    ///
    /// After dispose the returned channel is already closed.
    pub fn subscribe_updates(&mut self) -> Receiver<Arc<SyncSnapshot>> {
        let (tx, rx) = bounded(self.config.update_buffer.max(1));
        if self.state != EngineState::Disposed {
            let mut sink = UpdateSink::Channel(tx);
            if sink.deliver(&self.snapshot) {
                self.sinks.push(sink);
            }
        }
        rx
    }

    /// Call `callback` with the current snapshot and every future one.
    pub fn on_update<F>(&mut self, callback: F)
    where
        F: FnMut(&Arc<SyncSnapshot>) + Send + 'static,
    {
        if self.state == EngineState::Disposed {
            return;
        }
        let mut sink = UpdateSink::Callback(Box::new(callback));
        sink.deliver(&self.snapshot);
        self.sinks.push(sink);
    }

    // --- Introspection ---

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Topic ids of the last applied topic snapshot.
    pub fn known_topic_ids(&self) -> BTreeSet<TopicId> {
        self.watcher.topics().iter().map(|t| t.id.clone()).collect()
    }

    /// Topic ids that own a reply subscription slot.
    pub fn attached_topic_ids(&self) -> BTreeSet<TopicId> {
        self.replies.registered_ids()
    }

    /// The live reply subscription of a topic.
    pub fn reply_subscription(&self, topic_id: &TopicId) -> Option<&SubscriptionHandle> {
        self.replies.handle(topic_id)
    }

    /// Topics of the initial load still waiting for their first reply event.
    pub fn pending_topics(&self) -> usize {
        self.barrier.pending_count()
    }

    // --- Mutations ---
    //
    // Each mutation is a single write. The engine never patches its own view;
    // the change shows up with the next snapshot from the store.

    fn ensure_active(&self) -> Result<()> {
        if self.state == EngineState::Disposed {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }

    /// First step of deleting a topic: describe what will be lost.
    pub fn prepare_delete_topic(&self, topic_id: &TopicId) -> Result<TopicDeletion> {
        self.ensure_active()?;
        let topic = self
            .watcher
            .topics()
            .iter()
            .find(|t| &t.id == topic_id)
            .ok_or_else(|| SyncError::TopicNotFound(topic_id.clone()))?;

        Ok(TopicDeletion {
            topic_id: topic.id.clone(),
            title: topic.title.clone(),
            orphaned_replies: self.replies.replies(topic_id).len(),
        })
    }

    /// Delete a topic after confirmation.
    pub fn delete_topic(&self, confirmed: TopicDeletion) -> Result<()> {
        self.ensure_active()?;
        self.write("delete_topic", |b| b.delete_topic(&confirmed.topic_id))?;
        info!(
            topic = %confirmed.topic_id,
            orphaned = confirmed.orphaned_replies,
            "topic deleted"
        );
        Ok(())
    }

    pub fn delete_reply(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()> {
        self.ensure_active()?;
        self.write("delete_reply", |b| b.delete_reply(topic_id, reply_id))
    }

    pub fn set_pinned(&self, topic_id: &TopicId, pinned: bool) -> Result<()> {
        self.ensure_active()?;
        self.write("set_pinned", |b| b.set_pinned(topic_id, pinned))
    }

    pub fn set_locked(&self, topic_id: &TopicId, locked: bool) -> Result<()> {
        self.ensure_active()?;
        self.write("set_locked", |b| b.set_locked(topic_id, locked))
    }

    /// Clear the moderation flag on a reply.
    pub fn dismiss_reports(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()> {
        self.ensure_active()?;
        self.write("dismiss_reports", |b| b.dismiss_reports(topic_id, reply_id))
    }

    fn write<F>(&self, op: &'static str, apply: F) -> Result<()>
    where
        F: FnOnce(&B) -> Result<()>,
    {
        apply(&self.backend).map_err(|err| {
            let err = SyncError::mutation(op, err);
            warn!(op, error = %err, "mutation failed");
            err
        })
    }
}

impl<B: Backend> Drop for SyncEngine<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscriptions::DropReason;
    use crate::types::{Reply, StorePath, Topic};

    fn store_with(topics: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in topics {
            store.insert_topic(Topic::new(*id, *id, "ann", "general")).unwrap();
        }
        store
    }

    #[test]
    fn test_idle_snapshot() {
        let engine = SyncEngine::new(store_with(&[]));
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::Idle);
        assert!(!snapshot.loading);
        assert_eq!(snapshot.revision, 0);
    }

    #[test]
    fn test_start_then_sync() {
        let store = store_with(&["t1", "t2"]);
        let mut engine = SyncEngine::new(Arc::clone(&store));

        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Initializing);
        assert!(engine.is_loading());

        // Topic snapshot, then one initial reply snapshot per topic
        engine.process_pending();
        engine.process_pending();
        assert_eq!(engine.state(), EngineState::Syncing);
        assert!(!engine.is_loading());
        assert_eq!(engine.attached_topic_ids(), engine.known_topic_ids());
        assert_eq!(store.subscription_count(), 3);
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let mut engine = SyncEngine::new(store_with(&[]));
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(SyncError::InvalidState(_))));
    }

    #[test]
    fn test_empty_forum_loads_immediately() {
        let mut engine = SyncEngine::new(store_with(&[]));
        engine.start().unwrap();
        engine.process_pending();
        assert_eq!(engine.state(), EngineState::Syncing);
        assert!(!engine.snapshot().loading);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let store = store_with(&["t1"]);
        let mut engine = SyncEngine::new(Arc::clone(&store));
        engine.start().unwrap();
        engine.process_pending();

        engine.dispose();
        engine.dispose();
        assert_eq!(engine.state(), EngineState::Disposed);
        assert_eq!(store.subscription_count(), 0);
        assert!(matches!(engine.start(), Err(SyncError::Disposed)));
    }

    #[test]
    fn test_drop_releases_subscriptions() {
        let store = store_with(&["t1", "t2"]);
        {
            let mut engine = SyncEngine::new(Arc::clone(&store));
            engine.start().unwrap();
            engine.process_pending();
            assert_eq!(store.subscription_count(), 3);
        }
        assert_eq!(store.subscription_count(), 0);
    }

    #[test]
    fn test_topic_failure_keeps_last_good_data() {
        let store = store_with(&["t1"]);
        store.insert_reply(Reply::new("t1", "r1", "bob", "hi")).unwrap();
        let mut engine = SyncEngine::new(Arc::clone(&store));
        engine.start().unwrap();
        engine.process_pending();
        engine.process_pending();

        store.fail_path(&StorePath::Topics, DropReason::PermissionDenied);
        engine.process_pending();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::Errored);
        assert!(!snapshot.loading);
        assert!(matches!(snapshot.error, Some(SyncError::SubscriptionSetup { .. })));
        assert_eq!(snapshot.topics.len(), 1);
        assert_eq!(snapshot.replies.len(), 1);
    }

    #[test]
    fn test_max_batch_limits_work() {
        let store = store_with(&["t1", "t2", "t3"]);
        let mut engine = SyncEngine::with_config(
            Arc::clone(&store),
            SyncConfig {
                max_batch: 1,
                ..Default::default()
            },
        );
        engine.start().unwrap();
        assert_eq!(engine.process_pending(), 1);
        assert_eq!(engine.pending_topics(), 3);
        assert_eq!(engine.process_pending(), 1);
        assert_eq!(engine.pending_topics(), 2);
    }

    #[test]
    fn test_mutation_after_dispose() {
        let mut engine = SyncEngine::new(store_with(&["t1"]));
        engine.dispose();
        let result = engine.set_pinned(&TopicId::from("t1"), true);
        assert_eq!(result, Err(SyncError::Disposed));
    }

    #[test]
    fn test_wait_and_process_times_out() {
        let mut engine = SyncEngine::new(store_with(&[]));
        let handled = engine.wait_and_process(Duration::from_millis(10)).unwrap();
        assert_eq!(handled, 0);
    }
}
