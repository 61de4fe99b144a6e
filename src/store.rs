//! Backing store interface and an in-memory implementation.

use crate::error::{Result, SyncError};
use crate::subscriptions::{
    Delivery, DropReason, SubscriptionEvent, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
use crate::types::{Reply, ReplyId, StorePath, Timestamp, Topic, TopicId};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A push-based store the engine subscribes to and writes through.
///
/// `subscribe` must not block. Snapshots are pushed into `sink` whenever the
/// subscribed collection changes, each one a complete replacement.
pub trait Backend: Send + Sync {
    /// Open a subscription on `path`.
    fn subscribe(&self, path: &StorePath, sink: Sender<Delivery>) -> Result<SubscriptionHandle>;

    /// Close a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Remove a topic. Its replies are left behind, unreachable.
    fn delete_topic(&self, id: &TopicId) -> Result<()>;

    fn delete_reply(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()>;

    fn set_pinned(&self, id: &TopicId, pinned: bool) -> Result<()>;

    fn set_locked(&self, id: &TopicId, locked: bool) -> Result<()>;

    /// Clear the reported flag and count of a reply.
    fn dismiss_reports(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn subscribe(&self, path: &StorePath, sink: Sender<Delivery>) -> Result<SubscriptionHandle> {
        (**self).subscribe(path, sink)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        (**self).unsubscribe(id)
    }

    fn delete_topic(&self, id: &TopicId) -> Result<()> {
        (**self).delete_topic(id)
    }

    fn delete_reply(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()> {
        (**self).delete_reply(topic_id, reply_id)
    }

    fn set_pinned(&self, id: &TopicId, pinned: bool) -> Result<()> {
        (**self).set_pinned(id, pinned)
    }

    fn set_locked(&self, id: &TopicId, locked: bool) -> Result<()> {
        (**self).set_locked(id, locked)
    }

    fn dismiss_reports(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()> {
        (**self).dismiss_reports(topic_id, reply_id)
    }
}

/// Memory store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Push the current value to a new subscriber immediately.
    pub deliver_initial_snapshot: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            deliver_initial_snapshot: true,
        }
    }
}

#[derive(Default)]
struct ForumData {
    topics: BTreeMap<TopicId, Topic>,
    /// Replies per topic, in insertion order. May outlive the topic.
    replies: HashMap<TopicId, Vec<Reply>>,
}

impl ForumData {
    fn topics_event(&self) -> SubscriptionEvent {
        SubscriptionEvent::Topics {
            topics: self.topics.values().cloned().collect(),
        }
    }

    fn replies_event(&self, topic_id: &TopicId) -> SubscriptionEvent {
        SubscriptionEvent::Replies {
            topic_id: topic_id.clone(),
            replies: self.replies.get(topic_id).cloned().unwrap_or_default(),
        }
    }

    fn event_for(&self, path: &StorePath) -> SubscriptionEvent {
        match path {
            StorePath::Topics => self.topics_event(),
            StorePath::Replies(id) => self.replies_event(id),
        }
    }

    fn topic_mut(&mut self, id: &TopicId) -> Result<&mut Topic> {
        self.topics
            .get_mut(id)
            .ok_or_else(|| SyncError::TopicNotFound(id.clone()))
    }

    fn reply_mut(&mut self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<&mut Reply> {
        self.replies
            .get_mut(topic_id)
            .and_then(|list| list.iter_mut().find(|r| &r.id == reply_id))
            .ok_or_else(|| SyncError::ReplyNotFound(topic_id.clone(), reply_id.clone()))
    }
}

/// JSON fixture shape accepted by [`MemoryStore::from_json`].
#[derive(Deserialize)]
struct Fixture {
    #[serde(default)]
    topics: Vec<Topic>,
    #[serde(default)]
    replies: HashMap<TopicId, Vec<Reply>>,
}

/// In-process backing store with push subscriptions.
///
/// Besides the [`Backend`] operations it offers author-side writes
/// (`insert_topic`, `insert_reply`, ...) and fault injection used to
/// exercise subscribers: rejected paths, failed subscriptions, held
/// deliveries and read-only mode.
pub struct MemoryStore {
    config: StoreConfig,
    data: RwLock<ForumData>,
    subscriptions: SubscriptionManager,
    /// Paths that refuse new subscriptions.
    rejected: RwLock<HashSet<StorePath>>,
    read_only: AtomicBool,
    /// Serializes writes with their broadcast, and subscribe with its
    /// initial snapshot.
    write_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            data: RwLock::new(ForumData::default()),
            subscriptions: SubscriptionManager::new(),
            rejected: RwLock::new(HashSet::new()),
            read_only: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Build a store from a JSON fixture of the form
    /// `{"topics": [...], "replies": {"<topic id>": [...]}}`.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let fixture: Fixture = serde_json::from_value(value)?;
        let store = Self::new();
        {
            let mut data = store.data.write();
            for topic in fixture.topics {
                data.topics.insert(topic.id.clone(), topic);
            }
            for (topic_id, mut replies) in fixture.replies {
                for reply in &mut replies {
                    reply.topic_id = topic_id.clone();
                }
                data.replies.insert(topic_id, replies);
            }
        }
        Ok(store)
    }

    // --- Reads ---

    pub fn topic(&self, id: &TopicId) -> Option<Topic> {
        self.data.read().topics.get(id).cloned()
    }

    pub fn topic_count(&self) -> usize {
        self.data.read().topics.len()
    }

    pub fn replies(&self, topic_id: &TopicId) -> Vec<Reply> {
        self.data
            .read()
            .replies
            .get(topic_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    pub fn subscribers_of(&self, path: &StorePath) -> usize {
        self.subscriptions.subscribers_of(path)
    }

    // --- Author-side writes ---

    /// Add a new topic.
    pub fn insert_topic(&self, topic: Topic) -> Result<()> {
        self.write("insert_topic", |data| {
            if data.topics.contains_key(&topic.id) {
                return Err(SyncError::TopicExists(topic.id.clone()));
            }
            data.topics.insert(topic.id.clone(), topic);
            Ok(vec![StorePath::Topics])
        })
    }

    /// Replace an existing topic wholesale.
    pub fn update_topic(&self, topic: Topic) -> Result<()> {
        self.write("update_topic", |data| {
            let existing = data.topic_mut(&topic.id)?;
            *existing = topic;
            Ok(vec![StorePath::Topics])
        })
    }

    /// Advance a topic's last activity. Never moves it backwards.
    pub fn touch_topic(&self, id: &TopicId, at: Timestamp) -> Result<()> {
        self.write("touch_topic", |data| {
            let topic = data.topic_mut(id)?;
            topic.last_activity = topic.last_activity.max(at);
            Ok(vec![StorePath::Topics])
        })
    }

    /// Add or replace a reply, bumping the topic's last activity.
    pub fn insert_reply(&self, mut reply: Reply) -> Result<()> {
        self.write("insert_reply", |data| {
            let topic_id = reply.topic_id.clone();
            let topic = data.topic_mut(&topic_id)?;
            topic.last_activity = topic.last_activity.max(reply.created_at);

            let list = data.replies.entry(topic_id.clone()).or_default();
            reply.topic_id = topic_id.clone();
            match list.iter_mut().find(|r| r.id == reply.id) {
                Some(existing) => *existing = reply,
                None => list.push(reply),
            }
            Ok(vec![StorePath::Replies(topic_id), StorePath::Topics])
        })
    }

    /// Flag a reply for moderation.
    pub fn report_reply(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()> {
        self.write("report_reply", |data| {
            let reply = data.reply_mut(topic_id, reply_id)?;
            reply.reported = true;
            reply.report_count = reply.report_count.saturating_add(1);
            Ok(vec![StorePath::Replies(topic_id.clone())])
        })
    }

    // --- Fault injection ---

    /// Make future subscriptions on `path` fail to open.
    pub fn reject_path(&self, path: StorePath) {
        self.rejected.write().insert(path);
    }

    pub fn accept_path(&self, path: &StorePath) {
        self.rejected.write().remove(path);
    }

    /// Kill every live subscription on `path` with a terminal error.
    pub fn fail_path(&self, path: &StorePath, reason: DropReason) -> usize {
        let failed = self.subscriptions.fail(path, reason);
        info!(path = %path, failed, "failed subscriptions");
        failed
    }

    /// Keep deliveries for `path` in flight until [`release`](Self::release).
    pub fn hold(&self, path: StorePath) {
        self.subscriptions.hold(path);
    }

    /// Deliver everything held for `path`.
    pub fn release(&self, path: &StorePath) -> usize {
        self.subscriptions.release(path)
    }

    /// Reject every write while set.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    // --- Internals ---

    /// Apply a write and broadcast the paths it touched.
    fn write<F>(&self, op: &'static str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ForumData) -> Result<Vec<StorePath>>,
    {
        let _lock = self.write_lock.lock();

        if self.read_only.load(Ordering::SeqCst) {
            return Err(SyncError::Mutation {
                op,
                reason: "store is read-only".to_string(),
            });
        }

        let events: Vec<(StorePath, SubscriptionEvent)> = {
            let mut data = self.data.write();
            let touched = apply(&mut *data)?;
            touched
                .into_iter()
                .map(|path| {
                    let event = data.event_for(&path);
                    (path, event)
                })
                .collect()
        };

        debug!(op, paths = events.len(), "write applied");
        for (path, event) in events {
            self.subscriptions.broadcast(&path, event);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryStore {
    fn subscribe(&self, path: &StorePath, sink: Sender<Delivery>) -> Result<SubscriptionHandle> {
        if self.rejected.read().contains(path) {
            return Err(SyncError::SubscriptionSetup {
                path: path.clone(),
                reason: DropReason::PermissionDenied.to_string(),
            });
        }

        // Registration and the initial snapshot must not interleave with a
        // write, or the older snapshot could land after the newer broadcast.
        let _lock = self.write_lock.lock();
        let handle = self.subscriptions.subscribe(path.clone(), sink);

        if self.config.deliver_initial_snapshot {
            let event = self.data.read().event_for(path);
            if !self.subscriptions.send_to(handle.id, event) {
                return Err(SyncError::SubscriptionSetup {
                    path: path.clone(),
                    reason: DropReason::Disconnected.to_string(),
                });
            }
        }

        Ok(handle)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    fn delete_topic(&self, id: &TopicId) -> Result<()> {
        self.write("delete_topic", |data| {
            data.topics
                .remove(id)
                .ok_or_else(|| SyncError::TopicNotFound(id.clone()))?;
            Ok(vec![StorePath::Topics])
        })
    }

    fn delete_reply(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()> {
        self.write("delete_reply", |data| {
            let list = data
                .replies
                .get_mut(topic_id)
                .ok_or_else(|| SyncError::ReplyNotFound(topic_id.clone(), reply_id.clone()))?;
            let before = list.len();
            list.retain(|r| &r.id != reply_id);
            if list.len() == before {
                return Err(SyncError::ReplyNotFound(topic_id.clone(), reply_id.clone()));
            }
            Ok(vec![StorePath::Replies(topic_id.clone())])
        })
    }

    fn set_pinned(&self, id: &TopicId, pinned: bool) -> Result<()> {
        self.write("set_pinned", |data| {
            data.topic_mut(id)?.pinned = pinned;
            Ok(vec![StorePath::Topics])
        })
    }

    fn set_locked(&self, id: &TopicId, locked: bool) -> Result<()> {
        self.write("set_locked", |data| {
            data.topic_mut(id)?.locked = locked;
            Ok(vec![StorePath::Topics])
        })
    }

    fn dismiss_reports(&self, topic_id: &TopicId, reply_id: &ReplyId) -> Result<()> {
        self.write("dismiss_reports", |data| {
            let reply = data.reply_mut(topic_id, reply_id)?;
            reply.reported = false;
            reply.report_count = 0;
            Ok(vec![StorePath::Replies(topic_id.clone())])
        })
    }
}
