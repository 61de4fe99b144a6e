//! Core types for topics, replies and store paths.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a topic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub String);

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({})", self.0)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TopicId {
    fn from(s: &str) -> Self {
        TopicId(s.to_string())
    }
}

impl From<String> for TopicId {
    fn from(s: String) -> Self {
        TopicId(s)
    }
}

/// Identifier for a reply. Only unique within its topic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyId(pub String);

impl fmt::Debug for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplyId({})", self.0)
    }
}

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReplyId {
    fn from(s: &str) -> Self {
        ReplyId(s.to_string())
    }
}

impl From<String> for ReplyId {
    fn from(s: String) -> Self {
        ReplyId(s)
    }
}

/// Globally unique key for a reply.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplyKey {
    pub topic_id: TopicId,
    pub reply_id: ReplyId,
}

impl ReplyKey {
    pub fn new(topic_id: impl Into<TopicId>, reply_id: impl Into<ReplyId>) -> Self {
        Self {
            topic_id: topic_id.into(),
            reply_id: reply_id.into(),
        }
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. Clocks before the epoch read as zero.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(millis)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Display status of a topic, derived from its flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicStatus {
    Pinned,
    Locked,
    Active,
}

impl TopicStatus {
    /// Pinned wins over locked.
    pub fn derive(pinned: bool, locked: bool) -> Self {
        if pinned {
            TopicStatus::Pinned
        } else if locked {
            TopicStatus::Locked
        } else {
            TopicStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Pinned => "pinned",
            TopicStatus::Locked => "locked",
            TopicStatus::Active => "active",
        }
    }
}

impl fmt::Display for TopicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forum topic as stored in the backing store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: TopicId,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub category: String,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub locked: bool,
}

impl Topic {
    /// Create an unpinned, unlocked topic created now.
    pub fn new(
        id: impl Into<TopicId>,
        title: impl Into<String>,
        author: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: id.into(),
            title: title.into(),
            author: author.into(),
            category: category.into(),
            created_at: now,
            last_activity: now,
            pinned: false,
            locked: false,
        }
    }

    pub fn with_last_activity(mut self, at: Timestamp) -> Self {
        self.last_activity = at;
        self
    }

    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn status(&self) -> TopicStatus {
        TopicStatus::derive(self.pinned, self.locked)
    }
}

/// A reply inside a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: ReplyId,
    /// Back-reference to the owning topic.
    pub topic_id: TopicId,
    pub author: String,
    pub content: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub reported: bool,
    #[serde(default)]
    pub report_count: u32,
}

impl Reply {
    pub fn new(
        topic_id: impl Into<TopicId>,
        id: impl Into<ReplyId>,
        author: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            topic_id: topic_id.into(),
            author: author.into(),
            content: content.into(),
            created_at: Timestamp::now(),
            reported: false,
            report_count: 0,
        }
    }

    pub fn key(&self) -> ReplyKey {
        ReplyKey {
            topic_id: self.topic_id.clone(),
            reply_id: self.id.clone(),
        }
    }
}

/// Location of a subscribable collection in the backing store.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "topic", rename_all = "snake_case")]
pub enum StorePath {
    /// The topic collection.
    Topics,
    /// The replies of one topic.
    Replies(TopicId),
}

impl StorePath {
    pub fn replies(topic_id: impl Into<TopicId>) -> Self {
        StorePath::Replies(topic_id.into())
    }

    /// The topic this path is scoped to, if any.
    pub fn topic_id(&self) -> Option<&TopicId> {
        match self {
            StorePath::Topics => None,
            StorePath::Replies(id) => Some(id),
        }
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({})", self)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorePath::Topics => write!(f, "forum/topics"),
            StorePath::Replies(id) => write!(f, "forum/replies/{}", id),
        }
    }
}
