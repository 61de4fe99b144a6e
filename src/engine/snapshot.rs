//! Immutable views emitted to consumers.

use super::sync::EngineState;
use crate::error::{Result, SyncError};
use crate::types::{Reply, ReplyId, ReplyKey, Timestamp, Topic, TopicId, TopicStatus};
use serde::Serialize;

/// A topic as shown to consumers, with derived fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicView {
    pub id: TopicId,
    pub title: String,
    pub author: String,
    pub category: String,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
    pub pinned: bool,
    pub locked: bool,
    pub status: TopicStatus,
    /// Replies currently merged for this topic.
    pub reply_count: usize,
}

impl TopicView {
    pub fn new(topic: &Topic, reply_count: usize) -> Self {
        Self {
            id: topic.id.clone(),
            title: topic.title.clone(),
            author: topic.author.clone(),
            category: topic.category.clone(),
            created_at: topic.created_at,
            last_activity: topic.last_activity,
            pinned: topic.pinned,
            locked: topic.locked,
            status: topic.status(),
            reply_count,
        }
    }
}

/// A reply in the flattened cross-topic list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyView {
    pub topic_id: TopicId,
    pub topic_title: String,
    pub id: ReplyId,
    pub author: String,
    pub content: String,
    pub created_at: Timestamp,
    pub reported: bool,
    pub report_count: u32,
}

impl ReplyView {
    pub fn new(topic: &Topic, reply: &Reply) -> Self {
        Self {
            topic_id: topic.id.clone(),
            topic_title: topic.title.clone(),
            id: reply.id.clone(),
            author: reply.author.clone(),
            content: reply.content.clone(),
            created_at: reply.created_at,
            reported: reply.reported,
            report_count: reply.report_count,
        }
    }

    pub fn key(&self) -> ReplyKey {
        ReplyKey {
            topic_id: self.topic_id.clone(),
            reply_id: self.id.clone(),
        }
    }
}

/// Everything a consumer needs to render the forum, frozen at one point.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Increments on every emitted snapshot.
    pub revision: u64,
    pub state: EngineState,
    /// Topics in display order.
    pub topics: Vec<TopicView>,
    /// Replies of all topics, grouped in topic display order.
    pub replies: Vec<ReplyView>,
    pub loading: bool,
    /// Fatal topic-level error, if the watcher died.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
    /// Topics whose reply data is degraded.
    pub failed_topics: Vec<TopicId>,
}

fn serialize_error<S>(error: &Option<SyncError>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl SyncSnapshot {
    /// The snapshot of an engine that has not started.
    pub fn empty() -> Self {
        Self {
            revision: 0,
            state: EngineState::Idle,
            topics: Vec::new(),
            replies: Vec::new(),
            loading: false,
            error: None,
            failed_topics: Vec::new(),
        }
    }

    pub fn topic(&self, id: &TopicId) -> Option<&TopicView> {
        self.topics.iter().find(|t| &t.id == id)
    }

    pub fn replies_for<'a>(&'a self, id: &'a TopicId) -> impl Iterator<Item = &'a ReplyView> + 'a {
        self.replies.iter().filter(move |r| &r.topic_id == id)
    }

    /// Replies flagged for moderation, most reported first.
    pub fn reported_replies(&self) -> Vec<&ReplyView> {
        let mut reported: Vec<&ReplyView> = self.replies.iter().filter(|r| r.reported).collect();
        reported.sort_by(|a, b| b.report_count.cmp(&a.report_count));
        reported
    }

    /// True if the topic's reply data could not be loaded.
    pub fn is_degraded(&self, id: &TopicId) -> bool {
        self.failed_topics.contains(id)
    }

    /// Same content, ignoring the revision counter.
    pub fn same_content(&self, other: &SyncSnapshot) -> bool {
        self.state == other.state
            && self.loading == other.loading
            && self.error == other.error
            && self.topics == other.topics
            && self.replies == other.replies
            && self.failed_topics == other.failed_topics
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_view(topic: &str, id: &str, count: u32) -> ReplyView {
        let topic = Topic::new(topic, "title", "ann", "general");
        let mut reply = Reply::new(topic.id.clone(), id, "bob", "text");
        reply.reported = count > 0;
        reply.report_count = count;
        ReplyView::new(&topic, &reply)
    }

    #[test]
    fn test_topic_view_derives_status() {
        let topic = Topic::new("t1", "Rules", "mod", "meta")
            .with_pinned(true)
            .with_locked(true);
        let view = TopicView::new(&topic, 4);
        assert_eq!(view.status, TopicStatus::Pinned);
        assert_eq!(view.reply_count, 4);
    }

    #[test]
    fn test_replies_for_and_reported() {
        let snapshot = SyncSnapshot {
            replies: vec![
                reply_view("t1", "r1", 0),
                reply_view("t2", "r1", 1),
                reply_view("t2", "r2", 5),
            ],
            ..SyncSnapshot::empty()
        };

        let t2 = TopicId::from("t2");
        assert_eq!(snapshot.replies_for(&t2).count(), 2);

        let reported = snapshot.reported_replies();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].id, ReplyId::from("r2"));
        assert_eq!(reported[0].key(), ReplyKey::new("t2", "r2"));
    }

    #[test]
    fn test_same_content_ignores_revision() {
        let a = SyncSnapshot::empty();
        let b = SyncSnapshot {
            revision: 9,
            ..SyncSnapshot::empty()
        };
        assert!(a.same_content(&b));
        assert_ne!(a, b);

        let c = SyncSnapshot {
            loading: true,
            ..SyncSnapshot::empty()
        };
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_json_export() {
        let snapshot = SyncSnapshot {
            error: Some(SyncError::Disposed),
            ..SyncSnapshot::empty()
        };
        let json = snapshot.to_json().unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["error"], "Engine has been disposed");
        assert_eq!(json["failedTopics"], serde_json::json!([]));
    }
}
