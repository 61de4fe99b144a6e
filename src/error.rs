//! Error types for the sync engine and its backing stores.

use crate::types::{ReplyId, StorePath, TopicId};
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A subscription could not be opened, or the topic subscription died.
    #[error("Subscription setup failed for {path}: {reason}")]
    SubscriptionSetup { path: StorePath, reason: String },

    /// A reply subscription reported an error after it was opened.
    #[error("Subscription delivery failed for {path}: {reason}")]
    SubscriptionDelivery { path: StorePath, reason: String },

    /// A remote write was rejected.
    #[error("Mutation {op} failed: {reason}")]
    Mutation { op: &'static str, reason: String },

    #[error("Topic not found: {0}")]
    TopicNotFound(TopicId),

    #[error("Reply not found: {0}/{1}")]
    ReplyNotFound(TopicId, ReplyId),

    #[error("Topic already exists: {0}")]
    TopicExists(TopicId),

    #[error("Engine has been disposed")]
    Disposed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Wrap a backend failure as a mutation error for `op`.
    pub fn mutation(op: &'static str, source: SyncError) -> Self {
        match source {
            SyncError::Mutation { .. } => source,
            other => SyncError::Mutation {
                op,
                reason: other.to_string(),
            },
        }
    }

    /// True for errors that end the topic watcher.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::SubscriptionSetup { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_wraps_store_error() {
        let err = SyncError::mutation("set_pinned", SyncError::TopicNotFound(TopicId::from("t1")));
        assert_eq!(
            err,
            SyncError::Mutation {
                op: "set_pinned",
                reason: "Topic not found: t1".to_string(),
            }
        );
    }

    #[test]
    fn test_mutation_not_double_wrapped() {
        let inner = SyncError::Mutation {
            op: "delete_topic",
            reason: "offline".to_string(),
        };
        assert_eq!(SyncError::mutation("delete_reply", inner.clone()), inner);
    }

    #[test]
    fn test_fatal_classification() {
        let setup = SyncError::SubscriptionSetup {
            path: StorePath::Topics,
            reason: "denied".to_string(),
        };
        let delivery = SyncError::SubscriptionDelivery {
            path: StorePath::replies("t1"),
            reason: "denied".to_string(),
        };
        assert!(setup.is_fatal());
        assert!(!delivery.is_fatal());
    }
}
