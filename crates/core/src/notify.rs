use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::{Comment, Profile};

/// Why an identity is notified about a new comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationReason {
    /// Authored one of the comments the new comment answers.
    Parent,
    /// Mentioned in the new comment.
    Mention,
}

impl NotificationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Mention => "mention",
        }
    }

    /// Subject line for a notification sent on behalf of `author`.
    pub fn subject(self, author: &str) -> String {
        match self {
            Self::Parent => format!("{author} replied to your comment"),
            Self::Mention => format!("{author} mentioned you in a comment"),
        }
    }
}

/// Identity ids to notify, with the reason for each.
///
/// Iteration order is unspecified.
pub type NotificationTargets = HashMap<String, NotificationReason>;

/// Computes who has to be notified about `comment`.
///
/// Ancestor authors are recorded with [`NotificationReason::Parent`]; mentioned identities
/// overwrite that with [`NotificationReason::Mention`]. The author of `comment` is never a
/// target, not even when mentioning themselves.
pub fn plan_targets(
    comment: &Comment,
    ancestors: &[Comment],
    mentions: &[Profile],
) -> NotificationTargets {
    let mut targets = NotificationTargets::new();
    for ancestor in ancestors {
        targets.insert(ancestor.creator_id.clone(), NotificationReason::Parent);
    }
    for profile in mentions {
        targets.insert(profile.id.clone(), NotificationReason::Mention);
    }
    targets.remove(&comment.creator_id);
    targets
}

/// Single notification handed to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub target_user_id: String,
    pub sender_user_id: String,
    pub subject: String,
    pub html_body: String,
}

/// Errors reported by a notification sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification was rejected: {0}")]
    Rejected(String),
    #[error("notification service unavailable: {0}")]
    Unavailable(String),
}

/// Delivers notifications to users.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}
