use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How notifications for a scope should be delivered by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    #[default]
    Unspecified,
    Sms,
    Email,
}

impl NotificationType {
    /// Returns the canonical database representation for the notification type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }

    /// Parses the database representation. Unknown values fall back to `Unspecified`.
    pub fn from_db(value: &str) -> Self {
        match value {
            "sms" => Self::Sms,
            "email" => Self::Email,
            _ => Self::Unspecified,
        }
    }
}

/// Named namespace that owns comment threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub notification_type: NotificationType,
    #[serde(default)]
    pub view_comment_url_template: String,
    #[serde(default)]
    pub owners: Vec<String>,
}

/// Identifier of a stored comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(Uuid);

impl CommentId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CommentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CommentId {
    type Err = InvalidCommentId;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| InvalidCommentId(value.to_string()))
    }
}

/// Returned when a string cannot be parsed into a [`CommentId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid comment id {0:?}")]
pub struct InvalidCommentId(pub String);

/// A single comment. Comments are immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub scope: String,
    pub reference: Option<String>,
    pub content: String,
    pub parent_id: Option<CommentId>,
    pub created_at: DateTime<Utc>,
    pub creator_id: String,
}

/// Where a new comment is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationMode {
    /// Starts a new thread inside `scope`, optionally bound to `reference`.
    Root {
        scope: String,
        reference: Option<String>,
    },
    /// Answers an existing comment; scope and reference are inherited.
    Reply { parent_id: CommentId },
}

impl Comment {
    /// Creates a new root comment.
    pub fn new_root(
        scope: impl Into<String>,
        reference: Option<String>,
        content: impl Into<String>,
        creator_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CommentId::new(),
            scope: scope.into(),
            reference: reference.filter(|value| !value.is_empty()),
            content: content.into(),
            parent_id: None,
            created_at,
            creator_id: creator_id.into(),
        }
    }

    /// Creates an answer to `parent`, inheriting its scope and reference.
    pub fn new_reply(
        parent: &Comment,
        content: impl Into<String>,
        creator_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CommentId::new(),
            scope: parent.scope.clone(),
            reference: parent.reference.clone(),
            content: content.into(),
            parent_id: Some(parent.id),
            created_at,
            creator_id: creator_id.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Identity profile as returned by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Profile {
    /// Returns the display name, falling back to the username when unset.
    pub fn visible_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.username,
        }
    }
}
