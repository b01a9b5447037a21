//! Domain layer of the comment service: threads, mentions and notification planning.
//!
//! Collaborators (storage, identity service, notification delivery) are reached through
//! the traits in [`store`], [`identity`] and [`notify`] so the other crates can plug in
//! concrete implementations.

pub mod identity;
pub mod markdown;
pub mod mention;
pub mod notify;
pub mod store;
pub mod tree;
pub mod types;

pub use identity::{IdentityError, IdentityLookup, IdentityMentionResolver, MentionResolver};
pub use markdown::{Cancellation, MarkdownError, MarkdownRenderer, Rendered};
pub use notify::{
    plan_targets, Notification, NotificationReason, NotificationSender, NotificationTargets,
    NotifyError,
};
pub use store::{CommentStore, StoreError, Thread};
pub use tree::{
    ancestor_chain, CommentTree, CommentTreeView, CommentView, TreeError, MAX_THREAD_DEPTH,
};
pub use types::{
    Comment, CommentId, CreationMode, InvalidCommentId, NotificationType, Profile, Scope,
};
