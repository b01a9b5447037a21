use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Comment, CommentId, Scope};

/// Errors surfaced by the document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    AlreadyExists(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A root comment together with the flat set of its transitive answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub root: Comment,
    pub descendants: Vec<Comment>,
}

/// Persistence for scopes and comments.
#[async_trait]
pub trait CommentStore: Send + Sync {
    /// Stores a new comment. Fails with `NotFound` when its scope does not exist.
    async fn create_comment(&self, comment: &Comment) -> Result<CommentId, StoreError>;

    async fn get_comment(&self, id: &CommentId) -> Result<Comment, StoreError>;

    /// Returns the comments on the path from `id` to its thread root, excluding `id`.
    async fn ancestor_chain(&self, id: &CommentId) -> Result<Vec<Comment>, StoreError>;

    /// Returns all transitive answers of `id` as a flat list.
    async fn descendants(&self, id: &CommentId) -> Result<Vec<Comment>, StoreError>;

    /// Returns every thread of `scope`, optionally narrowed to `reference`.
    async fn threads_by_scope(
        &self,
        scope: &str,
        reference: Option<&str>,
    ) -> Result<Vec<Thread>, StoreError>;

    async fn create_scope(&self, scope: &Scope) -> Result<(), StoreError>;

    async fn get_scope(&self, id: &str) -> Result<Scope, StoreError>;

    async fn update_scope(&self, id: &str, scope: &Scope) -> Result<(), StoreError>;

    /// Deletes a scope, and all of its comments when `cascade` is set.
    async fn delete_scope(&self, id: &str, cascade: bool) -> Result<(), StoreError>;

    async fn list_scopes(&self) -> Result<Vec<Scope>, StoreError>;
}
