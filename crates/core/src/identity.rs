use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::types::Profile;

/// Errors reported by identity lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity not found")]
    NotFound,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

impl IdentityError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Read access to the identity service.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn lookup_by_id(&self, id: &str) -> Result<Profile, IdentityError>;

    async fn lookup_by_name(&self, name: &str) -> Result<Profile, IdentityError>;
}

/// Maps the raw tag of a mention to the mentioned identity.
#[async_trait]
pub trait MentionResolver: Send + Sync {
    async fn resolve_mention(&self, tag: &str) -> Result<Profile, IdentityError>;
}

/// Resolves mentions by identity id first and falls back to the username, but only when
/// the id lookup reported `NotFound`.
#[derive(Clone)]
pub struct IdentityMentionResolver {
    identities: Arc<dyn IdentityLookup>,
}

impl IdentityMentionResolver {
    pub fn new(identities: Arc<dyn IdentityLookup>) -> Self {
        Self { identities }
    }
}

#[async_trait]
impl MentionResolver for IdentityMentionResolver {
    async fn resolve_mention(&self, tag: &str) -> Result<Profile, IdentityError> {
        match self.identities.lookup_by_id(tag).await {
            Err(IdentityError::NotFound) => {
                debug!(stage = "markdown", %tag, "no identity with this id, trying username");
                self.identities.lookup_by_name(tag).await
            }
            other => other,
        }
    }
}
