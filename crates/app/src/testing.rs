//! Deterministic collaborators shared by the app tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use comment_service_core::{
    CommentStore, IdentityError, IdentityLookup, Notification, NotificationSender, NotifyError,
    Profile, Scope,
};
use comment_service_storage::Database;

pub async fn memory_database() -> Database {
    let database = Database::connect("sqlite::memory:")
        .await
        .expect("connect");
    database.run_migrations().await.expect("migrations");
    database
}

pub async fn database_with_scope(scope_id: &str) -> Database {
    let database = memory_database().await;
    database
        .create_scope(&Scope {
            id: scope_id.to_string(),
            name: format!("{scope_id} scope"),
            ..Scope::default()
        })
        .await
        .expect("create scope");
    database
}

pub fn profile(id: &str, username: &str, display_name: Option<&str>) -> Profile {
    Profile {
        id: id.to_string(),
        username: username.to_string(),
        display_name: display_name.map(str::to_string),
    }
}

#[derive(Default)]
pub struct FakeIdentities {
    profiles: Vec<Profile>,
    broken: HashSet<String>,
}

impl FakeIdentities {
    pub fn with(mut self, profile: Profile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Lookups of `id` fail with a service error.
    pub fn broken(mut self, id: &str) -> Self {
        self.broken.insert(id.to_string());
        self
    }
}

#[async_trait]
impl IdentityLookup for FakeIdentities {
    async fn lookup_by_id(&self, id: &str) -> Result<Profile, IdentityError> {
        if self.broken.contains(id) {
            return Err(IdentityError::Unavailable("identity service down".into()));
        }
        self.profiles
            .iter()
            .find(|profile| profile.id == id)
            .cloned()
            .ok_or(IdentityError::NotFound)
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Profile, IdentityError> {
        self.profiles
            .iter()
            .find(|profile| profile.username == name)
            .cloned()
            .ok_or(IdentityError::NotFound)
    }
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Notification>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub fn failing_for(mut self, target: &str) -> Self {
        self.failing.insert(target.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("sender lock").clone()
    }

    pub fn sent_by_target(&self) -> HashMap<String, Notification> {
        self.sent()
            .into_iter()
            .map(|notification| (notification.target_user_id.clone(), notification))
            .collect()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&notification.target_user_id) {
            return Err(NotifyError::Unavailable("mailer down".into()));
        }
        self.sent
            .lock()
            .expect("sender lock")
            .push(notification.clone());
        Ok(())
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
