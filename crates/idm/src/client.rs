use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use comment_service_core::{
    IdentityError, IdentityLookup, Notification, NotificationSender, NotifyError, Profile,
};

/// Client for the identity management service: profile lookups and notification delivery.
#[derive(Clone)]
pub struct IdmClient {
    http: Client,
    base_url: Url,
}

impl IdmClient {
    /// Creates a new client. `base_url` should end with a slash so relative paths resolve
    /// below it.
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    /// Fetches the profile of the identity with the given id.
    pub async fn user_by_id(&self, id: &str) -> Result<Profile, IdmError> {
        let mut url = self.base_url.join("users")?;
        url.path_segments_mut()
            .map_err(|_| IdmError::BaseUrl(self.base_url.to_string()))?
            .push(id);

        let response = self.http.get(url).send().await?;
        parse_profile(response).await
    }

    /// Fetches the profile of the identity with the given username.
    pub async fn user_by_name(&self, name: &str) -> Result<Profile, IdmError> {
        let mut url = self.base_url.join("users")?;
        url.query_pairs_mut().append_pair("name", name);

        let response = self.http.get(url).send().await?;
        parse_profile(response).await
    }

    /// Asks the identity service to deliver a notification email.
    pub async fn notify(&self, notification: &Notification) -> Result<(), IdmError> {
        let url = self.base_url.join("notifications")?;
        let body = NotificationRequest {
            target_users: vec![&notification.target_user_id],
            sender_user_id: &notification.sender_user_id,
            email: EmailPayload {
                subject: &notification.subject,
                body: &notification.html_body,
            },
        };

        let response = self.http.post(url).json(&body).send().await?;
        ensure_success(response).await
    }
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    profile: Profile,
}

#[derive(Debug, Serialize)]
struct NotificationRequest<'a> {
    target_users: Vec<&'a str>,
    sender_user_id: &'a str,
    email: EmailPayload<'a>,
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    subject: &'a str,
    body: &'a str,
}

/// Errors produced by the identity management client.
#[derive(Debug, Error)]
pub enum IdmError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url {0} cannot carry path segments")]
    BaseUrl(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("not found")]
    NotFound,
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl From<IdmError> for IdentityError {
    fn from(err: IdmError) -> Self {
        match err {
            IdmError::NotFound => Self::NotFound,
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<IdmError> for NotifyError {
    fn from(err: IdmError) -> Self {
        match err {
            IdmError::Status { status, body } if status.is_client_error() => {
                Self::Rejected(format!("{status}: {body}"))
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl IdentityLookup for IdmClient {
    async fn lookup_by_id(&self, id: &str) -> Result<Profile, IdentityError> {
        Ok(self.user_by_id(id).await?)
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Profile, IdentityError> {
        Ok(self.user_by_name(name).await?)
    }
}

#[async_trait]
impl NotificationSender for IdmClient {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        Ok(self.notify(notification).await?)
    }
}

async fn status_error(response: Response) -> IdmError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return IdmError::NotFound;
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<unavailable>"));
    IdmError::Status { status, body }
}

async fn ensure_success(response: Response) -> Result<(), IdmError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    Ok(())
}

async fn parse_profile(response: Response) -> Result<Profile, IdmError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    let body: ProfileResponse = response.json().await?;
    Ok(body.profile)
}
