use std::{sync::Arc, time::Duration};

use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use comment_service_core::{
    ancestor_chain, plan_targets, Cancellation, Comment, CommentStore, IdentityError,
    IdentityLookup, MarkdownError, MarkdownRenderer, Notification, NotificationSender, StoreError,
    TreeError,
};

/// Fans out notifications about newly created comments.
///
/// Every dispatch runs as a detached task bounded by `timeout`; notifications are
/// best-effort and sent one at a time.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn CommentStore>,
    identities: Arc<dyn IdentityLookup>,
    sender: Arc<dyn NotificationSender>,
    renderer: MarkdownRenderer,
    timeout: Duration,
}

/// Counts of a finished dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Final state of a spawned dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    Completed(DispatchReport),
    Failed(DispatchError),
    TimedOut,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load author profile: {0}")]
    Author(IdentityError),
    #[error("failed to load ancestors: {0}")]
    Ancestors(#[from] StoreError),
    #[error("inconsistent thread: {0}")]
    Tree(#[from] TreeError),
    #[error("failed to render comment: {0}")]
    Render(#[from] MarkdownError),
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CommentStore>,
        identities: Arc<dyn IdentityLookup>,
        sender: Arc<dyn NotificationSender>,
        renderer: MarkdownRenderer,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            identities,
            sender,
            renderer,
            timeout,
        }
    }

    /// Starts the dispatch for `comment` in the background.
    pub fn spawn(&self, comment: Comment) -> JoinHandle<DispatchOutcome> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let cancel = Cancellation::with_timeout(dispatcher.timeout);
            let result =
                tokio::time::timeout(dispatcher.timeout, dispatcher.dispatch(&comment, &cancel))
                    .await;
            match result {
                Ok(Ok(report)) => {
                    info!(
                        stage = "notify",
                        comment = %comment.id,
                        sent = report.sent,
                        failed = report.failed,
                        "notifications dispatched"
                    );
                    counter!("notification_dispatch_total", "result" => "completed")
                        .increment(1);
                    DispatchOutcome::Completed(report)
                }
                Ok(Err(DispatchError::Render(MarkdownError::Cancelled))) | Err(_) => {
                    warn!(
                        stage = "notify",
                        comment = %comment.id,
                        timeout_ms = dispatcher.timeout.as_millis() as u64,
                        "notification dispatch timed out"
                    );
                    counter!("notification_dispatch_total", "result" => "timeout").increment(1);
                    DispatchOutcome::TimedOut
                }
                Ok(Err(err)) => {
                    error!(stage = "notify", comment = %comment.id, error = %err, "notification dispatch aborted");
                    counter!("notification_dispatch_total", "result" => "failed").increment(1);
                    DispatchOutcome::Failed(err)
                }
            }
        })
    }

    /// Computes the targets for `comment` and sends one notification to each of them.
    pub async fn dispatch(
        &self,
        comment: &Comment,
        cancel: &Cancellation,
    ) -> Result<DispatchReport, DispatchError> {
        let author = self
            .identities
            .lookup_by_id(&comment.creator_id)
            .await
            .map_err(DispatchError::Author)?;

        let path = self.store.ancestor_chain(&comment.id).await?;
        let ancestors = ancestor_chain(comment, path)?;

        let rendered = self.renderer.render(&comment.content, cancel).await?;
        if rendered.unresolved > 0 {
            counter!("mentions_dropped_total").increment(rendered.unresolved as u64);
        }

        let targets = plan_targets(comment, &ancestors, &rendered.mentions);
        debug!(
            stage = "notify",
            comment = %comment.id,
            ancestors = ancestors.len(),
            mentions = rendered.mentions.len(),
            targets = targets.len(),
            "notification targets planned"
        );

        let mut report = DispatchReport::default();
        for (target, reason) in targets {
            let notification = Notification {
                target_user_id: target,
                sender_user_id: comment.creator_id.clone(),
                subject: reason.subject(author.visible_name()),
                html_body: rendered.html.clone(),
            };

            match self.sender.send(&notification).await {
                Ok(()) => {
                    report.sent += 1;
                    counter!("notifications_sent_total", "reason" => reason.as_str()).increment(1);
                }
                Err(err) => {
                    report.failed += 1;
                    counter!("notifications_failed_total", "reason" => reason.as_str())
                        .increment(1);
                    warn!(
                        stage = "notify",
                        comment = %comment.id,
                        target = %notification.target_user_id,
                        reason = reason.as_str(),
                        error = %err,
                        "failed to send notification"
                    );
                }
            }
        }

        Ok(report)
    }
}
