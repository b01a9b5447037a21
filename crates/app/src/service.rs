use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use comment_service_core::{
    Cancellation, Comment, CommentId, CommentStore, CommentTree, CommentTreeView, CreationMode,
    InvalidCommentId, MarkdownError, MarkdownRenderer, Scope, StoreError, TreeError,
    MAX_THREAD_DEPTH,
};

use crate::notifier::{DispatchOutcome, Dispatcher};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Time one request may spend rendering markdown.
pub const RENDER_BUDGET: Duration = Duration::from_secs(10);

/// Comment and scope operations exposed over HTTP.
#[derive(Clone)]
pub struct CommentService {
    store: Arc<dyn CommentStore>,
    renderer: MarkdownRenderer,
    dispatcher: Dispatcher,
    clock: Clock,
    render_budget: Duration,
}

/// How a comment tree should be projected.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeOptions {
    pub recurse: bool,
    pub render_html: bool,
}

/// A stored comment plus the handle of its notification dispatch.
pub struct Created {
    pub comment: Comment,
    pub dispatch: JoinHandle<DispatchOutcome>,
}

impl CommentService {
    pub fn new(
        store: Arc<dyn CommentStore>,
        renderer: MarkdownRenderer,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            renderer,
            dispatcher,
            clock: Arc::new(Utc::now),
            render_budget: RENDER_BUDGET,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn with_render_budget(mut self, budget: Duration) -> Self {
        self.render_budget = budget;
        self
    }

    /// Persists a new comment and starts notifying the participants of its thread.
    pub async fn create_comment(
        &self,
        author: &str,
        content: String,
        mode: CreationMode,
    ) -> Result<Created, ServiceError> {
        if author.is_empty() {
            return Err(ServiceError::Unauthenticated);
        }

        let now = (self.clock)();
        let comment = match mode {
            CreationMode::Root { scope, reference } => {
                if scope.is_empty() {
                    return Err(ServiceError::InvalidArgument("scope must not be empty".into()));
                }
                Comment::new_root(scope, reference, content, author, now)
            }
            CreationMode::Reply { parent_id } => {
                let parent = self.store.get_comment(&parent_id).await?;
                let parent_depth = self.store.ancestor_chain(&parent.id).await?.len();
                if parent_depth >= MAX_THREAD_DEPTH {
                    return Err(ServiceError::InvalidArgument(format!(
                        "replies cannot be nested more than {MAX_THREAD_DEPTH} levels deep"
                    )));
                }
                Comment::new_reply(&parent, content, author, now)
            }
        };

        self.store.create_comment(&comment).await?;
        counter!("comments_created_total").increment(1);
        info!(
            stage = "comments",
            comment = %comment.id,
            scope = %comment.scope,
            root = comment.is_root(),
            "comment created"
        );

        let dispatch = self.dispatcher.spawn(comment.clone());
        Ok(Created { comment, dispatch })
    }

    /// Loads a comment, optionally with its whole answer tree.
    pub async fn get_comment(
        &self,
        raw_id: &str,
        options: TreeOptions,
    ) -> Result<CommentTreeView, ServiceError> {
        let id: CommentId = raw_id
            .parse()
            .map_err(|err: InvalidCommentId| ServiceError::InvalidArgument(err.to_string()))?;

        let comment = self.store.get_comment(&id).await?;
        let tree = if options.recurse {
            let descendants = self.store.descendants(&id).await?;
            CommentTree::build(comment, descendants)?
        } else {
            CommentTree::leaf(comment)
        };

        self.project(tree, options).await
    }

    /// Loads every thread of `scope`, optionally narrowed to `reference`.
    pub async fn list_comments(
        &self,
        scope: &str,
        reference: Option<&str>,
        options: TreeOptions,
    ) -> Result<Vec<CommentTreeView>, ServiceError> {
        let reference = reference.filter(|value| !value.is_empty());
        let threads = self.store.threads_by_scope(scope, reference).await?;
        if threads.is_empty() {
            return Err(ServiceError::Store(StoreError::NotFound("comments")));
        }

        let mut views = Vec::with_capacity(threads.len());
        for thread in threads {
            let tree = if options.recurse {
                CommentTree::build(thread.root, thread.descendants)?
            } else {
                CommentTree::leaf(thread.root)
            };
            views.push(self.project(tree, options).await?);
        }
        Ok(views)
    }

    async fn project(
        &self,
        mut tree: CommentTree,
        options: TreeOptions,
    ) -> Result<CommentTreeView, ServiceError> {
        if options.render_html {
            self.render_tree(&mut tree).await?;
        }

        let view = tree.to_view(options.recurse);
        Ok(if options.recurse { view.minify() } else { view })
    }

    /// Replaces the content of every comment in `tree` with its HTML rendering.
    ///
    /// All comments share one render budget. Every comment is attempted and failures are
    /// reported together.
    async fn render_tree(&self, tree: &mut CommentTree) -> Result<(), RenderFailures> {
        let cancel = Cancellation::with_timeout(self.render_budget);
        let mut failures = Vec::new();

        for comment in tree.comments_mut() {
            match self.renderer.render(&comment.content, &cancel).await {
                Ok(rendered) => {
                    if rendered.unresolved > 0 {
                        counter!("mentions_dropped_total").increment(rendered.unresolved as u64);
                    }
                    comment.content = rendered.html;
                }
                Err(err) => {
                    warn!(stage = "markdown", comment = %comment.id, error = %err, "failed to render comment");
                    failures.push((comment.id, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RenderFailures(failures))
        }
    }

    pub async fn create_scope(&self, scope: Scope) -> Result<Scope, ServiceError> {
        validate_scope(&scope)?;
        self.store.create_scope(&scope).await?;
        info!(stage = "scopes", scope = %scope.id, "scope created");
        Ok(scope)
    }

    pub async fn get_scope(&self, id: &str) -> Result<Scope, ServiceError> {
        Ok(self.store.get_scope(id).await?)
    }

    pub async fn list_scopes(&self) -> Result<Vec<Scope>, ServiceError> {
        Ok(self.store.list_scopes().await?)
    }

    /// Replaces the scope stored under `id`. The id inside `scope` is ignored.
    pub async fn update_scope(&self, id: &str, mut scope: Scope) -> Result<Scope, ServiceError> {
        scope.id = id.to_string();
        validate_scope(&scope)?;
        self.store.update_scope(id, &scope).await?;
        info!(stage = "scopes", scope = %id, "scope updated");
        Ok(scope)
    }

    pub async fn delete_scope(&self, id: &str, cascade: bool) -> Result<(), ServiceError> {
        self.store.delete_scope(id, cascade).await?;
        info!(stage = "scopes", scope = %id, cascade, "scope deleted");
        Ok(())
    }
}

fn validate_scope(scope: &Scope) -> Result<(), ServiceError> {
    if scope.id.is_empty() {
        return Err(ServiceError::InvalidArgument("scope id must not be empty".into()));
    }
    if scope.name.is_empty() {
        return Err(ServiceError::InvalidArgument(
            "scope name must not be empty".into(),
        ));
    }
    Ok(())
}

/// Comments of a tree that could not be rendered.
#[derive(Debug)]
pub struct RenderFailures(pub Vec<(CommentId, MarkdownError)>);

impl fmt::Display for RenderFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to render {} comment(s)", self.0.len())?;
        for (id, err) in &self.0 {
            write!(f, "; {id}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RenderFailures {}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no remote user specified")]
    Unauthenticated,
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Render(#[from] RenderFailures),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use comment_service_core::IdentityMentionResolver;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicI64, Ordering},
        time::Duration,
    };

    use crate::notifier::DispatchReport;
    use crate::testing::{
        database_with_scope, profile, shared, FakeIdentities, RecordingSender,
    };

    struct Harness {
        service: CommentService,
        store: Arc<dyn CommentStore>,
        sender: Arc<RecordingSender>,
    }

    async fn harness() -> Harness {
        let store: Arc<dyn CommentStore> = Arc::new(database_with_scope("tickets").await);
        let identities = shared(
            FakeIdentities::default()
                .with(profile("u-alice", "alice", Some("Alice")))
                .with(profile("u-bob", "bob", None)),
        );
        let sender = shared(RecordingSender::default());
        let renderer = MarkdownRenderer::new(Arc::new(IdentityMentionResolver::new(
            identities.clone(),
        )));
        let dispatcher = Dispatcher::new(
            store.clone(),
            identities,
            sender.clone(),
            renderer.clone(),
            Duration::from_secs(5),
        );

        // Strictly increasing timestamps keep creation order deterministic.
        let tick = Arc::new(AtomicI64::new(0));
        let base = Utc::now();
        let clock: Clock = Arc::new(move || {
            base + ChronoDuration::seconds(tick.fetch_add(1, Ordering::SeqCst))
        });

        Harness {
            service: CommentService::new(store.clone(), renderer, dispatcher).with_clock(clock),
            store,
            sender,
        }
    }

    fn root(reference: Option<&str>) -> CreationMode {
        CreationMode::Root {
            scope: "tickets".into(),
            reference: reference.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn reply_inherits_thread_and_notifies_parent() {
        let h = harness().await;
        let first = h
            .service
            .create_comment("u-alice", "question".into(), root(Some("t-1")))
            .await
            .expect("root");
        first.dispatch.await.expect("join");

        let reply = h
            .service
            .create_comment(
                "u-bob",
                "answer".into(),
                CreationMode::Reply {
                    parent_id: first.comment.id,
                },
            )
            .await
            .expect("reply");
        assert_eq!(reply.comment.scope, "tickets");
        assert_eq!(reply.comment.reference.as_deref(), Some("t-1"));

        let outcome = reply.dispatch.await.expect("join");
        assert!(matches!(
            outcome,
            DispatchOutcome::Completed(DispatchReport { sent: 1, failed: 0 })
        ));
        let sent = h.sender.sent();
        assert_eq!(sent[0].target_user_id, "u-alice");
        assert_eq!(sent[0].subject, "bob replied to your comment");
    }

    #[tokio::test]
    async fn reply_to_missing_parent_is_not_found() {
        let h = harness().await;
        let err = h
            .service
            .create_comment(
                "u-bob",
                "answer".into(),
                CreationMode::Reply {
                    parent_id: CommentId::new(),
                },
            )
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ServiceError::Store(StoreError::NotFound("comment"))));
    }

    #[tokio::test]
    async fn comment_needs_an_author_and_scope() {
        let h = harness().await;
        let err = h
            .service
            .create_comment("", "hi".into(), root(None))
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ServiceError::Unauthenticated));

        let err = h
            .service
            .create_comment("u-alice", "hi".into(), CreationMode::Root {
                scope: String::new(),
                reference: None,
            })
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        let err = h
            .service
            .create_comment("u-alice", "hi".into(), CreationMode::Root {
                scope: "unknown".into(),
                reference: None,
            })
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ServiceError::Store(StoreError::NotFound("scope"))));
    }

    #[tokio::test]
    async fn recursive_get_renders_and_minifies() {
        let h = harness().await;
        let first = h
            .service
            .create_comment("u-alice", "hey @bob".into(), root(Some("t-1")))
            .await
            .expect("root");
        h.service
            .create_comment(
                "u-bob",
                "**yes**".into(),
                CreationMode::Reply {
                    parent_id: first.comment.id,
                },
            )
            .await
            .expect("reply");

        let view = h
            .service
            .get_comment(
                &first.comment.id.to_string(),
                TreeOptions {
                    recurse: true,
                    render_html: true,
                },
            )
            .await
            .expect("get");

        assert_eq!(
            view.comment.content,
            "<p>hey <span class=\"mention\" data-user-id=\"u-bob\">@bob</span></p>\n"
        );
        assert_eq!(view.comment.scope.as_deref(), Some("tickets"));
        assert_eq!(view.answers.len(), 1);
        assert_eq!(view.answers[0].comment.content, "<p><strong>yes</strong></p>\n");
        assert_eq!(view.answers[0].comment.scope, None);
        assert_eq!(view.answers[0].comment.parent_id, None);
    }

    #[tokio::test]
    async fn get_without_recurse_keeps_raw_content() {
        let h = harness().await;
        let first = h
            .service
            .create_comment("u-alice", "*raw*".into(), root(None))
            .await
            .expect("root");

        let view = h
            .service
            .get_comment(&first.comment.id.to_string(), TreeOptions::default())
            .await
            .expect("get");
        assert_eq!(view.comment.content, "*raw*");
        assert!(view.answers.is_empty());
    }

    #[tokio::test]
    async fn malformed_id_is_invalid_argument() {
        let h = harness().await;
        let err = h
            .service
            .get_comment("not-an-id", TreeOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn list_filters_by_reference() {
        let h = harness().await;
        for (reference, content) in [("t-1", "one"), ("t-2", "two"), ("t-1", "three")] {
            h.service
                .create_comment("u-alice", content.into(), root(Some(reference)))
                .await
                .expect("create");
        }

        let all = h
            .service
            .list_comments("tickets", Some(""), TreeOptions::default())
            .await
            .expect("list");
        let contents: Vec<_> = all.iter().map(|v| v.comment.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        let filtered = h
            .service
            .list_comments("tickets", Some("t-1"), TreeOptions::default())
            .await
            .expect("list");
        assert_eq!(filtered.len(), 2);

        let err = h
            .service
            .list_comments("tickets", Some("t-9"), TreeOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, ServiceError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn scope_update_uses_path_id() {
        let h = harness().await;
        let updated = h
            .service
            .update_scope(
                "tickets",
                Scope {
                    id: "ignored".into(),
                    name: "Renamed".into(),
                    ..Scope::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.id, "tickets");
        assert_eq!(h.service.get_scope("tickets").await.unwrap().name, "Renamed");

        let err = h
            .service
            .create_scope(Scope::default())
            .await
            .expect_err("empty scope");
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn replies_past_the_depth_limit_are_rejected() {
        let h = harness().await;
        let root = Comment::new_root("tickets", None, "root", "u-alice", Utc::now());
        h.store.create_comment(&root).await.expect("root");

        let mut chain = vec![root];
        for _ in 0..MAX_THREAD_DEPTH {
            let child = Comment::new_reply(&chain[chain.len() - 1], "deeper", "u-bob", Utc::now());
            h.store.create_comment(&child).await.expect("reply");
            chain.push(child);
        }

        let err = h
            .service
            .create_comment(
                "u-alice",
                "too deep".into(),
                CreationMode::Reply {
                    parent_id: chain[MAX_THREAD_DEPTH].id,
                },
            )
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        let sibling = h
            .service
            .create_comment(
                "u-alice",
                "still fits".into(),
                CreationMode::Reply {
                    parent_id: chain[MAX_THREAD_DEPTH - 1].id,
                },
            )
            .await
            .expect("deepest allowed level");
        sibling.dispatch.await.expect("join");

        let view = h
            .service
            .get_comment(
                &chain[0].id.to_string(),
                TreeOptions {
                    recurse: true,
                    render_html: false,
                },
            )
            .await
            .expect("whole thread");
        assert_eq!(view.answers.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_render_budget_reports_every_comment() {
        let h = harness().await;
        let first = h
            .service
            .create_comment("u-alice", "root".into(), root(None))
            .await
            .expect("root");
        let mut ids = HashSet::from([first.comment.id]);
        for content in ["one", "two"] {
            let reply = h
                .service
                .create_comment(
                    "u-bob",
                    content.into(),
                    CreationMode::Reply {
                        parent_id: first.comment.id,
                    },
                )
                .await
                .expect("reply");
            ids.insert(reply.comment.id);
        }

        let err = h
            .service
            .clone()
            .with_render_budget(Duration::ZERO)
            .get_comment(
                &first.comment.id.to_string(),
                TreeOptions {
                    recurse: true,
                    render_html: true,
                },
            )
            .await
            .expect_err("budget is exhausted");

        let failures = match err {
            ServiceError::Render(RenderFailures(failures)) => failures,
            other => panic!("unexpected error: {other}"),
        };
        let failed: HashSet<CommentId> = failures.iter().map(|(id, _)| *id).collect();
        assert_eq!(failed, ids);
        assert!(failures
            .iter()
            .all(|(_, err)| *err == MarkdownError::Cancelled));
    }

    #[test]
    fn render_failures_list_every_comment() {
        let id = CommentId::new();
        let failures = RenderFailures(vec![(id, MarkdownError::Cancelled)]);
        assert_eq!(
            failures.to_string(),
            format!("failed to render 1 comment(s); {id}: rendering was cancelled")
        );
    }
}
