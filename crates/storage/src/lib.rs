use std::{collections::HashMap, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
    },
    Row, SqlitePool,
};
use thiserror::Error;
use tracing::debug;

use comment_service_core::{
    Comment, CommentId, CommentStore, NotificationType, Scope, StoreError, Thread,
    MAX_THREAD_DEPTH,
};

const COMMENT_COLUMNS: &str =
    "c.id, c.scope_id, c.reference, c.content, c.parent_id, c.created_at, c.creator_id";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// In-memory databases are limited to a single, never recycled connection so that all
    /// queries see the same data.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for interacting with scopes.
    pub fn scopes(&self) -> ScopeRepository {
        ScopeRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for interacting with comments.
    pub fn comments(&self) -> CommentRepository {
        CommentRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(db_err.code().as_deref(), Some("2067" | "1555")),
        _ => false,
    }
}

/// Repository for scope records.
#[derive(Clone)]
pub struct ScopeRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct ScopeRow {
    id: String,
    name: String,
    notification_type: String,
    view_comment_url_template: String,
    owners_json: String,
}

impl ScopeRow {
    fn into_domain(self) -> Result<Scope, ScopeError> {
        Ok(Scope {
            id: self.id,
            name: self.name,
            notification_type: NotificationType::from_db(&self.notification_type),
            view_comment_url_template: self.view_comment_url_template,
            owners: serde_json::from_str(&self.owners_json)?,
        })
    }
}

impl ScopeRepository {
    /// Inserts a new scope. Both id and name must be unique.
    pub async fn insert(&self, scope: &Scope) -> Result<(), ScopeError> {
        let owners_json = serde_json::to_string(&scope.owners)?;
        sqlx::query(
            "INSERT INTO scopes (id, name, notification_type, view_comment_url_template, owners_json) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&scope.id)
        .bind(&scope.name)
        .bind(scope.notification_type.as_str())
        .bind(&scope.view_comment_url_template)
        .bind(owners_json)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ScopeError::Duplicate
            } else {
                ScopeError::Database(err)
            }
        })?;

        Ok(())
    }

    /// Loads a scope by id.
    pub async fn fetch(&self, id: &str) -> Result<Scope, ScopeError> {
        sqlx::query_as::<_, ScopeRow>(
            "SELECT id, name, notification_type, view_comment_url_template, owners_json \
             FROM scopes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ScopeError::NotFound)?
        .into_domain()
    }

    /// Replaces the mutable attributes of the scope identified by `id`.
    pub async fn replace(&self, id: &str, scope: &Scope) -> Result<(), ScopeError> {
        let owners_json = serde_json::to_string(&scope.owners)?;
        let result = sqlx::query(
            "UPDATE scopes \
             SET name = ?, notification_type = ?, view_comment_url_template = ?, owners_json = ? \
             WHERE id = ?",
        )
        .bind(&scope.name)
        .bind(scope.notification_type.as_str())
        .bind(&scope.view_comment_url_template)
        .bind(owners_json)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ScopeError::Duplicate
            } else {
                ScopeError::Database(err)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(ScopeError::NotFound);
        }
        Ok(())
    }

    /// Deletes a scope. With `cascade` all comments of the scope are removed as well.
    pub async fn delete(&self, id: &str, cascade: bool) -> Result<u64, ScopeError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM scopes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ScopeError::NotFound);
        }

        let mut removed_comments = 0;
        if cascade {
            removed_comments = sqlx::query("DELETE FROM comments WHERE scope_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        debug!(stage = "storage", scope = %id, cascade, removed_comments, "scope deleted");
        Ok(removed_comments)
    }

    /// Lists all scopes in creation order.
    pub async fn list(&self) -> Result<Vec<Scope>, ScopeError> {
        sqlx::query_as::<_, ScopeRow>(
            "SELECT id, name, notification_type, view_comment_url_template, owners_json \
             FROM scopes ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScopeRow::into_domain)
        .collect()
    }
}

/// Errors that can occur while working with scopes.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("scope not found")]
    NotFound,
    #[error("scope id or name already exists")]
    Duplicate,
    #[error("failed to encode scope owners: {0}")]
    Owners(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for comment records.
#[derive(Clone)]
pub struct CommentRepository {
    pool: SqlitePool,
}

impl CommentRepository {
    /// Inserts a comment, provided its scope exists.
    pub async fn insert(&self, comment: &Comment) -> Result<(), CommentError> {
        let result = sqlx::query(
            "INSERT INTO comments (id, scope_id, reference, content, parent_id, created_at, creator_id) \
             SELECT ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM scopes WHERE id = ?)",
        )
        .bind(comment.id.to_string())
        .bind(&comment.scope)
        .bind(&comment.reference)
        .bind(&comment.content)
        .bind(comment.parent_id.map(|id| id.to_string()))
        .bind(to_rfc3339(comment.created_at))
        .bind(&comment.creator_id)
        .bind(&comment.scope)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                CommentError::Duplicate
            } else {
                CommentError::Database(err)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(CommentError::ScopeNotFound);
        }
        Ok(())
    }

    /// Loads a single comment.
    pub async fn fetch(&self, id: &CommentId) -> Result<Comment, CommentError> {
        let row = sqlx::query(&format!("SELECT {COMMENT_COLUMNS} FROM comments AS c WHERE c.id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(CommentError::NotFound)?;

        decode_comment(&row)
    }

    /// Returns the ancestors of `id`, closest parent first.
    ///
    /// The walk stops after [`MAX_THREAD_DEPTH`] levels, which also ends parent cycles in
    /// corrupted data.
    pub async fn ancestors(&self, id: &CommentId) -> Result<Vec<Comment>, CommentError> {
        self.fetch(id).await?;

        let rows = sqlx::query(&format!(
            "WITH RECURSIVE chain(id, parent_id, depth) AS ( \
                 SELECT id, parent_id, 0 FROM comments WHERE id = ? \
                 UNION \
                 SELECT p.id, p.parent_id, chain.depth + 1 \
                   FROM comments AS p JOIN chain ON p.id = chain.parent_id \
                  WHERE chain.depth < ? \
             ) \
             SELECT {COMMENT_COLUMNS} FROM chain JOIN comments AS c ON c.id = chain.id \
              WHERE chain.depth > 0 \
              ORDER BY chain.depth"
        ))
        .bind(id.to_string())
        .bind(MAX_THREAD_DEPTH as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_comment).collect()
    }

    /// Returns all transitive answers of `id` ordered by creation time.
    pub async fn descendants(&self, id: &CommentId) -> Result<Vec<Comment>, CommentError> {
        let rows = sqlx::query(&format!(
            "WITH RECURSIVE tree(id) AS ( \
                 SELECT id FROM comments WHERE parent_id = ? \
                 UNION \
                 SELECT a.id FROM comments AS a JOIN tree ON a.parent_id = tree.id \
             ) \
             SELECT {COMMENT_COLUMNS} FROM tree JOIN comments AS c ON c.id = tree.id \
              ORDER BY c.created_at, c.rowid"
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_comment).collect()
    }

    /// Returns every root comment of `scope` (optionally matching `reference`) together
    /// with its descendants. Roots are returned in creation order.
    pub async fn threads(
        &self,
        scope: &str,
        reference: Option<&str>,
    ) -> Result<Vec<Thread>, CommentError> {
        let rows = sqlx::query(&format!(
            "WITH RECURSIVE tree(root_id, id) AS ( \
                 SELECT id, id FROM comments \
                  WHERE scope_id = ? AND parent_id IS NULL AND (? IS NULL OR reference = ?) \
                 UNION \
                 SELECT tree.root_id, a.id FROM comments AS a JOIN tree ON a.parent_id = tree.id \
             ) \
             SELECT tree.root_id, {COMMENT_COLUMNS} FROM tree JOIN comments AS c ON c.id = tree.id \
              ORDER BY c.created_at, c.rowid"
        ))
        .bind(scope)
        .bind(reference)
        .bind(reference)
        .fetch_all(&self.pool)
        .await?;

        let mut threads: Vec<Thread> = Vec::new();
        let mut positions: HashMap<CommentId, usize> = HashMap::new();
        let mut answers: Vec<(CommentId, Comment)> = Vec::new();

        for row in &rows {
            let root_id = parse_id(row.try_get("root_id")?)?;
            let comment = decode_comment(row)?;
            if comment.id == root_id {
                positions.insert(root_id, threads.len());
                threads.push(Thread {
                    root: comment,
                    descendants: Vec::new(),
                });
            } else {
                answers.push((root_id, comment));
            }
        }

        for (root_id, comment) in answers {
            let position = positions
                .get(&root_id)
                .copied()
                .ok_or_else(|| CommentError::Corrupt(format!("unknown thread root {root_id}")))?;
            threads[position].descendants.push(comment);
        }

        Ok(threads)
    }
}

/// Errors that can occur while working with comments.
#[derive(Debug, Error)]
pub enum CommentError {
    #[error("comment not found")]
    NotFound,
    #[error("scope not found")]
    ScopeNotFound,
    #[error("comment id already exists")]
    Duplicate,
    #[error("stored comment is corrupt: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn decode_comment(row: &SqliteRow) -> Result<Comment, CommentError> {
    let parent: Option<String> = row.try_get("parent_id")?;
    Ok(Comment {
        id: parse_id(row.try_get("id")?)?,
        scope: row.try_get("scope_id")?,
        reference: row.try_get("reference")?,
        content: row.try_get("content")?,
        parent_id: parent.map(parse_id).transpose()?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        creator_id: row.try_get("creator_id")?,
    })
}

fn parse_id(value: String) -> Result<CommentId, CommentError> {
    value
        .parse()
        .map_err(|_| CommentError::Corrupt(format!("invalid comment id {value:?}")))
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl From<ScopeError> for StoreError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::NotFound => Self::NotFound("scope"),
            ScopeError::Duplicate => Self::AlreadyExists("scope"),
            ScopeError::Owners(err) => Self::InvalidArgument(err.to_string()),
            ScopeError::Database(err) => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<CommentError> for StoreError {
    fn from(err: CommentError) -> Self {
        match err {
            CommentError::NotFound => Self::NotFound("comment"),
            CommentError::ScopeNotFound => Self::NotFound("scope"),
            CommentError::Duplicate => Self::AlreadyExists("comment"),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl CommentStore for Database {
    async fn create_comment(&self, comment: &Comment) -> Result<CommentId, StoreError> {
        self.comments().insert(comment).await?;
        Ok(comment.id)
    }

    async fn get_comment(&self, id: &CommentId) -> Result<Comment, StoreError> {
        Ok(self.comments().fetch(id).await?)
    }

    async fn ancestor_chain(&self, id: &CommentId) -> Result<Vec<Comment>, StoreError> {
        Ok(self.comments().ancestors(id).await?)
    }

    async fn descendants(&self, id: &CommentId) -> Result<Vec<Comment>, StoreError> {
        Ok(self.comments().descendants(id).await?)
    }

    async fn threads_by_scope(
        &self,
        scope: &str,
        reference: Option<&str>,
    ) -> Result<Vec<Thread>, StoreError> {
        Ok(self.comments().threads(scope, reference).await?)
    }

    async fn create_scope(&self, scope: &Scope) -> Result<(), StoreError> {
        Ok(self.scopes().insert(scope).await?)
    }

    async fn get_scope(&self, id: &str) -> Result<Scope, StoreError> {
        Ok(self.scopes().fetch(id).await?)
    }

    async fn update_scope(&self, id: &str, scope: &Scope) -> Result<(), StoreError> {
        Ok(self.scopes().replace(id, scope).await?)
    }

    async fn delete_scope(&self, id: &str, cascade: bool) -> Result<(), StoreError> {
        self.scopes().delete(id, cascade).await?;
        Ok(())
    }

    async fn list_scopes(&self) -> Result<Vec<Scope>, StoreError> {
        Ok(self.scopes().list().await?)
    }
}
