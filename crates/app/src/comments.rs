use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use comment_service_core::{CommentId, CommentTreeView, CommentView, CreationMode};

use crate::problem::ProblemResponse;
use crate::router::{observe, AppState};
use crate::service::{Created, ServiceError, TreeOptions};

/// Header carrying the identity id of the authenticated caller.
pub const REMOTE_USER_HEADER: &str = "x-remote-user-id";

#[derive(Debug, Deserialize)]
pub struct CreateCommentBody {
    content: String,
    #[serde(default)]
    root: Option<RootBody>,
    #[serde(default)]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootBody {
    scope: String,
    #[serde(default)]
    reference: Option<String>,
}

impl CreateCommentBody {
    fn into_parts(self) -> Result<(String, CreationMode), ServiceError> {
        let mode = match (self.root, self.parent_id) {
            (Some(root), None) => CreationMode::Root {
                scope: root.scope,
                reference: root.reference,
            },
            (None, Some(raw)) => CreationMode::Reply {
                parent_id: raw
                    .parse::<CommentId>()
                    .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?,
            },
            _ => {
                return Err(ServiceError::InvalidArgument(
                    "exactly one of root or parent_id must be set".into(),
                ))
            }
        };
        Ok((self.content, mode))
    }
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    #[serde(default)]
    recurse: bool,
    #[serde(default)]
    render_html: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    scope: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    recurse: bool,
    #[serde(default)]
    render_html: bool,
}

fn remote_user(headers: &HeaderMap) -> Result<&str, ServiceError> {
    headers
        .get(REMOTE_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ServiceError::Unauthenticated)
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateCommentBody>, JsonRejection>,
) -> Result<(StatusCode, Json<CommentView>), ProblemResponse> {
    let result: Result<Created, ServiceError> = async {
        let author = remote_user(&headers)?;
        let Json(body) = payload?;
        let (content, mode) = body.into_parts()?;
        state.service().create_comment(author, content, mode).await
    }
    .await;
    observe("create_comment", &result);

    // The dispatch keeps running after its handle is dropped.
    let created = result?;
    Ok((StatusCode::CREATED, Json(CommentView::from(&created.comment))))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<TreeQuery>, QueryRejection>,
) -> Result<Json<CommentTreeView>, ProblemResponse> {
    let result: Result<CommentTreeView, ServiceError> = async {
        let Query(query) = query?;
        let options = TreeOptions {
            recurse: query.recurse,
            render_html: query.render_html,
        };
        state.service().get_comment(&id, options).await
    }
    .await;
    observe("get_comment", &result);
    Ok(Json(result?))
}

pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<CommentTreeView>>, ProblemResponse> {
    let result: Result<Vec<CommentTreeView>, ServiceError> = async {
        let Query(query) = query?;
        let options = TreeOptions {
            recurse: query.recurse,
            render_html: query.render_html,
        };
        state
            .service()
            .list_comments(&query.scope, query.reference.as_deref(), options)
            .await
    }
    .await;
    observe("list_comments", &result);
    Ok(Json(result?))
}
