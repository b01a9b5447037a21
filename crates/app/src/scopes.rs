use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use comment_service_core::Scope;

use crate::problem::ProblemResponse;
use crate::router::{observe, AppState};
use crate::service::ServiceError;

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    cascade: Option<bool>,
}

pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<Scope>, JsonRejection>,
) -> Result<(StatusCode, Json<Scope>), ProblemResponse> {
    let result: Result<Scope, ServiceError> = async {
        let Json(scope) = payload?;
        state.service().create_scope(scope).await
    }
    .await;
    observe("create_scope", &result);
    Ok((StatusCode::CREATED, Json(result?)))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Scope>>, ProblemResponse> {
    let result = state.service().list_scopes().await;
    observe("list_scopes", &result);
    Ok(Json(result?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Scope>, ProblemResponse> {
    let result = state.service().get_scope(&id).await;
    observe("get_scope", &result);
    Ok(Json(result?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<Scope>, JsonRejection>,
) -> Result<Json<Scope>, ProblemResponse> {
    let result: Result<Scope, ServiceError> = async {
        let Json(scope) = payload?;
        state.service().update_scope(&id, scope).await
    }
    .await;
    observe("update_scope", &result);
    Ok(Json(result?))
}

/// Deletes a scope. Comments of the scope are removed too unless `cascade=false`.
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Result<StatusCode, ProblemResponse> {
    let result: Result<(), ServiceError> = async {
        let Query(query) = query?;
        let cascade = query.cascade.unwrap_or(true);
        state.service().delete_scope(&id, cascade).await
    }
    .await;
    observe("delete_scope", &result);
    result?;
    Ok(StatusCode::NO_CONTENT)
}
