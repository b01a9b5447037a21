use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use comment_service_core::StoreError;

use crate::service::ServiceError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<ServiceError> for ProblemResponse {
    fn from(err: ServiceError) -> Self {
        let (status, problem_type) = match &err {
            ServiceError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            ServiceError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            ServiceError::Store(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            ServiceError::Store(StoreError::AlreadyExists(_)) => {
                (StatusCode::CONFLICT, "already_exists")
            }
            ServiceError::Store(StoreError::InvalidArgument(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_argument")
            }
            ServiceError::Store(StoreError::Unavailable(_)) => {
                (StatusCode::BAD_GATEWAY, "store_unavailable")
            }
            ServiceError::Tree(_) => (StatusCode::INTERNAL_SERVER_ERROR, "structural_corruption"),
            ServiceError::Render(_) => (StatusCode::INTERNAL_SERVER_ERROR, "render_failed"),
        };

        if status.is_server_error() {
            error!(stage = "app", error = %err, problem = problem_type, "request failed");
        }
        Self::new(status, problem_type, err.to_string())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::InvalidArgument(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        ServiceError::InvalidArgument(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comment_service_core::{CommentId, TreeError};

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::NotFound("scope"), StatusCode::NOT_FOUND),
            (StoreError::AlreadyExists("scope"), StatusCode::CONFLICT),
            (StoreError::InvalidArgument("bad".into()), StatusCode::BAD_REQUEST),
            (StoreError::Unavailable("down".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(ProblemResponse::from(ServiceError::Store(err)).status(), status);
        }
    }

    #[test]
    fn corrupt_threads_are_server_errors() {
        let problem = ProblemResponse::from(ServiceError::Tree(TreeError::Orphan {
            id: CommentId::new(),
            parent: CommentId::new(),
        }));
        assert_eq!(problem.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(problem.body.problem_type, "structural_corruption");
    }

    #[test]
    fn missing_author_is_unauthorized() {
        let problem = ProblemResponse::from(ServiceError::Unauthenticated);
        assert_eq!(problem.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(problem.body.detail, "no remote user specified");
    }
}
