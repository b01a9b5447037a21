use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::service::{CommentService, ServiceError};
use crate::{comments, scopes, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    service: CommentService,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, service: CommentService) -> Self {
        Self { metrics, service }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn service(&self) -> &CommentService {
        &self.service
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/scopes", get(scopes::list).post(scopes::create))
        .route(
            "/v1/scopes/:id",
            get(scopes::get).put(scopes::update).delete(scopes::delete),
        )
        .route("/v1/comments", get(comments::list).post(comments::create))
        .route("/v1/comments/:id", get(comments::get))
        .with_state(state)
}

/// Records the outcome of an API operation.
pub(crate) fn observe<T>(op: &'static str, result: &Result<T, ServiceError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(ServiceError::Unauthenticated) => "unauthenticated",
        Err(ServiceError::InvalidArgument(_)) => "invalid",
        Err(ServiceError::Store(_)) => "store_error",
        Err(ServiceError::Tree(_) | ServiceError::Render(_)) => "internal_error",
    };
    counter!("comment_requests_total", "op" => op, "result" => outcome).increment(1);
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
