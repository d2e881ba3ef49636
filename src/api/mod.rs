//! JSON HTTP API over [`JobService`].
//!
//! Every response uses the `{ code, message, data }` envelope. Errors carry
//! the stable code from [`JobError::code`]. Requests the extractors reject
//! (malformed ids, bad JSON bodies, unknown query values) get
//! [`BAD_REQUEST_CODE`], and unknown routes get [`NOT_FOUND_CODE`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{JobRecord, JobService, JobUpdate, NewJob, TransitionError};
use crate::store::{PageMetadata, SearchQuery};

pub const SUCCESS_CODE: &str = "0000";
pub const BAD_REQUEST_CODE: &str = "9400";
pub const NOT_FOUND_CODE: &str = "9404";
pub const TOTAL_PAGES_HEADER: &str = "x-total-pages";
pub const TOTAL_ELEMENTS_HEADER: &str = "x-total-elements";

const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<JobService>,
}

#[derive(Serialize)]
struct Envelope<T> {
    code: &'static str,
    message: String,
    data: Option<T>,
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(Envelope {
            code: SUCCESS_CODE,
            message: "OK".to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

/// Error side of every handler.
pub enum ApiError {
    Job(JobError),
    /// The request could not be decoded into the handler's arguments.
    BadRequest(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        ApiError::Job(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn status_for(error: &JobError) -> StatusCode {
    match error {
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::AlreadyExists(_) | JobError::LockTimeout { .. } => StatusCode::CONFLICT,
        JobError::InvalidTransition(
            TransitionError::AlreadyCompleted | TransitionError::AlreadyCanceled,
        ) => StatusCode::CONFLICT,
        JobError::InvalidTransition(_) | JobError::EmptyField(_) => StatusCode::BAD_REQUEST,
        JobError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, code: &'static str, message: String) -> Response {
    (
        status,
        Json(Envelope::<()> {
            code,
            message,
            data: None,
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Job(e) => {
                let status = status_for(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %e, "Request failed");
                }
                error_response(status, e.code(), e.to_string())
            }
            ApiError::BadRequest(message) => {
                tracing::debug!(%message, "Rejected malformed request");
                error_response(StatusCode::BAD_REQUEST, BAD_REQUEST_CODE, message)
            }
        }
    }
}

// Extractors that reject with the error envelope instead of axum's plain text.

#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct JsonBody<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(ApiError))]
struct JobPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
struct QueryParams<T>(T);

type ApiResult = Result<Response, ApiError>;

#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<usize>,
    size: Option<usize>,
}

#[derive(Serialize)]
struct PageBody {
    jobs: Vec<JobRecord>,
    metadata: PageMetadata,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/search", get(search_jobs))
        .route("/api/jobs/complete-pending", post(complete_pending))
        .route(
            "/api/jobs/{id}",
            get(get_job).patch(update_job).delete(delete_job),
        )
        .route("/api/jobs/{id}/complete", post(complete_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/reopen", post(reopen_job))
        .fallback(route_not_found)
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting job API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn create_job(
    State(state): State<ApiState>,
    JsonBody(payload): JsonBody<NewJob>,
) -> ApiResult {
    let job = state.service.create(payload).await?;
    Ok(ok(StatusCode::CREATED, job))
}

async fn list_jobs(
    State(state): State<ApiState>,
    QueryParams(params): QueryParams<ListParams>,
) -> ApiResult {
    if params.page.is_none() && params.size.is_none() {
        let jobs = state.service.list().await?;
        return Ok(ok(StatusCode::OK, jobs));
    }

    let page = state
        .service
        .list_paginated(params.page.unwrap_or(0), params.size.unwrap_or(DEFAULT_PAGE_SIZE))
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(TOTAL_PAGES_HEADER, HeaderValue::from(page.metadata.total_pages));
    headers.insert(TOTAL_ELEMENTS_HEADER, HeaderValue::from(page.metadata.total_elements));

    let body = PageBody {
        jobs: page.data,
        metadata: page.metadata,
    };
    Ok((headers, ok(StatusCode::OK, body)).into_response())
}

async fn search_jobs(
    State(state): State<ApiState>,
    QueryParams(query): QueryParams<SearchQuery>,
) -> ApiResult {
    let jobs = state.service.search(query).await?;
    Ok(ok(StatusCode::OK, jobs))
}

async fn get_job(State(state): State<ApiState>, JobPath(id): JobPath<Uuid>) -> ApiResult {
    let job = state.service.get(id).await?;
    Ok(ok(StatusCode::OK, job))
}

async fn update_job(
    State(state): State<ApiState>,
    JobPath(id): JobPath<Uuid>,
    JsonBody(changes): JsonBody<JobUpdate>,
) -> ApiResult {
    let job = state.service.update(id, changes).await?;
    Ok(ok(StatusCode::OK, job))
}

async fn complete_job(State(state): State<ApiState>, JobPath(id): JobPath<Uuid>) -> ApiResult {
    let job = state.service.complete(id).await?;
    Ok(ok(StatusCode::OK, job))
}

async fn cancel_job(State(state): State<ApiState>, JobPath(id): JobPath<Uuid>) -> ApiResult {
    let job = state.service.cancel(id).await?;
    Ok(ok(StatusCode::OK, job))
}

async fn reopen_job(State(state): State<ApiState>, JobPath(id): JobPath<Uuid>) -> ApiResult {
    let job = state.service.reopen(id).await?;
    Ok(ok(StatusCode::OK, job))
}

async fn delete_job(State(state): State<ApiState>, JobPath(id): JobPath<Uuid>) -> ApiResult {
    let deleted = state.service.delete(id).await?;
    Ok(ok(StatusCode::OK, deleted))
}

async fn complete_pending(State(state): State<ApiState>) -> ApiResult {
    let outcome = state.service.complete_pending().await?;
    Ok(ok(StatusCode::OK, outcome))
}

async fn route_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, NOT_FOUND_CODE, "Route not found".to_string())
}
