use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::JobsError;
use crate::ingest::{IngestService, Submission};
use crate::jobs::model::{JobStatus, ListFilter};
use crate::jobs::store::JobStore;

pub mod models;

use models::{
    CancelResponse, ErrorBody, HealthResponse, JobView, ListJobsQuery, ListJobsResponse,
    ReplayResponse,
};

pub const API_SECRET_HEADER: &str = "x-api-secret";
pub const WEBHOOK_JOB_TYPE: &str = "webhook-event";

#[derive(Clone)]
pub struct ApiState {
    pub ingest: IngestService,
    pub store: Arc<dyn JobStore>,
    /// When set, every route but `/health` requires `X-API-Secret`.
    pub api_secret: Option<String>,
}

impl ApiState {
    pub fn new(ingest: IngestService, api_secret: Option<String>) -> Self {
        Self {
            store: ingest.store().clone(),
            ingest,
            api_secret: api_secret.filter(|s| !s.is_empty()),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/replay", post(replay_job))
        .route("/webhooks/:source", post(webhook))
        .route("/metrics/prom", get(metrics_prom))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_secret));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

pub struct ApiError(JobsError);

impl From<JobsError> for ApiError {
    fn from(e: JobsError) -> Self {
        Self(e)
    }
}

fn error_response(status: StatusCode, error: &str, message: Option<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            JobsError::Validation(msg) => {
                error_response(StatusCode::BAD_REQUEST, "validation_failed", Some(msg))
            }
            JobsError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "not_found", None),
            e @ JobsError::InvalidTransition { .. } => {
                error_response(StatusCode::CONFLICT, "invalid_transition", Some(e.to_string()))
            }
            e @ (JobsError::DuplicateIdempotencyKey { .. } | JobsError::ClaimConflict { .. }) => {
                error_response(StatusCode::CONFLICT, "conflict", Some(e.to_string()))
            }
            e => {
                error!(error = %e, "request failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
            }
        }
    }
}

async fn require_secret(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let Some(secret) = state.api_secret.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(API_SECRET_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if bool::from(presented.ct_eq(secret.as_bytes())) {
        next.run(req).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized", None)
    }
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Json(body): Json<Submission>,
) -> Result<Response, ApiError> {
    let accepted = state.ingest.submit(body).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.store.get(id).await?;
    Ok(Json(job.into()))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| JobsError::validation(e.to_string()))?;

    let filter = ListFilter {
        queue: q.queue,
        status,
        limit: q.limit.unwrap_or(100),
        cursor_created_at: q.cursor_created_at,
        cursor_id: q.cursor_id,
    };
    let items: Vec<JobView> = state
        .store
        .list(&filter)
        .await?
        .into_iter()
        .map(JobView::from)
        .collect();

    let (next_cursor_created_at, next_cursor_id) = items
        .last()
        .map(|x| (Some(x.created_at), Some(x.job_id)))
        .unwrap_or((None, None));

    Ok(Json(ListJobsResponse {
        items,
        next_cursor_created_at,
        next_cursor_id,
    }))
}

pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job = state.store.cancel(id, Utc::now()).await?;
    Ok(Json(CancelResponse {
        job_id: job.id,
        status: job.status,
    }))
}

pub async fn replay_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let new_id = state.store.replay(id, Utc::now()).await?;
    let copy = state.store.get(new_id).await?;
    if let Err(e) = state.ingest.notifier().publish(&copy.queue, new_id).await {
        debug!(job_id = %new_id, error = %e, "publish after replay failed");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(ReplayResponse {
            job_id: new_id,
            replay_of_job_id: id,
        }),
    )
        .into_response())
}

/// Dedupe key from the event's own `id`, when it carries one.
fn webhook_key(source: &str, event: &Value) -> Option<String> {
    let id = match event.get("id")? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(format!("webhook:{source}:{id}"))
}

pub async fn webhook(
    State(state): State<ApiState>,
    Path(source): Path<String>,
    Json(event): Json<Value>,
) -> Result<Response, ApiError> {
    if !event.is_object() {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "payload_must_be_object",
            None,
        ));
    }
    let valid_source = !source.is_empty()
        && source.len() <= 64
        && source
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if !valid_source {
        return Err(JobsError::validation("webhook source must be [A-Za-z0-9_-]{1,64}").into());
    }

    let mut sub = Submission::new(WEBHOOK_JOB_TYPE, json!({ "source": source, "event": event }));
    sub.idempotency_key = webhook_key(&source, &event);

    let accepted = state.ingest.submit(sub).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

pub async fn health(State(state): State<ApiState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".into(),
                postgres_connected: true,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".into(),
                    postgres_connected: false,
                }),
            )
                .into_response()
        }
    }
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let counts = state.store.status_counts().await?;

    let mut body = String::from(concat!(
        "# HELP jobflow_jobs Jobs by queue and status\n",
        "# TYPE jobflow_jobs gauge\n",
    ));
    for c in counts {
        body.push_str(&format!(
            "jobflow_jobs{{queue=\"{}\",status=\"{}\"}} {}\n",
            c.queue, c.status, c.count
        ));
    }

    Ok((StatusCode::OK, body).into_response())
}
