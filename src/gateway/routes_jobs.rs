//! Job submission API.
//!
//! `POST /api/jobs` accepts a JSON body (≤ 1 MiB, enforced by the body
//! limit layer → 413). Non-JSON content types are 415, malformed or
//! invalid bodies are 400, success is 201 with `{job_id, status,
//! created_at}`.
//!
//! Callers may supply `output_key`/`output_prefix`, but any value that
//! does not match the canonical `jobs/{job_id}/{attempt_id}/` layout is
//! silently overwritten on creation; the attempt prefix is authoritative.

use super::{lock_or_recover, AppState};
use crate::queue::PendingQueue;
use crate::store::{
    ForwardHttpSpec, InputForwardMode, Job, JobStatus, JobStore, JobType, StoreError,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn map_rejection(rejection: JsonRejection) -> Response {
    match rejection {
        JsonRejection::MissingJsonContentType(_) => api_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        ),
        // The body-limit layer surfaces as a 413 while buffering; keep it.
        other if other.status() == StatusCode::PAYLOAD_TOO_LARGE => api_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "body exceeds the 1 MiB submission limit",
        ),
        other => api_error(StatusCode::BAD_REQUEST, other.body_text()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub input_bucket: Option<String>,
    #[serde(default)]
    pub input_key: Option<String>,
    pub output_bucket: String,
    #[serde(default)]
    pub output_key: String,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub output_extension: String,
    #[serde(default)]
    pub forward_http: Option<ForwardHttpSpec>,
    #[serde(default)]
    pub input_forward_mode: InputForwardMode,
}

pub(super) async fn create_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return map_rejection(rejection),
    };

    let mut job = Job::new(Uuid::new_v4().to_string(), req.job_type);
    job.command = req.command;
    job.input_bucket = req.input_bucket;
    job.input_key = req.input_key;
    job.output_bucket = req.output_bucket;
    job.output_key = req.output_key;
    job.output_prefix = req.output_prefix;
    job.output_extension = req.output_extension;
    job.forward_http = req.forward_http;
    job.input_forward_mode = req.input_forward_mode;

    let job = match state.store.create(job).await {
        Ok(job) => job,
        Err(StoreError::Conflict(msg)) => return api_error(StatusCode::BAD_REQUEST, msg),
        Err(e) => {
            error!(error = %e, "job creation failed");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "job creation failed");
        }
    };

    if let Err(e) = state.queue.enqueue(&job.job_id).await {
        error!(job_id = %job.job_id, error = %e, "enqueue failed for created job");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "job stored but could not be queued",
        );
    }

    info!(job_id = %job.job_id, job_type = ?job.job_type, "job submitted");
    (
        StatusCode::CREATED,
        Json(json!({
            "job_id": job.job_id,
            "status": job.status,
            "created_at": job.created_at,
        })),
    )
        .into_response()
}

pub(super) async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    match state.store.get(&job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(StoreError::NotFound(_)) => api_error(StatusCode::NOT_FOUND, "job not found"),
        Err(e) => {
            error!(job_id, error = %e, "job lookup failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "job lookup failed")
        }
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
}

pub(super) async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<JobStatus>() {
            Ok(s) => Some(s),
            Err(_) => return api_error(StatusCode::BAD_REQUEST, format!("unknown status {raw:?}")),
        },
    };
    match state.store.list(limit, offset, status).await {
        Ok(jobs) => Json(json!({
            "jobs": jobs,
            "limit": limit,
            "offset": offset,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "job listing failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "job listing failed")
        }
    }
}

/// Cancel a non-terminal job. A PENDING job also has its queue entry
/// removed; an ASSIGNED/RUNNING job is marked CANCELED in the store and a
/// late terminal report from its agent is dropped by terminal protection.
pub(super) async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let job = match state.store.get(&job_id).await {
        Ok(job) => job,
        Err(StoreError::NotFound(_)) => return api_error(StatusCode::NOT_FOUND, "job not found"),
        Err(e) => {
            error!(job_id, error = %e, "job lookup failed");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "job lookup failed");
        }
    };
    if job.status.is_terminal() {
        return api_error(
            StatusCode::CONFLICT,
            format!("job is already terminal ({})", job.status),
        );
    }
    let was_pending = job.status == JobStatus::Pending;
    match state.store.update_status(&job_id, JobStatus::Canceled).await {
        Ok(()) => {}
        Err(StoreError::InvalidTransition { from, .. }) => {
            // Raced with a concurrent transition; report the conflict.
            return api_error(StatusCode::CONFLICT, format!("cannot cancel from {from}"));
        }
        Err(e) => {
            error!(job_id, error = %e, "cancel failed");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "cancel failed");
        }
    }
    if was_pending {
        if let Err(e) = state.queue.remove(&job_id).await {
            warn!(job_id, error = %e, "queue removal failed for canceled job");
        }
    }
    if !job.assigned_agent_id.is_empty() && !was_pending {
        lock_or_recover(&state.registry).release_running(&job.assigned_agent_id);
        state.metrics.record_terminal(JobStatus::Canceled.as_str());
    }
    info!(job_id, "job canceled");
    Json(json!({ "job_id": job_id, "status": JobStatus::Canceled })).into_response()
}
