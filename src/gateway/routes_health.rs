//! Health endpoint: store and queue reachability with per-check latency.
//!
//! Returns 200 when every backend answers, 503 otherwise. Orchestrators
//! point liveness/readiness probes here.

use super::AppState;
use crate::queue::PendingQueue;
use crate::store::JobStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub(super) async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let started = Instant::now();
    let store_check = match state.store.list(1, 0, None).await {
        Ok(_) => json!({ "ok": true, "latency_ms": started.elapsed().as_millis() as u64 }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };

    let queue_started = Instant::now();
    let queue_check = match state.queue.size().await {
        Ok(depth) => json!({
            "ok": true,
            "latency_ms": queue_started.elapsed().as_millis() as u64,
            "depth": depth,
        }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };

    let healthy = store_check["ok"].as_bool().unwrap_or(false)
        && queue_check["ok"].as_bool().unwrap_or(false);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "checks": { "store": store_check, "queue": queue_check },
        })),
    )
        .into_response()
}
