//! API integration tests for the skybridge gateway REST endpoints.
//!
//! Exercises every public HTTP route using `tower::ServiceExt::oneshot`
//! against the Axum router — no TCP listener, no port conflicts, no
//! external services: the gateway runs on its in-memory store and queue.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test api_integration
//! ```
//!
//! # Testing strategy
//!
//! Each test builds a fresh router via `common::build_test_app()`. The
//! helpers `get()` and `post_json()` return `(StatusCode, Value)` tuples
//! for concise assertions. Tests are grouped by API domain: submission
//! boundary behavior, job projection, cancellation, and operational
//! endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use skybridge::queue::PendingQueue;
use skybridge::store::JobStore;
use tower::ServiceExt;

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    post_raw(app, uri, "application/json", body.to_string()).await
}

async fn post_raw(
    app: Router,
    uri: &str,
    content_type: &str,
    body: String,
) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .uri(uri)
                .method("POST")
                .header("content-type", content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn minimal_job() -> Value {
    json!({
        "command": "echo hello",
        "output_bucket": "artifacts",
    })
}

// == Submission =================================================================

#[tokio::test]
async fn submit_returns_201_with_job_identity() {
    let (state, app) = common::build_test_app();
    let (status, body) = post_json(app, "/api/jobs", minimal_job()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "PENDING");
    assert!(body["job_id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(body["created_at"].as_str().is_some());
    // The job is queued for dispatch.
    assert_eq!(state.queue.size().await.unwrap(), 1);
}

#[tokio::test]
async fn submitted_job_is_retrievable_with_canonical_prefix() {
    let (_state, app) = common::build_test_app();
    let (_, created) = post_json(app.clone(), "/api/jobs", minimal_job()).await;
    let job_id = created["job_id"].as_str().unwrap();

    let (status, job) = get(app, &format!("/api/jobs/{}", job_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "PENDING");
    assert_eq!(job["output_prefix"], format!("jobs/{}/1/", job_id));
    assert_eq!(job["attempt_id"], 1);
}

#[tokio::test]
async fn non_json_content_type_is_415() {
    let (_state, app) = common::build_test_app();
    let (status, _) = post_raw(app, "/api/jobs", "text/plain", "hello".into()).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn malformed_json_is_400() {
    let (_state, app) = common::build_test_app();
    let (status, _) = post_raw(app, "/api/jobs", "application/json", "{not json".into()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn body_over_one_mebibyte_is_413() {
    let (_state, app) = common::build_test_app();
    let padding = "x".repeat(1024 * 1024);
    let body = json!({
        "command": padding,
        "output_bucket": "artifacts",
    })
    .to_string();
    assert!(body.len() > 1024 * 1024);
    let (status, _) = post_raw(app, "/api/jobs", "application/json", body).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn oversized_command_is_400() {
    let (_state, app) = common::build_test_app();
    let (status, body) = post_json(
        app,
        "/api/jobs",
        json!({
            "command": "x".repeat(8193),
            "output_bucket": "artifacts",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("command"));
}

#[tokio::test]
async fn lone_input_half_is_400() {
    let (_state, app) = common::build_test_app();
    let (status, body) = post_json(
        app,
        "/api/jobs",
        json!({
            "command": "echo hi",
            "output_bucket": "artifacts",
            "input_bucket": "artifacts",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("input_bucket"));
}

#[tokio::test]
async fn missing_output_bucket_is_400() {
    let (_state, app) = common::build_test_app();
    let (status, _) = post_json(app, "/api/jobs", json!({ "command": "echo" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_fields_are_rejected() {
    let (_state, app) = common::build_test_app();
    let (status, _) = post_json(
        app,
        "/api/jobs",
        json!({
            "command": "echo",
            "output_bucket": "b",
            "priority": "urgent",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn foreign_output_key_is_silently_normalized() {
    let (_state, app) = common::build_test_app();
    let (status, created) = post_json(
        app.clone(),
        "/api/jobs",
        json!({
            "command": "echo",
            "output_bucket": "b",
            "output_key": "somewhere/else.bin",
            "output_prefix": "somewhere/",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "non-canonical paths are accepted");
    let job_id = created["job_id"].as_str().unwrap();
    let (_, job) = get(app, &format!("/api/jobs/{}", job_id)).await;
    assert_eq!(job["output_prefix"], format!("jobs/{}/1/", job_id));
    assert_eq!(job["output_key"], "");
}

#[tokio::test]
async fn forward_http_job_is_accepted() {
    let (_state, app) = common::build_test_app();
    let (status, _) = post_json(
        app,
        "/api/jobs",
        json!({
            "job_type": "FORWARD_HTTP",
            "output_bucket": "b",
            "forward_http": {
                "url": "http://localhost:8080/work",
                "method": "POST",
                "timeout_sec": 30,
            },
            "input_forward_mode": "LOCAL_FILE",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

// == Projection =================================================================

#[tokio::test]
async fn get_unknown_job_is_404() {
    let (_state, app) = common::build_test_app();
    let (status, _) = get(app, "/api/jobs/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_returns_jobs_with_pagination_shape() {
    let (_state, app) = common::build_test_app();
    for _ in 0..3 {
        post_json(app.clone(), "/api/jobs", minimal_job()).await;
    }
    let (status, body) = get(app, "/api/jobs?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(body["limit"], 2);
    assert_eq!(body["offset"], 0);
}

#[tokio::test]
async fn list_filters_by_status() {
    let (_state, app) = common::build_test_app();
    post_json(app.clone(), "/api/jobs", minimal_job()).await;
    let (status, body) = get(app.clone(), "/api/jobs?status=PENDING").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
    let (status, body) = get(app, "/api/jobs?status=SUCCEEDED").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn list_with_unknown_status_is_400() {
    let (_state, app) = common::build_test_app();
    let (status, _) = get(app, "/api/jobs?status=EXPLODED").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// == Cancellation ===============================================================

#[tokio::test]
async fn cancel_pending_job_removes_queue_entry() {
    let (state, app) = common::build_test_app();
    let (_, created) = post_json(app.clone(), "/api/jobs", minimal_job()).await;
    let job_id = created["job_id"].as_str().unwrap();
    assert_eq!(state.queue.size().await.unwrap(), 1);

    let (status, body) =
        post_json(app.clone(), &format!("/api/jobs/{}/cancel", job_id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELED");
    assert_eq!(state.queue.size().await.unwrap(), 0);

    let (_, job) = get(app, &format!("/api/jobs/{}", job_id)).await;
    assert_eq!(job["status"], "CANCELED");
}

#[tokio::test]
async fn cancel_terminal_job_is_409() {
    let (state, app) = common::build_test_app();
    let (_, created) = post_json(app.clone(), "/api/jobs", minimal_job()).await;
    let job_id = created["job_id"].as_str().unwrap().to_string();
    state
        .store
        .update_status(&job_id, skybridge::store::JobStatus::Canceled)
        .await
        .unwrap();

    let (status, _) = post_json(app, &format!("/api/jobs/{}/cancel", job_id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_unknown_job_is_404() {
    let (_state, app) = common::build_test_app();
    let (status, _) = post_json(app, "/api/jobs/ghost/cancel", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// == Operational endpoints ======================================================

#[tokio::test]
async fn agents_online_is_empty_without_connections() {
    let (_state, app) = common::build_test_app();
    let (status, body) = get(app, "/api/agents/online").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert!(body["agents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn healthz_reports_ok_on_memory_backends() {
    let (_state, app) = common::build_test_app();
    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["store"]["ok"], true);
    assert_eq!(body["checks"]["queue"]["ok"], true);
}

#[tokio::test]
async fn metrics_exposition_renders() {
    let (_state, app) = common::build_test_app();
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("skybridge_agents_online"));
    assert!(text.contains("skybridge_queue_depth"));
}
