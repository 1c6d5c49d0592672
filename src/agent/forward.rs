//! Per-job executor — FORWARD_HTTP jobs.
//!
//! A local HTTP service on the agent host consumes the work. Two input
//! modes: URL (pass the signed input URL through headers / a substituted
//! JSON body, no download) and LOCAL_FILE (fetch through the input cache
//! and attach as a multipart `file` part). The response body becomes the
//! job's stdout (sanitized, truncated) and, when an upload access is
//! present, the output object.

use super::{upload_bytes, AgentContext, JobOutcome};
use crate::protocol::{AccessAuth, AccessRef, JobAssigned};
use crate::sanitize;
use crate::store::{ForwardHttpSpec, InputForwardMode};
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Cap on a forward response body (exceeding it fails the job).
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

pub(crate) async fn execute_forward(ctx: &AgentContext, assigned: &JobAssigned) -> JobOutcome {
    let Some(spec) = &assigned.forward_http else {
        return JobOutcome::failed("Forward target is required");
    };
    if spec.url.is_empty() {
        return JobOutcome::failed("Forward target is required");
    }
    let method = if spec.method.is_empty() {
        Method::POST
    } else {
        match Method::from_bytes(spec.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return JobOutcome::failed(format!("Invalid HTTP method {:?}", spec.method)),
        }
    };

    let mut request = ctx.forward_client.request(method, &spec.url);
    for (name, value) in &spec.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request = request
        .header("X-Job-Id", &assigned.job_id)
        .header("X-Attempt-Id", assigned.attempt_id.to_string());

    let input = match usable_input(assigned) {
        Ok(input) => input,
        Err(outcome) => return outcome,
    };

    request = match assigned.input_forward_mode {
        InputForwardMode::Url => attach_input_by_url(request, spec, &assigned.input_key, input),
        InputForwardMode::LocalFile => {
            match attach_input_as_file(ctx, request, spec, &assigned.input_key, input).await {
                Ok(r) => r,
                Err(outcome) => return outcome,
            }
        }
    };

    if spec.timeout_sec > 0 {
        request = request.timeout(Duration::from_secs(spec.timeout_sec));
    }

    debug!(job_id = %assigned.job_id, url = %spec.url, "forwarding job");
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return JobOutcome::failed(format!("Forward request failed: {e}")),
    };
    let status = response.status();
    let body = match read_capped(response).await {
        Ok(body) => body,
        Err(ReadBodyError::TooLarge) => return JobOutcome::failed("Response body too large"),
        Err(ReadBodyError::Transport(e)) => {
            return JobOutcome::failed(format!("Failed to read response body: {e}"));
        }
    };

    if !status.is_success() {
        return JobOutcome::failed(format!(
            "Forward target returned {}: {}",
            status,
            sanitize::capture(&body)
        ));
    }

    // Upload the response body when there is one and an upload access.
    let mut output_key = String::new();
    if !body.is_empty() && !assigned.output_access.url.is_empty() {
        if assigned.output_access.auth == AccessAuth::Sts {
            return JobOutcome::failed("STS output auth is not supported");
        }
        if let Err(e) = upload_bytes(&ctx.client, &assigned.output_access.url, body.clone()).await {
            return JobOutcome::failed(format!("Upload failed: {e:#}"));
        }
        output_key = assigned.output_key.clone();
    }

    JobOutcome::succeeded(output_key, sanitize::capture(&body), String::new())
}

/// The signed input access, when the job has a usable input reference.
fn usable_input(assigned: &JobAssigned) -> Result<Option<&AccessRef>, JobOutcome> {
    match &assigned.input_access {
        Some(access) if !assigned.input_key.is_empty() => {
            if access.auth == AccessAuth::Sts {
                Err(JobOutcome::failed("STS input auth is not supported"))
            } else {
                Ok(Some(access))
            }
        }
        _ => Ok(None),
    }
}

/// URL mode: the target fetches the input itself. The signed URL and key
/// travel in headers; an empty configured body is substituted with a JSON
/// pointer document.
fn attach_input_by_url(
    mut request: reqwest::RequestBuilder,
    spec: &ForwardHttpSpec,
    input_key: &str,
    input: Option<&AccessRef>,
) -> reqwest::RequestBuilder {
    match input {
        Some(access) => {
            request = request
                .header("X-Input-URL", &access.url)
                .header("X-Input-Key", input_key);
            if spec.body.is_empty() {
                let body = json!({
                    "input_url": access.url,
                    "input_key": input_key,
                })
                .to_string();
                request.header(CONTENT_TYPE, "application/json").body(body)
            } else {
                request.body(spec.body.clone())
            }
        }
        None if spec.body.is_empty() => request,
        None => request.body(spec.body.clone()),
    }
}

/// LOCAL_FILE mode: fetch through the input cache and build a multipart
/// body with a `file` part plus `payload`/`input_key`/`input_url` fields.
async fn attach_input_as_file(
    ctx: &AgentContext,
    request: reqwest::RequestBuilder,
    spec: &ForwardHttpSpec,
    input_key: &str,
    input: Option<&AccessRef>,
) -> Result<reqwest::RequestBuilder, JobOutcome> {
    let Some(access) = input else {
        // No input to attach; behave like a plain forward.
        return if spec.body.is_empty() {
            Ok(request)
        } else {
            Ok(request.body(spec.body.clone()))
        };
    };

    let (path, release) = match ctx.cache.get(&access.url, input_key).await {
        Ok(entry) => entry,
        Err(e) => return Err(JobOutcome::failed(format!("Download failed: {e:#}"))),
    };
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            release.release().await;
            return Err(JobOutcome::failed(format!("Failed to read cached input: {e}")));
        }
    };
    // The bytes are in memory; a one-shot temp file can go right away.
    release.release().await;

    let file_name = Path::new(input_key)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let mut form = reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));
    if !spec.body.is_empty() {
        form = form.text("payload", spec.body.clone());
    }
    form = form
        .text("input_key", input_key.to_string())
        .text("input_url", access.url.clone());
    Ok(request.multipart(form))
}

enum ReadBodyError {
    TooLarge,
    Transport(reqwest::Error),
}

/// Accumulate the response body, failing past [`MAX_RESPONSE_BYTES`].
async fn read_capped(response: reqwest::Response) -> Result<Vec<u8>, ReadBodyError> {
    let mut body: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ReadBodyError::Transport)?;
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(ReadBodyError::TooLarge);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
