//! Per-job executor — COMMAND jobs.
//!
//! Runs concurrently with other jobs, bounded by `max_concurrency`. Flow:
//! acquire a slot, report RUNNING, download the input (if any) to a temp
//! file, substitute `{input}`/`{output}` into the command line, execute
//! under the platform shell with a hard timeout, sanitize the captured
//! output, upload the output file (if one was produced), and report a
//! terminal status. Temp files are removed on every exit path.

use super::{
    download_to_file, forward, report_status, upload_bytes, AgentContext, JobOutcome, WsWriter,
};
use crate::protocol::{AccessAuth, JobAssigned};
use crate::sanitize;
use crate::store::{JobStatus, JobType};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hard ceiling on command execution; the process is killed on expiry.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Entry point for one `JobAssigned`. Owns the capacity slot for the
/// job's lifetime and always emits exactly one terminal report.
pub(crate) async fn run_job(ctx: Arc<AgentContext>, writer: WsWriter, assigned: JobAssigned) {
    if !ctx.try_begin_job() {
        warn!(job_id = %assigned.job_id, "assignment arrived while unable to accept");
        report_status(
            &ctx,
            &writer,
            &assigned.job_id,
            assigned.attempt_id,
            JobStatus::Failed,
            "Agent cannot accept job".to_string(),
            String::new(),
            String::new(),
            String::new(),
        )
        .await;
        return;
    }

    report_status(
        &ctx,
        &writer,
        &assigned.job_id,
        assigned.attempt_id,
        JobStatus::Running,
        "Processing job".to_string(),
        String::new(),
        String::new(),
        String::new(),
    )
    .await;

    let outcome = match assigned.job_type {
        JobType::Command => execute_command(&ctx, &assigned).await,
        JobType::ForwardHttp => forward::execute_forward(&ctx, &assigned).await,
    };
    info!(
        job_id = %assigned.job_id,
        status = %outcome.status,
        "job finished"
    );
    report_status(
        &ctx,
        &writer,
        &assigned.job_id,
        assigned.attempt_id,
        outcome.status,
        outcome.message,
        outcome.output_key,
        outcome.stdout,
        outcome.stderr,
    )
    .await;

    ctx.finish_job();
}

/// File extension of an input key, dot included; empty when none. The
/// temp file keeps it so the invoked tool can dispatch by file type.
pub(crate) fn input_extension(input_key: &str) -> String {
    Path::new(input_key)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Literal `{input}` / `{output}` substitution.
pub(crate) fn substitute_command(command: &str, input_path: &str, output_path: &str) -> String {
    command
        .replace("{input}", input_path)
        .replace("{output}", output_path)
}

/// What the job's output payload is and which key gets reported.
#[derive(Debug, PartialEq)]
pub(crate) enum OutputChoice {
    /// Output file present and non-empty: upload it, report the key.
    File,
    /// No file but captured stdout: stdout-only job, empty key, no upload.
    Stdout,
    /// Nothing produced.
    None,
}

pub(crate) fn choose_output(output_file_len: u64, stdout_empty: bool) -> OutputChoice {
    if output_file_len > 0 {
        OutputChoice::File
    } else if !stdout_empty {
        OutputChoice::Stdout
    } else {
        OutputChoice::None
    }
}

struct TempPaths {
    input: PathBuf,
    output: PathBuf,
}

impl TempPaths {
    fn new(work_dir: &Path, job_id: &str, input_key: &str) -> Self {
        TempPaths {
            input: work_dir.join(format!("job_{}_input{}", job_id, input_extension(input_key))),
            output: work_dir.join(format!("job_{}_output", job_id)),
        }
    }

    async fn cleanup(&self) {
        let _ = tokio::fs::remove_file(&self.input).await;
        let _ = tokio::fs::remove_file(&self.output).await;
    }
}

async fn execute_command(ctx: &AgentContext, assigned: &JobAssigned) -> JobOutcome {
    if assigned.command.is_empty() {
        return JobOutcome::failed("Command is required");
    }
    let paths = TempPaths::new(&ctx.config.work_dir, &assigned.job_id, &assigned.input_key);
    let outcome = command_flow(ctx, assigned, &paths).await;
    paths.cleanup().await;
    outcome
}

async fn command_flow(
    ctx: &AgentContext,
    assigned: &JobAssigned,
    paths: &TempPaths,
) -> JobOutcome {
    // Input acquisition: only when both a key and an access are present.
    let mut input_path = String::new();
    if !assigned.input_key.is_empty() {
        if let Some(access) = &assigned.input_access {
            if access.auth == AccessAuth::Sts {
                return JobOutcome::failed("STS input auth is not supported");
            }
            debug!(job_id = %assigned.job_id, url = %crate::redact_url(&access.url), "downloading input");
            if let Err(e) = download_to_file(&ctx.client, &access.url, &paths.input).await {
                let _ = tokio::fs::remove_file(&paths.input).await;
                return JobOutcome::failed(format!("Download failed: {e:#}"));
            }
            input_path = paths.input.to_string_lossy().into_owned();
        }
    }

    let cmdline = substitute_command(
        &assigned.command,
        &input_path,
        &paths.output.to_string_lossy(),
    );
    debug!(job_id = %assigned.job_id, "executing command");

    let output = match run_shell(&cmdline).await {
        Ok(Some(output)) => output,
        Ok(None) => {
            return JobOutcome::failed(format!(
                "Command timed out after {}s",
                COMMAND_TIMEOUT.as_secs()
            ));
        }
        Err(e) => return JobOutcome::failed(format!("Failed to execute command: {e:#}")),
    };

    let stdout = sanitize::capture(&output.stdout);
    let stderr = sanitize::capture(&output.stderr);

    if !output.status.success() {
        let mut outcome = JobOutcome::failed(format!("Command exited with status {}", output.status));
        outcome.stdout = stdout;
        outcome.stderr = stderr;
        return outcome;
    }

    // Output assembly and upload.
    let file_len = tokio::fs::metadata(&paths.output)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    match choose_output(file_len, output.stdout.is_empty()) {
        OutputChoice::File => {
            if assigned.output_access.auth == AccessAuth::Sts {
                return JobOutcome::failed("STS output auth is not supported");
            }
            let bytes = match tokio::fs::read(&paths.output).await {
                Ok(bytes) => bytes,
                Err(e) => return JobOutcome::failed(format!("Failed to read output file: {e}")),
            };
            if let Err(e) = upload_bytes(&ctx.client, &assigned.output_access.url, bytes).await {
                let mut outcome = JobOutcome::failed(format!("Upload failed: {e:#}"));
                outcome.stdout = stdout;
                outcome.stderr = stderr;
                return outcome;
            }
            JobOutcome::succeeded(assigned.output_key.clone(), stdout, stderr)
        }
        OutputChoice::Stdout | OutputChoice::None => {
            // Stdout-only (or silent) jobs report an empty output key.
            JobOutcome::succeeded(String::new(), stdout, stderr)
        }
    }
}

/// Execute a command line under the platform shell. `Ok(None)` means the
/// timeout expired; `kill_on_drop` reaps the process.
async fn run_shell(cmdline: &str) -> Result<Option<std::process::Output>> {
    let mut cmd = shell_command(cmdline);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().context("spawning shell")?;
    match tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => Ok(Some(result.context("waiting for command")?)),
        Err(_) => Ok(None),
    }
}

#[cfg(windows)]
fn shell_command(cmdline: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(cmdline);
    cmd
}

#[cfg(not(windows))]
fn shell_command(cmdline: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(cmdline);
    cmd
}
