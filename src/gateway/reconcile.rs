//! Status reconciler.
//!
//! Validates incoming `JobStatus` reports and drives the job state
//! machine. Rules apply in order: ownership, attempt match, terminal
//! protection, transition validity, then per-status side effects. Any
//! transition into a terminal status releases one unit of the sender's
//! capacity in the registry.
//!
//! Re-delivered terminal reports are silently ignored — terminal
//! protection makes delivery idempotent.

use super::{lock_or_recover, AppState};
use crate::protocol::JobStatusReport;
use crate::store::{JobStatus, JobStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(super) async fn handle_status_report(
    state: &Arc<AppState>,
    sender: &str,
    report: &JobStatusReport,
) {
    let job_id = report.job_id.as_str();
    let job = match state.store.get(job_id).await {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id, sender, error = %e, "status report for unknown job discarded");
            state.metrics.record_discard("unknown_job");
            return;
        }
    };

    // Ownership: only the assigned agent may report on a job.
    if job.assigned_agent_id != sender {
        warn!(
            job_id,
            sender,
            owner = %job.assigned_agent_id,
            "status report from non-owner discarded"
        );
        state.metrics.record_discard("ownership");
        return;
    }

    if report.attempt_id != job.attempt_id {
        warn!(
            job_id,
            reported = report.attempt_id,
            current = job.attempt_id,
            "status report for wrong attempt discarded"
        );
        state.metrics.record_discard("attempt_mismatch");
        return;
    }

    // Terminal protection: idempotent re-delivery is silently ignored.
    if job.status.is_terminal() {
        debug!(job_id, status = %job.status, "report after terminal status ignored");
        return;
    }

    match report.status {
        JobStatus::Running => {
            // Progress update: persist captured output when provided.
            if !report.stdout.is_empty() || !report.stderr.is_empty() {
                if let Err(e) = state
                    .store
                    .update_stdout_stderr(job_id, &report.stdout, &report.stderr)
                    .await
                {
                    warn!(job_id, error = %e, "progress output write failed");
                }
            }
            if job.status != JobStatus::Running {
                if let Err(e) = state.store.update_status(job_id, JobStatus::Running).await {
                    warn!(job_id, error = %e, "RUNNING report ignored");
                }
            }
        }
        JobStatus::Succeeded => {
            if let Err(e) = state
                .store
                .update_stdout_stderr(job_id, &report.stdout, &report.stderr)
                .await
            {
                warn!(job_id, error = %e, "output capture write failed");
            }
            // A reported output key must exactly match the assigned one.
            // On mismatch the job fails and the stored key is preserved.
            if !report.output_key.is_empty() && report.output_key != job.output_key {
                warn!(
                    job_id,
                    reported = %report.output_key,
                    expected = %job.output_key,
                    "output key mismatch, failing job"
                );
                let msg = format!(
                    "output key mismatch: agent reported {:?}, expected {:?}",
                    report.output_key, job.output_key
                );
                if let Err(e) = state.store.update_message(job_id, &msg).await {
                    warn!(job_id, error = %e, "message write failed");
                }
                finish(state, sender, job_id, JobStatus::Failed).await;
                return;
            }
            if !report.message.is_empty() {
                if let Err(e) = state.store.update_message(job_id, &report.message).await {
                    warn!(job_id, error = %e, "message write failed");
                }
            }
            finish(state, sender, job_id, JobStatus::Succeeded).await;
        }
        JobStatus::Failed => {
            if let Err(e) = state
                .store
                .update_stdout_stderr(job_id, &report.stdout, &report.stderr)
                .await
            {
                warn!(job_id, error = %e, "output capture write failed");
            }
            if let Err(e) = state.store.update_message(job_id, &report.message).await {
                warn!(job_id, error = %e, "message write failed");
            }
            finish(state, sender, job_id, JobStatus::Failed).await;
        }
        JobStatus::Canceled | JobStatus::Lost => {
            finish(state, sender, job_id, report.status).await;
        }
        JobStatus::Pending | JobStatus::Assigned => {
            warn!(job_id, status = %report.status, "agent reported a non-reportable status");
            state.metrics.record_discard("invalid_report");
        }
    }
}

/// Apply a terminal transition and, when it commits, release the sender's
/// capacity exactly once.
async fn finish(state: &Arc<AppState>, sender: &str, job_id: &str, target: JobStatus) {
    match state.store.update_status(job_id, target).await {
        Ok(()) => {
            lock_or_recover(&state.registry).release_running(sender);
            state.metrics.record_terminal(target.as_str());
            info!(job_id, sender, status = %target, "job reached terminal status");
        }
        Err(e) => {
            warn!(job_id, error = %e, "terminal transition rejected");
        }
    }
}
