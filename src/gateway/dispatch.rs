//! Pull-based dispatcher.
//!
//! Runs inside the connection read loop when an agent sends `RequestJob`.
//! Binds the oldest dispatchable queued job to the requesting agent:
//! admission check, bounded dequeue-and-validate loop, signed-URL
//! generation, then a compensating commit chain. Every write has a
//! rollback; on any non-recoverable step the job returns to PENDING and
//! the queue, so the coordinator never leaks half-assigned jobs.
//!
//! Status lags assignment in the commit chain: a failure between the
//! assignment write and the status write leaves a record that says
//! "assignment was attempted but never became ASSIGNED" — the job is
//! still PENDING in the store and goes back to the queue.

use super::websocket::{OutboundSender, SendBufferFull};
use super::{lock_or_recover, AppState};
use crate::protocol::{AccessRef, Envelope, JobAssigned, Payload};
use crate::queue::PendingQueue;
use crate::signer::StorageSigner;
use crate::store::{output_key_for, output_prefix_for, Job, JobStatus, JobStore, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on stale queue entries skipped per request.
pub const DEQUEUE_ATTEMPTS: usize = 5;

/// Handle one `RequestJob` frame. `Err(SendBufferFull)` is fatal for the
/// connection; every other outcome is absorbed here (the agent simply
/// retries on its next pull).
pub(super) async fn handle_request_job(
    state: &Arc<AppState>,
    agent_id: &str,
    out: &OutboundSender,
) -> Result<(), SendBufferFull> {
    // Admission: the agent must be online, unpaused, and under capacity.
    // No reply on rejection; the agent's pull loop retries with backoff.
    {
        let registry = lock_or_recover(&state.registry);
        match registry.get(agent_id) {
            None => {
                debug!(agent_id, "request from offline agent ignored");
                return Ok(());
            }
            Some(entry) if entry.paused => {
                debug!(agent_id, "agent is paused");
                return Ok(());
            }
            Some(entry) if entry.running_jobs >= entry.max_concurrency => {
                debug!(
                    agent_id,
                    running = entry.running_jobs,
                    "agent is at capacity"
                );
                return Ok(());
            }
            Some(_) => {}
        }
    }

    // Dequeue-and-validate: the queue may hold ids whose job was canceled
    // or already assigned elsewhere; skip those, bounded.
    let mut job: Option<Job> = None;
    for _ in 0..DEQUEUE_ATTEMPTS {
        let job_id = match state.queue.dequeue().await {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "queue dequeue failed");
                return Ok(());
            }
        };
        match state.store.get(&job_id).await {
            Ok(j) if j.status == JobStatus::Pending => {
                job = Some(j);
                break;
            }
            Ok(j) => {
                debug!(job_id, status = %j.status, "skipping stale queue entry");
            }
            Err(StoreError::NotFound(_)) => {
                debug!(job_id, "skipping queue entry with no record");
            }
            Err(e) => {
                warn!(job_id, error = %e, "store lookup failed, re-enqueueing");
                requeue(state, &job_id).await;
                return Ok(());
            }
        }
    }
    let Some(mut job) = job else {
        return Ok(());
    };
    let job_id = job.job_id.clone();

    // Attempt-id normalization.
    if job.attempt_id < 1 {
        if let Err(e) = state.store.update_attempt_id(&job_id, 1).await {
            warn!(job_id, error = %e, "attempt normalization failed");
            requeue(state, &job_id).await;
            return Ok(());
        }
        job.attempt_id = 1;
    }

    // Canonical output path for this attempt.
    let output_prefix = output_prefix_for(&job_id, job.attempt_id);
    let output_key = output_key_for(&output_prefix, &job.output_extension);

    // Signed URLs. Either failure returns the job to the queue untouched.
    let ttl = state.config.signing_ttl;
    let input_access = match (&job.input_bucket, &job.input_key) {
        (Some(bucket), Some(key)) => {
            match state.signer.signed_download(bucket, key, ttl) {
                Ok(url) => Some(AccessRef {
                    url,
                    ..Default::default()
                }),
                Err(e) => {
                    warn!(job_id, error = %e, "input signing failed");
                    requeue(state, &job_id).await;
                    return Ok(());
                }
            }
        }
        _ => None,
    };
    let output_access = match state.signer.signed_upload(&job.output_bucket, &output_key, ttl) {
        Ok(url) => AccessRef {
            url,
            ..Default::default()
        },
        Err(e) => {
            warn!(job_id, error = %e, "output signing failed");
            requeue(state, &job_id).await;
            return Ok(());
        }
    };

    // Commit chain with compensation.
    let lease_id = Uuid::new_v4().to_string();
    if let Err(e) = state
        .store
        .update_assignment(&job_id, agent_id, &lease_id, None)
        .await
    {
        warn!(job_id, error = %e, "assignment write failed");
        requeue(state, &job_id).await;
        return Ok(());
    }
    if let Err(e) = state.store.update_status(&job_id, JobStatus::Assigned).await {
        warn!(job_id, error = %e, "status write failed, reverting assignment");
        clear_assignment(state, &job_id).await;
        requeue(state, &job_id).await;
        return Ok(());
    }
    if let Err(e) = state
        .store
        .update_output(&job_id, &output_key, &output_prefix)
        .await
    {
        warn!(job_id, error = %e, "output write failed, rolling back");
        rollback_assignment(state, &job_id).await;
        requeue(state, &job_id).await;
        return Ok(());
    }

    let assigned = JobAssigned {
        job_id: job_id.clone(),
        attempt_id: job.attempt_id,
        lease_id,
        lease_ttl_sec: 0,
        input_access,
        input_key: job.input_key.clone().unwrap_or_default(),
        output_access,
        output_prefix,
        output_key: output_key.clone(),
        command: job.command.clone(),
        job_type: job.job_type,
        forward_http: job.forward_http.clone(),
        input_forward_mode: job.input_forward_mode,
    };
    let frame = match Envelope::new(agent_id, Payload::JobAssigned(Box::new(assigned))).marshal() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(job_id, error = %e, "marshal failed, rolling back");
            rollback_assignment(state, &job_id).await;
            requeue(state, &job_id).await;
            return Ok(());
        }
    };
    if out.enqueue(frame).is_err() {
        warn!(job_id, agent_id, "send buffer full, rolling back assignment");
        rollback_assignment(state, &job_id).await;
        requeue(state, &job_id).await;
        return Err(SendBufferFull);
    }

    // Capacity accounting. Commit-after-send is safe because the next
    // RequestJob on this connection is serialized behind this handler.
    lock_or_recover(&state.registry).increment_running(agent_id);
    state.metrics.jobs_dispatched.inc();
    info!(job_id, agent_id, output_key, "job assigned");
    Ok(())
}

/// Full rollback: status back to PENDING, then assignment cleared.
async fn rollback_assignment(state: &Arc<AppState>, job_id: &str) {
    if let Err(e) = state.store.revert_status(job_id, JobStatus::Pending).await {
        warn!(job_id, error = %e, "status rollback failed");
    }
    clear_assignment(state, job_id).await;
}

async fn clear_assignment(state: &Arc<AppState>, job_id: &str) {
    if let Err(e) = state.store.update_assignment(job_id, "", "", None).await {
        warn!(job_id, error = %e, "assignment rollback failed");
    }
}

/// Return a job id to the queue tail. A failure here strands the job in
/// PENDING with no queue entry, which only an operator resubmit recovers;
/// log loudly.
async fn requeue(state: &Arc<AppState>, job_id: &str) {
    if let Err(e) = state.queue.enqueue(job_id).await {
        tracing::error!(job_id, error = %e, "re-enqueue failed, job is stranded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AppState, GatewayConfig};
    use crate::protocol::Envelope;
    use crate::queue::{MemoryQueue, PendingQueue};
    use crate::signer::{SignError, StorageSigner};
    use crate::store::memory::MemoryJobStore;
    use crate::store::{JobStore, JobType};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Signer that can be flipped into a failure mode (scenario S5).
    struct StubSigner {
        fail: AtomicBool,
    }

    impl StubSigner {
        fn new() -> Self {
            StubSigner {
                fail: AtomicBool::new(false),
            }
        }
    }

    impl StorageSigner for StubSigner {
        fn signed_download(
            &self,
            bucket: &str,
            key: &str,
            _ttl: Duration,
        ) -> Result<String, SignError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(SignError::Failed("stub signer down".into()));
            }
            Ok(format!("http://stub/{}/{}?sig=get", bucket, key))
        }

        fn signed_upload(
            &self,
            bucket: &str,
            key: &str,
            _ttl: Duration,
        ) -> Result<String, SignError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(SignError::Failed("stub signer down".into()));
            }
            Ok(format!("http://stub/{}/{}?sig=put", bucket, key))
        }
    }

    struct Harness {
        state: Arc<AppState>,
        signer: Arc<StubSigner>,
    }

    fn harness() -> Harness {
        let signer = Arc::new(StubSigner::new());
        let state = AppState::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryQueue::new()),
            signer.clone(),
            GatewayConfig::default(),
        );
        Harness { state, signer }
    }

    async fn seed_job(state: &Arc<AppState>, job_id: &str) {
        let mut job = Job::new(job_id, JobType::Command);
        job.output_bucket = "bucket".into();
        job.output_extension = "json".into();
        job.command = "echo hi > {output}".into();
        state.store.create(job).await.unwrap();
        state.queue.enqueue(job_id).await.unwrap();
    }

    fn register_agent(state: &Arc<AppState>, agent_id: &str, max: u32) {
        lock_or_recover(&state.registry).register(agent_id.into(), "host".into(), max);
    }

    fn assigned_job_id(frame: &str) -> String {
        match Envelope::unmarshal(frame).unwrap().payload {
            Payload::JobAssigned(assigned) => assigned.job_id,
            other => panic!("expected JobAssigned, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn assigns_pending_job_and_commits_state() {
        let h = harness();
        seed_job(&h.state, "j1").await;
        register_agent(&h.state, "a1", 1);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();

        let frame = rx.try_recv().expect("JobAssigned frame");
        assert_eq!(assigned_job_id(&frame), "j1");
        let job = h.state.store.get("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(job.assigned_agent_id, "a1");
        assert!(!job.lease_id.is_empty());
        assert_eq!(job.output_key, "jobs/j1/1/output.json");
        assert_eq!(job.output_prefix, "jobs/j1/1/");
        assert_eq!(
            lock_or_recover(&h.state.registry).get("a1").unwrap().running_jobs,
            1
        );
        assert_eq!(h.state.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn skips_stale_queue_entries() {
        // Scenario S2: a queue entry whose job is no longer PENDING is
        // skipped and the next valid entry is assigned.
        let h = harness();
        seed_job(&h.state, "j_stale").await;
        seed_job(&h.state, "j_ok").await;
        h.state
            .store
            .update_status("j_stale", JobStatus::Assigned)
            .await
            .unwrap();
        register_agent(&h.state, "a1", 1);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();

        let frame = rx.try_recv().expect("JobAssigned frame");
        assert_eq!(assigned_job_id(&frame), "j_ok");
        assert_eq!(
            h.state.store.get("j_ok").await.unwrap().status,
            JobStatus::Assigned
        );
    }

    #[tokio::test]
    async fn skips_queue_entries_without_records() {
        let h = harness();
        h.state.queue.enqueue("ghost").await.unwrap();
        seed_job(&h.state, "j1").await;
        register_agent(&h.state, "a1", 1);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();
        assert_eq!(assigned_job_id(&rx.try_recv().unwrap()), "j1");
    }

    #[tokio::test]
    async fn dequeue_loop_is_bounded() {
        // Six stale entries ahead of a good one: the bounded loop gives up
        // after five pulls and assigns nothing.
        let h = harness();
        for i in 0..6 {
            h.state.queue.enqueue(&format!("ghost{}", i)).await.unwrap();
        }
        seed_job(&h.state, "j1").await;
        register_agent(&h.state, "a1", 1);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();

        assert!(rx.try_recv().is_err(), "no assignment expected");
        // Five entries consumed, two remain (ghost5 and j1).
        assert_eq!(h.state.queue.size().await.unwrap(), 2);
        assert_eq!(
            h.state.store.get("j1").await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn capacity_is_enforced_until_release() {
        // Scenario S4: a single-slot agent gets one job; further requests
        // are rejected without touching the queue until capacity frees.
        let h = harness();
        seed_job(&h.state, "j_a").await;
        seed_job(&h.state, "j_b").await;
        register_agent(&h.state, "a1", 1);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();
        assert_eq!(assigned_job_id(&rx.try_recv().unwrap()), "j_a");

        // Second request while j_a is in flight: no frame, queue unchanged.
        handle_request_job(&h.state, "a1", &out).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(h.state.queue.size().await.unwrap(), 1);

        // j_a reaches a terminal state and capacity is released.
        h.state.store.update_status("j_a", JobStatus::Running).await.unwrap();
        h.state.store.update_status("j_a", JobStatus::Succeeded).await.unwrap();
        lock_or_recover(&h.state.registry).release_running("a1");

        handle_request_job(&h.state, "a1", &out).await.unwrap();
        assert_eq!(assigned_job_id(&rx.try_recv().unwrap()), "j_b");
    }

    #[tokio::test]
    async fn paused_agent_is_not_admitted() {
        let h = harness();
        seed_job(&h.state, "j1").await;
        register_agent(&h.state, "a1", 1);
        lock_or_recover(&h.state.registry).update_heartbeat("a1", true, 0);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(h.state.queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_agent_is_not_admitted() {
        let h = harness();
        seed_job(&h.state, "j1").await;
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "nobody", &out).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(h.state.queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn signing_failure_compensates() {
        // Scenario S5: the signer fails; the job stays PENDING, returns to
        // the queue, and no capacity is consumed.
        let h = harness();
        seed_job(&h.state, "j5").await;
        register_agent(&h.state, "a1", 1);
        h.signer.fail.store(true, Ordering::Relaxed);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();

        assert!(rx.try_recv().is_err(), "no JobAssigned expected");
        let job = h.state.store.get("j5").await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.assigned_agent_id, "");
        assert_eq!(h.state.queue.peek().await.unwrap().as_deref(), Some("j5"));
        assert_eq!(
            lock_or_recover(&h.state.registry).get("a1").unwrap().running_jobs,
            0
        );
    }

    #[tokio::test]
    async fn send_buffer_overflow_rolls_back_and_closes() {
        let h = harness();
        seed_job(&h.state, "j1").await;
        register_agent(&h.state, "a1", 1);
        // Zero-capacity channel: mpsc requires >= 1, so fill a 1-slot buffer.
        let (out, _rx) = OutboundSender::test_pair(1);
        out.enqueue("occupied".into()).unwrap();

        let result = handle_request_job(&h.state, "a1", &out).await;
        assert!(result.is_err(), "overflow must be fatal");
        let job = h.state.store.get("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.assigned_agent_id, "");
        assert_eq!(h.state.queue.size().await.unwrap(), 1);
        assert_eq!(
            lock_or_recover(&h.state.registry).get("a1").unwrap().running_jobs,
            0
        );
    }

    #[tokio::test]
    async fn empty_queue_is_silent() {
        let h = harness();
        register_agent(&h.state, "a1", 1);
        let (out, mut rx) = OutboundSender::test_pair(8);
        handle_request_job(&h.state, "a1", &out).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn input_reference_produces_signed_download() {
        let h = harness();
        let mut job = Job::new("j1", JobType::Command);
        job.output_bucket = "bucket".into();
        job.input_bucket = Some("bucket".into());
        job.input_key = Some("in/a.jpg".into());
        job.command = "convert {input} {output}".into();
        h.state.store.create(job).await.unwrap();
        h.state.queue.enqueue("j1").await.unwrap();
        register_agent(&h.state, "a1", 1);
        let (out, mut rx) = OutboundSender::test_pair(8);

        handle_request_job(&h.state, "a1", &out).await.unwrap();
        let frame = rx.try_recv().unwrap();
        match Envelope::unmarshal(&frame).unwrap().payload {
            Payload::JobAssigned(assigned) => {
                let input = assigned.input_access.expect("input access");
                assert!(input.url.contains("in/a.jpg"));
                assert_eq!(assigned.input_key, "in/a.jpg");
                assert!(assigned.output_access.url.contains("jobs/j1/1/output.bin"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
