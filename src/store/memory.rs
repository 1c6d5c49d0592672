//! In-memory job store.
//!
//! The default backend when no `--database-url` is configured, and the
//! backend every unit/integration test runs against. All operations take a
//! single mutex over the record map, which makes each one atomic with
//! respect to concurrent writers by construction.

use super::{check_transition, Job, JobStatus, JobStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        MemoryJobStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_job<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut Job) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        f(job)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, mut job: Job) -> Result<Job, StoreError> {
        job.validate()?;
        job.normalize();
        let mut jobs = self.lock();
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        self.lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn update_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            check_transition(job_id, job.status, target)?;
            job.status = target;
            Ok(())
        })
    }

    async fn revert_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            if job.status.is_terminal() {
                return Err(StoreError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status,
                    to: target,
                });
            }
            job.status = target;
            Ok(())
        })
    }

    async fn update_assignment(
        &self,
        job_id: &str,
        agent_id: &str,
        lease_id: &str,
        lease_deadline: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.assigned_agent_id = agent_id.to_string();
            job.lease_id = lease_id.to_string();
            job.lease_deadline = lease_deadline;
            Ok(())
        })
    }

    async fn update_output(
        &self,
        job_id: &str,
        output_key: &str,
        output_prefix: &str,
    ) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.output_key = output_key.to_string();
            job.output_prefix = output_prefix.to_string();
            Ok(())
        })
    }

    async fn update_attempt_id(&self, job_id: &str, attempt_id: i32) -> Result<(), StoreError> {
        if attempt_id < 1 {
            return Err(StoreError::Conflict("attempt_id must be >= 1".into()));
        }
        self.with_job(job_id, |job| {
            job.attempt_id = attempt_id;
            Ok(())
        })
    }

    async fn update_stdout_stderr(
        &self,
        job_id: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.stdout = stdout.to_string();
            job.stderr = stderr.to_string();
            Ok(())
        })
    }

    async fn update_message(&self, job_id: &str, message: &str) -> Result<(), StoreError> {
        self.with_job(job_id, |job| {
            job.message = message.to_string();
            Ok(())
        })
    }

    async fn list(
        &self,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.lock();
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        // Newest first; job_id breaks created_at ties deterministically.
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        let offset = offset.max(0) as usize;
        let limit = limit.max(0) as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobType;

    fn make_job(id: &str) -> Job {
        let mut job = Job::new(id, JobType::Command);
        job.output_bucket = "bucket".into();
        job.command = "echo hi".into();
        job
    }

    async fn store_with(ids: &[&str]) -> MemoryJobStore {
        let store = MemoryJobStore::new();
        for id in ids {
            store.create(make_job(id)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn create_normalizes_and_persists() {
        let store = MemoryJobStore::new();
        let created = store.create(make_job("j1")).await.unwrap();
        assert_eq!(created.status, JobStatus::Pending);
        assert_eq!(created.output_prefix, "jobs/j1/1/");
        let fetched = store.get("j1").await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = store_with(&["j1"]).await;
        assert!(matches!(
            store.create(make_job("j1")).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.get("ghost").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_status_walks_the_happy_path() {
        let store = store_with(&["j1"]).await;
        store.update_status("j1", JobStatus::Assigned).await.unwrap();
        store.update_status("j1", JobStatus::Running).await.unwrap();
        store.update_status("j1", JobStatus::Succeeded).await.unwrap();
        assert_eq!(store.get("j1").await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn update_status_rejects_skipping_states() {
        let store = store_with(&["j1"]).await;
        let err = store.update_status("j1", JobStatus::Succeeded).await;
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));
        assert_eq!(store.get("j1").await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_status_is_immutable() {
        let store = store_with(&["j1"]).await;
        store.update_status("j1", JobStatus::Canceled).await.unwrap();
        for target in [JobStatus::Pending, JobStatus::Running, JobStatus::Failed] {
            assert!(store.update_status("j1", target).await.is_err());
        }
        // The compensation write must not resurrect terminal records either.
        assert!(store.revert_status("j1", JobStatus::Pending).await.is_err());
        assert_eq!(store.get("j1").await.unwrap().status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn revert_status_allows_dispatcher_rollback() {
        let store = store_with(&["j1"]).await;
        store.update_status("j1", JobStatus::Assigned).await.unwrap();
        store.revert_status("j1", JobStatus::Pending).await.unwrap();
        assert_eq!(store.get("j1").await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn assignment_and_output_fields_round_trip() {
        let store = store_with(&["j1"]).await;
        store
            .update_assignment("j1", "agent-1", "lease-abc", None)
            .await
            .unwrap();
        store
            .update_output("j1", "jobs/j1/1/output.json", "jobs/j1/1/")
            .await
            .unwrap();
        let job = store.get("j1").await.unwrap();
        assert_eq!(job.assigned_agent_id, "agent-1");
        assert_eq!(job.lease_id, "lease-abc");
        assert_eq!(job.output_key, "jobs/j1/1/output.json");
    }

    #[tokio::test]
    async fn attempt_id_must_be_positive() {
        let store = store_with(&["j1"]).await;
        assert!(store.update_attempt_id("j1", 0).await.is_err());
        store.update_attempt_id("j1", 1).await.unwrap();
        assert_eq!(store.get("j1").await.unwrap().attempt_id, 1);
    }

    #[tokio::test]
    async fn list_is_newest_first_with_pagination() {
        let store = MemoryJobStore::new();
        for i in 0..5 {
            let mut job = make_job(&format!("j{}", i));
            job.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.create(job).await.unwrap();
        }
        let page = store.list(2, 0, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].job_id, "j4");
        assert_eq!(page[1].job_id, "j3");
        let next = store.list(2, 2, None).await.unwrap();
        assert_eq!(next[0].job_id, "j2");
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = store_with(&["j1", "j2"]).await;
        store.update_status("j1", JobStatus::Assigned).await.unwrap();
        let pending = store.list(10, 0, Some(JobStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, "j2");
    }

    #[tokio::test]
    async fn execution_record_updates() {
        let store = store_with(&["j1"]).await;
        store.update_stdout_stderr("j1", "out", "err").await.unwrap();
        store.update_message("j1", "boom").await.unwrap();
        let job = store.get("j1").await.unwrap();
        assert_eq!(job.stdout, "out");
        assert_eq!(job.stderr, "err");
        assert_eq!(job.message, "boom");
    }
}
