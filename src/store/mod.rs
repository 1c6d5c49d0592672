//! # Job Store — Durable Records and the Status State Machine
//!
//! Every job ever submitted lives in the store; terminal records are never
//! destroyed. The store is the single source of truth for job state — the
//! pending queue is only an acceleration structure and may hold stale ids.
//!
//! ## Status state machine
//!
//! ```text
//! PENDING ──→ ASSIGNED ──→ RUNNING ──→ SUCCEEDED
//!    │            │           ├──────→ FAILED
//!    │            │           ├──────→ CANCELED
//!    │            ├──→ LOST   └──────→ LOST
//!    └──→ CANCELED└──→ CANCELED
//! ```
//!
//! Terminal statuses (SUCCEEDED, FAILED, CANCELED, LOST) are immutable.
//! `update_status` validates the transition inside a single critical
//! section / transaction; concurrent writers cannot move a job backwards.
//!
//! ## Implementations
//!
//! - [`memory::MemoryJobStore`] — mutex-guarded map, the default backend.
//! - [`postgres::PgJobStore`] — sqlx/PostgreSQL with `FOR UPDATE` guarded
//!   transitions, selected via `--database-url`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Maximum accepted length of a COMMAND job's command line.
pub const MAX_COMMAND_LEN: usize = 8192;

/// Extension used for the output object when the submitter supplies none.
pub const DEFAULT_OUTPUT_EXTENSION: &str = "bin";

/// Shared handle to whichever store backend the process is running with.
pub type SharedJobStore = Arc<dyn JobStore>;

// ── Status ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Lost,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled | JobStatus::Lost
        )
    }

    /// Whether the state machine allows `self → target`.
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(target, Assigned | Canceled),
            Assigned => matches!(target, Running | Canceled | Lost),
            Running => matches!(target, Succeeded | Failed | Canceled | Lost),
            Succeeded | Failed | Canceled | Lost => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Assigned => "ASSIGNED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Lost => "LOST",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, StoreError> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "ASSIGNED" => Ok(JobStatus::Assigned),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELED" => Ok(JobStatus::Canceled),
            "LOST" => Ok(JobStatus::Lost),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

// ── Job payload types ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[default]
    Command,
    ForwardHttp,
}

/// How a forward-HTTP job receives its input payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputForwardMode {
    /// Pass the signed input URL through headers / JSON body (no download).
    #[default]
    Url,
    /// Download (via the agent's input cache) and attach as a multipart file.
    LocalFile,
}

/// Target description for a FORWARD_HTTP job: a local HTTP service on the
/// agent host consumes the work.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardHttpSpec {
    pub url: String,
    /// HTTP method; POST when empty.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Request body; forward mode may substitute one when empty.
    #[serde(default)]
    pub body: String,
    /// Request timeout in seconds; 0 means unlimited.
    #[serde(default)]
    pub timeout_sec: u64,
}

// ── Job record ──────────────────────────────────────────────────

/// The canonical object prefix for one attempt's outputs.
pub fn output_prefix_for(job_id: &str, attempt_id: i32) -> String {
    format!("jobs/{}/{}/", job_id, attempt_id)
}

/// The canonical output object key under `prefix`, honoring the submitted
/// extension (leading dots stripped, empty falls back to "bin").
pub fn output_key_for(prefix: &str, extension: &str) -> String {
    let ext = extension.trim_start_matches('.');
    let ext = if ext.is_empty() { DEFAULT_OUTPUT_EXTENSION } else { ext };
    format!("{}output.{}", prefix, ext)
}

/// A single dispatchable unit of work. Created by the submission API,
/// mutated only by the dispatcher (assignment, output path) and the
/// reconciler (status, execution record).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Fixed at 1 until multi-attempt retry lands.
    pub attempt_id: i32,
    pub job_type: JobType,

    // Input reference: both present or both absent.
    #[serde(default)]
    pub input_bucket: Option<String>,
    #[serde(default)]
    pub input_key: Option<String>,

    // Output reference. `output_prefix` is invariantly
    // "jobs/{job_id}/{attempt_id}/" and `output_key` lives under it.
    pub output_bucket: String,
    #[serde(default)]
    pub output_key: String,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub output_extension: String,

    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub forward_http: Option<ForwardHttpSpec>,
    #[serde(default)]
    pub input_forward_mode: InputForwardMode,

    // Assignment. `lease_deadline` is persisted for a future lease-expiry
    // sweeper; nothing reads it yet.
    #[serde(default)]
    pub assigned_agent_id: String,
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub lease_deadline: Option<DateTime<Utc>>,

    // Execution record, each capped at 10 KiB by the agent.
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub message: String,
}

impl Job {
    pub fn new(job_id: impl Into<String>, job_type: JobType) -> Self {
        Job {
            job_id: job_id.into(),
            created_at: Utc::now(),
            status: JobStatus::Pending,
            attempt_id: 1,
            job_type,
            input_bucket: None,
            input_key: None,
            output_bucket: String::new(),
            output_key: String::new(),
            output_prefix: String::new(),
            output_extension: String::new(),
            command: String::new(),
            forward_http: None,
            input_forward_mode: InputForwardMode::default(),
            assigned_agent_id: String::new(),
            lease_id: String::new(),
            lease_deadline: None,
            stdout: String::new(),
            stderr: String::new(),
            message: String::new(),
        }
    }

    /// Enforce the shape invariants that hold for every persisted record.
    ///
    /// Any submitted `output_prefix` or `output_key` that does not match the
    /// canonical layout is silently overwritten — callers are allowed to
    /// send them, but the attempt prefix is authoritative.
    pub fn normalize(&mut self) {
        if self.attempt_id < 1 {
            self.attempt_id = 1;
        }
        self.output_prefix = output_prefix_for(&self.job_id, self.attempt_id);
        if !self.output_key.is_empty() && !self.output_key.starts_with(&self.output_prefix) {
            self.output_key = String::new();
        }
        if self.output_extension.is_empty() {
            self.output_extension = DEFAULT_OUTPUT_EXTENSION.to_string();
        }
    }

    /// Validate submitter-controlled fields before persisting.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.job_id.is_empty() {
            return Err(StoreError::Conflict("job_id must not be empty".into()));
        }
        if self.input_bucket.is_some() != self.input_key.is_some() {
            return Err(StoreError::Conflict(
                "input_bucket and input_key must be supplied together".into(),
            ));
        }
        if self.output_bucket.is_empty() {
            return Err(StoreError::Conflict("output_bucket is required".into()));
        }
        if self.command.len() > MAX_COMMAND_LEN {
            return Err(StoreError::Conflict(format!(
                "command exceeds {} characters",
                MAX_COMMAND_LEN
            )));
        }
        Ok(())
    }
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("invalid job status {0:?}")]
    InvalidStatus(String),
    #[error("invalid transition {from} -> {to} for job {job_id}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Shared transition check used by every backend's `update_status`.
pub(crate) fn check_transition(
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            job_id: job_id.to_string(),
            from,
            to,
        })
    }
}

// ── Trait ───────────────────────────────────────────────────────

/// The persistence contract the gateway core programs against.
///
/// Every operation is atomic with respect to concurrent writers; in
/// particular `update_status` reads, validates, and writes within a single
/// critical section or transaction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate, normalize, and persist a new PENDING job.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    async fn get(&self, job_id: &str) -> Result<Job, StoreError>;

    /// Apply a status transition, rejecting anything the state machine
    /// does not allow from the job's current status.
    async fn update_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError>;

    /// Compensation-only status write used by the dispatcher's rollback
    /// path (ASSIGNED back to PENDING). Bypasses the forward-transition
    /// table but still refuses to touch terminal records.
    async fn revert_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError>;

    async fn update_assignment(
        &self,
        job_id: &str,
        agent_id: &str,
        lease_id: &str,
        lease_deadline: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn update_output(
        &self,
        job_id: &str,
        output_key: &str,
        output_prefix: &str,
    ) -> Result<(), StoreError>;

    async fn update_attempt_id(&self, job_id: &str, attempt_id: i32) -> Result<(), StoreError>;

    async fn update_stdout_stderr(
        &self,
        job_id: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError>;

    async fn update_message(&self, job_id: &str, message: &str) -> Result<(), StoreError>;

    /// Paginated listing, newest first by `created_at`.
    async fn list(
        &self,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError>;
}
