//! PostgreSQL job store.
//!
//! Selected with `--database-url`. Uses the sqlx runtime query API against a
//! single `jobs` table; the schema is bootstrapped on connect so a fresh
//! database works without a migration step.
//!
//! `update_status` takes `SELECT ... FOR UPDATE` inside a transaction so the
//! read-validate-write sequence is atomic against concurrent reporters.

use super::{check_transition, ForwardHttpSpec, InputForwardMode, Job, JobStatus, JobStore, JobType, StoreError};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id            TEXT PRIMARY KEY,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    status            TEXT NOT NULL,
    attempt_id        INT NOT NULL DEFAULT 1,
    job_type          TEXT NOT NULL,
    input_bucket      TEXT,
    input_key         TEXT,
    output_bucket     TEXT NOT NULL,
    output_key        TEXT NOT NULL DEFAULT '',
    output_prefix     TEXT NOT NULL DEFAULT '',
    output_extension  TEXT NOT NULL DEFAULT 'bin',
    command           TEXT NOT NULL DEFAULT '',
    forward_http      JSONB,
    input_forward_mode TEXT NOT NULL DEFAULT 'URL',
    assigned_agent_id TEXT NOT NULL DEFAULT '',
    lease_id          TEXT NOT NULL DEFAULT '',
    lease_deadline    TIMESTAMPTZ,
    stdout            TEXT NOT NULL DEFAULT '',
    stderr            TEXT NOT NULL DEFAULT '',
    message           TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS jobs_created_at_idx ON jobs (created_at DESC);
CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status);
"#;

const SELECT_COLUMNS: &str = "SELECT job_id, created_at, status, attempt_id, job_type,
        input_bucket, input_key,
        output_bucket, output_key, output_prefix, output_extension,
        command, forward_http, input_forward_mode,
        assigned_agent_id, lease_id, lease_deadline,
        stdout, stderr, message
 FROM jobs";

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to job store database")?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("bootstrapping jobs schema")?;
        Ok(PgJobStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let status: String = row.get("status");
    let job_type: String = row.get("job_type");
    let forward_mode: String = row.get("input_forward_mode");
    let forward_http: Option<serde_json::Value> = row.get("forward_http");
    let forward_http: Option<ForwardHttpSpec> = match forward_http {
        Some(v) => Some(
            serde_json::from_value(v)
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("bad forward_http json: {e}")))?,
        ),
        None => None,
    };
    Ok(Job {
        job_id: row.get("job_id"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        status: status.parse()?,
        attempt_id: row.get("attempt_id"),
        job_type: match job_type.as_str() {
            "COMMAND" => JobType::Command,
            "FORWARD_HTTP" => JobType::ForwardHttp,
            other => return Err(StoreError::InvalidStatus(format!("job_type {other}"))),
        },
        input_bucket: row.get("input_bucket"),
        input_key: row.get("input_key"),
        output_bucket: row.get("output_bucket"),
        output_key: row.get("output_key"),
        output_prefix: row.get("output_prefix"),
        output_extension: row.get("output_extension"),
        command: row.get("command"),
        forward_http,
        input_forward_mode: match forward_mode.as_str() {
            "LOCAL_FILE" => InputForwardMode::LocalFile,
            _ => InputForwardMode::Url,
        },
        assigned_agent_id: row.get("assigned_agent_id"),
        lease_id: row.get("lease_id"),
        lease_deadline: row.get("lease_deadline"),
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
        message: row.get("message"),
    })
}

fn job_type_str(t: JobType) -> &'static str {
    match t {
        JobType::Command => "COMMAND",
        JobType::ForwardHttp => "FORWARD_HTTP",
    }
}

fn forward_mode_str(m: InputForwardMode) -> &'static str {
    match m {
        InputForwardMode::Url => "URL",
        InputForwardMode::LocalFile => "LOCAL_FILE",
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(anyhow::Error::new(e))
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, mut job: Job) -> Result<Job, StoreError> {
        job.validate()?;
        job.normalize();
        let forward_http = match &job.forward_http {
            Some(f) => Some(
                serde_json::to_value(f)
                    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?,
            ),
            None => None,
        };
        let result = sqlx::query(
            "INSERT INTO jobs (job_id, created_at, status, attempt_id, job_type,
                               input_bucket, input_key,
                               output_bucket, output_key, output_prefix, output_extension,
                               command, forward_http, input_forward_mode,
                               assigned_agent_id, lease_id, lease_deadline,
                               stdout, stderr, message)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(&job.job_id)
        .bind(job.created_at)
        .bind(job.status.as_str())
        .bind(job.attempt_id)
        .bind(job_type_str(job.job_type))
        .bind(&job.input_bucket)
        .bind(&job.input_key)
        .bind(&job.output_bucket)
        .bind(&job.output_key)
        .bind(&job.output_prefix)
        .bind(&job.output_extension)
        .bind(&job.command)
        .bind(forward_http)
        .bind(forward_mode_str(job.input_forward_mode))
        .bind(&job.assigned_agent_id)
        .bind(&job.lease_id)
        .bind(job.lease_deadline)
        .bind(&job.stdout)
        .bind(&job.stderr)
        .bind(&job.message)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        row_to_job(&row)
    }

    async fn update_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query("SELECT status FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let current: JobStatus = row.get::<String, _>("status").parse()?;
        check_transition(job_id, current, target)?;
        sqlx::query("UPDATE jobs SET status = $1 WHERE job_id = $2")
            .bind(target.as_str())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn revert_status(&self, job_id: &str, target: JobStatus) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query("SELECT status FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let current: JobStatus = row.get::<String, _>("status").parse()?;
        if current.is_terminal() {
            return Err(StoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from: current,
                to: target,
            });
        }
        sqlx::query("UPDATE jobs SET status = $1 WHERE job_id = $2")
            .bind(target.as_str())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn update_assignment(
        &self,
        job_id: &str,
        agent_id: &str,
        lease_id: &str,
        lease_deadline: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET assigned_agent_id = $1, lease_id = $2, lease_deadline = $3
             WHERE job_id = $4",
        )
        .bind(agent_id)
        .bind(lease_id)
        .bind(lease_deadline)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn update_output(
        &self,
        job_id: &str,
        output_key: &str,
        output_prefix: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET output_key = $1, output_prefix = $2 WHERE job_id = $3",
        )
        .bind(output_key)
        .bind(output_prefix)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn update_attempt_id(&self, job_id: &str, attempt_id: i32) -> Result<(), StoreError> {
        if attempt_id < 1 {
            return Err(StoreError::Conflict("attempt_id must be >= 1".into()));
        }
        let result = sqlx::query("UPDATE jobs SET attempt_id = $1 WHERE job_id = $2")
            .bind(attempt_id)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn update_stdout_stderr(
        &self,
        job_id: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET stdout = $1, stderr = $2 WHERE job_id = $3")
            .bind(stdout)
            .bind(stderr)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn update_message(&self, job_id: &str, message: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET message = $1 WHERE job_id = $2")
            .bind(message)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn list(
        &self,
        limit: i64,
        offset: i64,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE status = $1
                     ORDER BY created_at DESC, job_id DESC LIMIT $2 OFFSET $3"
                ))
                .bind(s.as_str())
                .bind(limit.max(0))
                .bind(offset.max(0))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS}
                     ORDER BY created_at DESC, job_id DESC LIMIT $1 OFFSET $2"
                ))
                .bind(limit.max(0))
                .bind(offset.max(0))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(backend)?;
        rows.iter().map(row_to_job).collect()
    }
}
