//! # Protocol — Control Message Envelope
//!
//! Every interaction on the duplex control connection is one [`Envelope`]
//! carried as a JSON object in a WebSocket text frame. The payload is an
//! internally tagged union; receivers dispatch on the tag and tolerate
//! unknown future tags by discarding the frame with a log line.
//!
//! ## Payload directions
//!
//! | Agent → Gateway | Gateway → Agent |
//! |-----------------|-----------------|
//! | `register`      | `register_ack`  |
//! | `heartbeat`     | `heartbeat_ack` |
//! | `request_job`   | `job_assigned`  |
//! | `job_status`    |                 |
//!
//! ## Consistency rule
//!
//! The envelope-level `agent_id` must equal any payload-embedded
//! `agent_id`; [`Envelope::validate`] enforces this and receivers discard
//! mismatching frames.

use crate::store::{ForwardHttpSpec, InputForwardMode, JobStatus, JobType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Heartbeat cadence announced to agents in `RegisterAck`.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("envelope agent_id {envelope:?} does not match payload agent_id {payload:?}")]
    AgentIdMismatch { envelope: String, payload: String },
}

/// The wire frame carrying every control interaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub agent_id: String,
    /// Opaque correlation token, fresh per frame.
    #[serde(default)]
    pub request_id: String,
    /// Sender wall clock, milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp_ms: i64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(agent_id: impl Into<String>, payload: Payload) -> Self {
        Envelope {
            agent_id: agent_id.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: crate::now_ms(),
            payload,
        }
    }

    /// Deterministic JSON marshaling.
    pub fn marshal(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn unmarshal(raw: &str) -> Result<Envelope, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }

    /// Enforce envelope/payload `agent_id` agreement.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(embedded) = self.payload.agent_id() {
            if !embedded.is_empty() && embedded != self.agent_id {
                return Err(ProtocolError::AgentIdMismatch {
                    envelope: self.agent_id.clone(),
                    payload: embedded.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Register(Register),
    RegisterAck(RegisterAck),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    RequestJob(RequestJob),
    JobAssigned(Box<JobAssigned>),
    JobStatus(JobStatusReport),
    /// Forward compatibility: frames with a tag this build does not know
    /// land here and are discarded by the receiver.
    #[serde(other)]
    Unknown,
}

impl Payload {
    /// The payload-embedded agent id, where the variant carries one.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Payload::Register(p) => Some(&p.agent_id),
            Payload::Heartbeat(p) => Some(&p.agent_id),
            Payload::RequestJob(p) => Some(&p.agent_id),
            _ => None,
        }
    }

    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Register(_) => "register",
            Payload::RegisterAck(_) => "register_ack",
            Payload::Heartbeat(_) => "heartbeat",
            Payload::HeartbeatAck(_) => "heartbeat_ack",
            Payload::RequestJob(_) => "request_job",
            Payload::JobAssigned(_) => "job_assigned",
            Payload::JobStatus(_) => "job_status",
            Payload::Unknown => "unknown",
        }
    }
}

// ── Agent → Gateway ─────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub agent_id: String,
    #[serde(default)]
    pub agent_token: String,
    #[serde(default)]
    pub hostname: String,
    pub max_concurrency: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub running_jobs: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestJob {
    pub agent_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub attempt_id: i32,
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub output_key: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

// ── Gateway → Agent ─────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub heartbeat_interval_sec: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub success: bool,
}

/// How the agent reaches an out-of-band object: a pre-authorized URL.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessRef {
    pub url: String,
    #[serde(default)]
    pub auth: AccessAuth,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessAuth {
    /// The URL itself carries authorization; bare GET/PUT works.
    #[default]
    SignedUrl,
    /// Short-term credential exchange. Not supported by this runner.
    Sts,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobAssigned {
    pub job_id: String,
    pub attempt_id: i32,
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub lease_ttl_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_access: Option<AccessRef>,
    #[serde(default)]
    pub input_key: String,
    pub output_access: AccessRef,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub output_key: String,
    #[serde(default)]
    pub command: String,
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_http: Option<ForwardHttpSpec>,
    #[serde(default)]
    pub input_forward_mode: InputForwardMode,
}
