//! # Agent — Worker-Side Job Runner
//!
//! The agent dials out to the gateway (NAT-friendly), registers, and runs
//! three concurrent activities over one WebSocket connection plus N job
//! executors (N ≤ `max_concurrency`):
//!
//! ```text
//! run() ── connect/register ──→ gateway
//!   ├─ heartbeat loop   (cadence from RegisterAck, default 20 s)
//!   ├─ pull loop        (backoff + immediate trigger → RequestJob)
//!   ├─ reader           (JobAssigned → spawn executor, acks → log)
//!   └─ executor × N     (download → exec/forward → upload → JobStatus)
//! ```
//!
//! All writes to the connection share one async mutex so frames are never
//! interleaved. `running_jobs`/`paused` live behind their own lock;
//! admission reads are snapshot-consistent.
//!
//! On read error the connection closes and the outer loop re-establishes
//! it after a short delay. SIGUSR1 toggles `paused` (unix).

pub mod cache;
pub mod executor;
pub mod forward;
pub mod pull;

use crate::protocol::{Envelope, Heartbeat, JobStatusReport, Payload, Register, RegisterAck};
use crate::store::JobStatus;
use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Delay before re-dialing the gateway after a dropped connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default transport timeout for object GET/PUT.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub(crate) type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
pub(crate) type WsWriter = Arc<tokio::sync::Mutex<WsSink>>;

// ── Configuration ───────────────────────────────────────────────

/// Local agent configuration, loadable from `~/.skybridge/agent.toml`
/// with CLI flags taking precedence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Gateway control endpoint, e.g. `ws://coordinator:7411/ws`.
    pub gateway_url: String,
    pub agent_id: String,
    pub agent_token: String,
    pub hostname: String,
    pub max_concurrency: u32,
    /// Start paused; heartbeats advertise it and dispatch skips the agent.
    pub paused: bool,
    /// Input-cache TTL in seconds; <= 0 disables caching.
    pub cache_ttl_secs: i64,
    pub cache_dir: PathBuf,
    /// Directory for per-job temp files.
    pub work_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            gateway_url: "ws://127.0.0.1:7411/ws".to_string(),
            agent_id: String::new(),
            agent_token: String::new(),
            hostname: String::new(),
            max_concurrency: 1,
            paused: false,
            cache_ttl_secs: 0,
            cache_dir: std::env::temp_dir().join("skybridge-cache"),
            work_dir: std::env::temp_dir(),
        }
    }
}

impl AgentConfig {
    /// Default config file location: `~/.skybridge/agent.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_err(|_| anyhow!("cannot determine home directory"))?;
        Ok(PathBuf::from(home).join(".skybridge").join("agent.toml"))
    }

    pub fn load(path: &std::path::Path) -> Result<AgentConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading agent config {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

// ── Shared runner state ─────────────────────────────────────────

/// Outcome of one job execution, reported as a terminal `JobStatus`.
#[derive(Debug)]
pub(crate) struct JobOutcome {
    pub status: JobStatus,
    pub message: String,
    pub output_key: String,
    pub stdout: String,
    pub stderr: String,
}

impl JobOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        JobOutcome {
            status: JobStatus::Failed,
            message: message.into(),
            output_key: String::new(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn succeeded(output_key: String, stdout: String, stderr: String) -> Self {
        JobOutcome {
            status: JobStatus::Succeeded,
            message: String::new(),
            output_key,
            stdout,
            stderr,
        }
    }
}

pub(crate) struct AgentContext {
    pub config: AgentConfig,
    paused: AtomicBool,
    running: Mutex<u32>,
    /// Sender half of the current connection's immediate-trigger channel.
    trigger: Mutex<Option<mpsc::Sender<()>>>,
    /// Object transfer client (5-minute transport timeout).
    pub client: reqwest::Client,
    /// Forward-HTTP client; per-request timeouts only (0 = unlimited).
    pub forward_client: reqwest::Client,
    pub cache: cache::InputCache,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .context("building transfer client")?;
        let forward_client = reqwest::Client::builder()
            .build()
            .context("building forward client")?;
        let cache = cache::InputCache::new(
            config.cache_dir.clone(),
            config.cache_ttl_secs,
            client.clone(),
        );
        Ok(Arc::new(AgentContext {
            paused: AtomicBool::new(config.paused),
            running: Mutex::new(0),
            trigger: Mutex::new(None),
            client,
            forward_client,
            cache,
            config,
        }))
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, u32> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn toggle_paused(&self) -> bool {
        let paused = !self.paused.load(Ordering::Relaxed);
        self.paused.store(paused, Ordering::Relaxed);
        paused
    }

    pub fn running_jobs(&self) -> u32 {
        *self.lock_running()
    }

    pub fn can_accept_job(&self) -> bool {
        !self.is_paused() && *self.lock_running() < self.config.max_concurrency
    }

    /// Admission check and slot claim in one critical section.
    pub fn try_begin_job(&self) -> bool {
        if self.is_paused() {
            return false;
        }
        let mut running = self.lock_running();
        if *running >= self.config.max_concurrency {
            return false;
        }
        *running += 1;
        true
    }

    /// Release a slot and nudge the pull loop so the next request happens
    /// within milliseconds instead of a full backoff cycle.
    pub fn finish_job(&self) {
        {
            let mut running = self.lock_running();
            *running = running.saturating_sub(1);
        }
        self.signal_pull();
    }

    /// Non-blocking trigger; at most one signal stays pending.
    pub fn signal_pull(&self) {
        let guard = self.trigger.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(());
        }
    }

    fn set_trigger(&self, tx: mpsc::Sender<()>) {
        *self.trigger.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }
}

// ── Connection lifecycle ────────────────────────────────────────

/// Run the agent until ctrl-c, re-dialing the gateway whenever the
/// connection drops.
pub async fn run(config: AgentConfig) -> Result<()> {
    let ctx = AgentContext::new(config)?;

    #[cfg(unix)]
    {
        let pause_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let Ok(mut usr1) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
            else {
                return;
            };
            while usr1.recv().await.is_some() {
                let paused = pause_ctx.toggle_paused();
                info!(paused, "pause toggled by SIGUSR1");
                if !paused {
                    pause_ctx.signal_pull();
                }
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("agent shutting down");
                return Ok(());
            }
            result = run_connection(Arc::clone(&ctx)) => {
                match result {
                    Ok(()) => info!("gateway connection closed"),
                    Err(e) => warn!(error = %e, "gateway connection failed"),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn run_connection(ctx: Arc<AgentContext>) -> Result<()> {
    let (ws, _) = connect_async(ctx.config.gateway_url.as_str())
        .await
        .with_context(|| format!("connecting to {}", ctx.config.gateway_url))?;
    let (sink, mut stream) = ws.split();
    let writer: WsWriter = Arc::new(tokio::sync::Mutex::new(sink));

    // Register and wait for the ack before starting any other activity.
    let register = Payload::Register(Register {
        agent_id: ctx.config.agent_id.clone(),
        agent_token: ctx.config.agent_token.clone(),
        hostname: ctx.config.hostname.clone(),
        max_concurrency: ctx.config.max_concurrency,
    });
    send_envelope(&writer, Envelope::new(ctx.config.agent_id.clone(), register)).await?;
    let ack = tokio::time::timeout(Duration::from_secs(10), wait_register_ack(&mut stream))
        .await
        .context("timed out waiting for register ack")??;
    if !ack.success {
        bail!("registration rejected: {}", ack.message);
    }
    let heartbeat_interval = ack.heartbeat_interval_sec.max(1);
    info!(
        agent_id = %ctx.config.agent_id,
        heartbeat_interval,
        "registered with gateway"
    );

    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    ctx.set_trigger(trigger_tx);
    let (stop_tx, stop_rx) = watch::channel(false);

    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&ctx),
        Arc::clone(&writer),
        heartbeat_interval,
        stop_rx.clone(),
    ));
    let pull = tokio::spawn(pull::run(
        Arc::clone(&ctx),
        Arc::clone(&writer),
        trigger_rx,
        stop_rx,
    ));

    // Reader: route incoming envelopes until the stream ends or errors.
    let result = loop {
        match stream.next().await {
            Some(Ok(Message::Text(raw))) => {
                handle_gateway_frame(&ctx, &writer, raw.as_ref()).await;
            }
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => break Err(anyhow!(e).context("reading control frame")),
        }
    };

    let _ = stop_tx.send(true);
    heartbeat.abort();
    pull.abort();
    result
}

async fn wait_register_ack(
    stream: &mut futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
) -> Result<RegisterAck> {
    while let Some(msg) = stream.next().await {
        let Ok(Message::Text(raw)) = msg else {
            continue;
        };
        match Envelope::unmarshal(raw.as_ref()) {
            Ok(envelope) => match envelope.payload {
                Payload::RegisterAck(ack) => return Ok(ack),
                other => debug!(kind = other.kind(), "frame before register ack ignored"),
            },
            Err(e) => warn!(error = %e, "undecodable frame before register ack"),
        }
    }
    bail!("connection closed before register ack")
}

async fn handle_gateway_frame(ctx: &Arc<AgentContext>, writer: &WsWriter, raw: &str) {
    let envelope = match Envelope::unmarshal(raw) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "undecodable control frame discarded");
            return;
        }
    };
    if envelope.agent_id != ctx.config.agent_id {
        warn!(
            envelope = %envelope.agent_id,
            ours = %ctx.config.agent_id,
            "frame addressed to another agent discarded"
        );
        return;
    }
    match envelope.payload {
        Payload::JobAssigned(assigned) => {
            info!(job_id = %assigned.job_id, "job assigned");
            let ctx = Arc::clone(ctx);
            let writer = Arc::clone(writer);
            tokio::spawn(executor::run_job(ctx, writer, *assigned));
        }
        Payload::RegisterAck(ack) => {
            debug!(success = ack.success, "register ack");
        }
        Payload::HeartbeatAck(ack) => {
            debug!(success = ack.success, "heartbeat ack");
        }
        Payload::Unknown => {
            warn!("control frame with unknown payload tag discarded");
        }
        other => {
            warn!(kind = other.kind(), "agent-bound frame carried a gateway-bound payload");
        }
    }
}

async fn heartbeat_loop(
    ctx: Arc<AgentContext>,
    writer: WsWriter,
    interval_secs: u64,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = interval.tick() => {
                let heartbeat = Payload::Heartbeat(Heartbeat {
                    agent_id: ctx.config.agent_id.clone(),
                    paused: ctx.is_paused(),
                    running_jobs: ctx.running_jobs(),
                });
                let envelope = Envelope::new(ctx.config.agent_id.clone(), heartbeat);
                if let Err(e) = send_envelope(&writer, envelope).await {
                    warn!(error = %e, "heartbeat write failed");
                    return;
                }
            }
        }
    }
}

// ── Frame and transfer helpers ──────────────────────────────────

/// Serialize and write one envelope under the connection write mutex.
pub(crate) async fn send_envelope(writer: &WsWriter, envelope: Envelope) -> Result<()> {
    let frame = envelope.marshal()?;
    let mut sink = writer.lock().await;
    sink.send(Message::Text(frame.into()))
        .await
        .context("writing control frame")
}

/// Report a job status. Write failures are logged but not retried; a lost
/// terminal report will eventually surface as LOST once a lease-expiry
/// sweeper exists.
pub(crate) async fn report_status(
    ctx: &AgentContext,
    writer: &WsWriter,
    job_id: &str,
    attempt_id: i32,
    status: JobStatus,
    message: String,
    output_key: String,
    stdout: String,
    stderr: String,
) {
    let report = Payload::JobStatus(JobStatusReport {
        job_id: job_id.to_string(),
        attempt_id,
        status,
        message,
        output_key,
        stdout,
        stderr,
    });
    let envelope = Envelope::new(ctx.config.agent_id.clone(), report);
    if let Err(e) = send_envelope(writer, envelope).await {
        warn!(job_id, status = %status, error = %e, "status report write failed");
    }
}

/// Stream an object GET to a local file. The response status must be
/// exactly 200; the caller removes the partial file on error.
pub(crate) async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    path: &std::path::Path,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {}", crate::redact_url(url)))?;
    if response.status() != reqwest::StatusCode::OK {
        bail!(
            "GET {} returned status {}",
            crate::redact_url(url),
            response.status()
        );
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading download stream")?;
        file.write_all(&chunk).await.context("writing download")?;
    }
    file.flush().await.context("flushing download")?;
    Ok(())
}

/// PUT a payload against a signed upload URL. Accepts 200 or 204.
pub(crate) async fn upload_bytes(
    client: &reqwest::Client,
    url: &str,
    bytes: Vec<u8>,
) -> Result<()> {
    let len = bytes.len();
    let response = client
        .put(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(reqwest::header::CONTENT_LENGTH, len)
        .body(bytes)
        .send()
        .await
        .with_context(|| format!("PUT {}", crate::redact_url(url)))?;
    match response.status().as_u16() {
        200 | 204 => Ok(()),
        status => bail!(
            "PUT {} returned status {}",
            crate::redact_url(url),
            status
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max: u32) -> AgentConfig {
        AgentConfig {
            agent_id: "test-agent".into(),
            max_concurrency: max,
            ..Default::default()
        }
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = AgentConfig {
            gateway_url: "ws://gw:7411/ws".into(),
            agent_id: "edge-7".into(),
            agent_token: "tok".into(),
            hostname: "edge-host".into(),
            max_concurrency: 4,
            paused: true,
            cache_ttl_secs: 300,
            cache_dir: "/var/cache/skybridge".into(),
            work_dir: "/tmp".into(),
        };
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.agent_id, "edge-7");
        assert_eq!(parsed.max_concurrency, 4);
        assert!(parsed.paused);
        assert_eq!(parsed.cache_ttl_secs, 300);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let parsed: AgentConfig = toml::from_str(r#"agent_id = "a1""#).unwrap();
        assert_eq!(parsed.agent_id, "a1");
        assert_eq!(parsed.max_concurrency, 1);
        assert!(!parsed.paused);
    }

    #[test]
    fn admission_respects_capacity() {
        let ctx = AgentContext::new(test_config(2)).unwrap();
        assert!(ctx.can_accept_job());
        assert!(ctx.try_begin_job());
        assert!(ctx.try_begin_job());
        assert!(!ctx.can_accept_job());
        assert!(!ctx.try_begin_job(), "third slot must be refused");
        ctx.finish_job();
        assert!(ctx.try_begin_job());
    }

    #[test]
    fn admission_respects_paused() {
        let ctx = AgentContext::new(test_config(2)).unwrap();
        ctx.toggle_paused();
        assert!(ctx.is_paused());
        assert!(!ctx.can_accept_job());
        assert!(!ctx.try_begin_job());
        ctx.toggle_paused();
        assert!(ctx.try_begin_job());
    }

    #[test]
    fn finish_job_clamps_at_zero() {
        let ctx = AgentContext::new(test_config(1)).unwrap();
        ctx.finish_job();
        assert_eq!(ctx.running_jobs(), 0);
    }

    #[tokio::test]
    async fn trigger_holds_at_most_one_signal() {
        let ctx = AgentContext::new(test_config(1)).unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        ctx.set_trigger(tx);
        ctx.signal_pull();
        ctx.signal_pull();
        ctx.signal_pull();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "only one signal may be pending");
    }
}
