//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Each function
//! wires its backends from flags/environment, builds a Tokio runtime, and
//! blocks on the long-running service.

use anyhow::{Context, Result};
use skybridge::agent::{self, AgentConfig};
use skybridge::gateway::{self, AppState, GatewayConfig};
use skybridge::queue::{MemoryQueue, RedisQueue, SharedQueue};
use skybridge::signer::HmacSigner;
use skybridge::store::memory::MemoryJobStore;
use skybridge::store::postgres::PgJobStore;
use skybridge::store::SharedJobStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct GatewayArgs {
    pub port: u16,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub storage_endpoint: String,
    pub storage_secret: String,
    pub signing_ttl_secs: u64,
    pub jwt_secret: Option<String>,
}

pub fn run_gateway(args: GatewayArgs) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let store: SharedJobStore = match &args.database_url {
            Some(url) => {
                info!("using PostgreSQL job store");
                Arc::new(PgJobStore::connect(url).await?)
            }
            None => {
                info!("using in-memory job store");
                Arc::new(MemoryJobStore::new())
            }
        };
        let queue: SharedQueue = match &args.redis_url {
            Some(url) => {
                info!("using Redis pending queue");
                Arc::new(RedisQueue::connect(url, None).await?)
            }
            None => {
                info!("using in-memory pending queue");
                Arc::new(MemoryQueue::new())
            }
        };
        let signer = Arc::new(HmacSigner::new(
            args.storage_endpoint.clone(),
            args.storage_secret.clone(),
        ));
        let config = GatewayConfig {
            signing_ttl: Duration::from_secs(args.signing_ttl_secs.max(1)),
            jwt_secret: args.jwt_secret.clone(),
            ..Default::default()
        };
        let state = AppState::new(store, queue, signer, config);
        gateway::run(args.port, state).await
    })
}

pub struct AgentArgs {
    pub gateway_url: Option<String>,
    pub agent_id: Option<String>,
    pub agent_token: Option<String>,
    pub max_concurrency: Option<u32>,
    pub cache_ttl_secs: Option<i64>,
    pub paused: bool,
    pub config: Option<PathBuf>,
}

/// Resolve the agent configuration: config file first (explicit flag, or
/// the default path when it exists), then flag/env overrides on top.
fn resolve_agent_config(args: &AgentArgs) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => match AgentConfig::default_path() {
            Ok(path) if path.exists() => AgentConfig::load(&path)?,
            _ => AgentConfig::default(),
        },
    };
    if let Some(url) = &args.gateway_url {
        config.gateway_url = url.clone();
    }
    if let Some(id) = &args.agent_id {
        config.agent_id = id.clone();
    }
    if let Some(token) = &args.agent_token {
        config.agent_token = token.clone();
    }
    if let Some(max) = args.max_concurrency {
        config.max_concurrency = max.max(1);
    }
    if let Some(ttl) = args.cache_ttl_secs {
        config.cache_ttl_secs = ttl;
    }
    if args.paused {
        config.paused = true;
    }
    if config.hostname.is_empty() {
        config.hostname = gethostname().unwrap_or_else(|| "unknown".to_string());
    }
    if config.agent_id.is_empty() {
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        config.agent_id = format!("{}-{}", config.hostname, suffix);
    }
    Ok(config)
}

pub fn run_agent(args: AgentArgs) -> Result<()> {
    let config = resolve_agent_config(&args)?;
    info!(
        agent_id = %config.agent_id,
        gateway = %config.gateway_url,
        max_concurrency = config.max_concurrency,
        "agent starting"
    );
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(agent::run(config))
}

pub fn run_submit(gateway: &str, file: Option<&Path>) -> Result<()> {
    let body = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    // Validate locally so a typo fails before it hits the wire.
    let _: serde_json::Value = serde_json::from_str(&body).context("job body is not JSON")?;

    let url = format!("{}/api/jobs", gateway.trim_end_matches('/'));
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let client = reqwest::Client::new();
        let response = client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        println!("{} {}", status.as_u16(), text);
        if !status.is_success() {
            anyhow::bail!("submission failed with status {}", status);
        }
        Ok(())
    })
}

fn gethostname() -> Option<String> {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
