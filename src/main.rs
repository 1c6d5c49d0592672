//! # Main — CLI Entry Point
//!
//! Three subcommands: `gateway` runs the coordinator (HTTP API + duplex
//! hub), `agent` runs a worker node that dials out to a gateway, and
//! `submit` posts a job JSON to a gateway for quick testing.
//!
//! Backends are selected by flags/environment: `--database-url` switches
//! the job store from in-memory to PostgreSQL, `--redis-url` switches the
//! pending queue from in-memory to Redis.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "skybridge",
    about = "Cloud-to-edge compute dispatch bridge",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator: submission API, agent gateway, dispatcher.
    Gateway {
        /// Listen port for the HTTP API and agent WebSocket.
        #[arg(long, default_value_t = 7411, env = "SKYBRIDGE_PORT")]
        port: u16,

        /// PostgreSQL job store (in-memory store when unset).
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,

        /// Redis pending queue (in-memory queue when unset).
        #[arg(long, env = "REDIS_URL")]
        redis_url: Option<String>,

        /// Object-store endpoint the dev signer mints URLs against.
        #[arg(long, env = "SKYBRIDGE_STORAGE_ENDPOINT", default_value = "http://127.0.0.1:9000")]
        storage_endpoint: String,

        /// Signing secret for the dev signer.
        #[arg(long, env = "SKYBRIDGE_STORAGE_SECRET", default_value = "skybridge-dev")]
        storage_secret: String,

        /// Signed-URL lifetime in seconds.
        #[arg(long, default_value_t = 900)]
        signing_ttl_secs: u64,

        /// HS256 secret for agent-token validation (dev mode when unset).
        #[arg(long, env = "SKYBRIDGE_JWT_SECRET")]
        jwt_secret: Option<String>,
    },

    /// Run a worker agent connected to a gateway.
    Agent {
        /// Gateway WebSocket endpoint, e.g. ws://coordinator:7411/ws.
        #[arg(long, env = "SKYBRIDGE_GATEWAY_URL")]
        gateway_url: Option<String>,

        /// Agent identifier (defaults to hostname plus a random suffix).
        #[arg(long, env = "SKYBRIDGE_AGENT_ID")]
        agent_id: Option<String>,

        /// Registration token presented to the gateway.
        #[arg(long, env = "SKYBRIDGE_AGENT_TOKEN")]
        agent_token: Option<String>,

        /// Maximum concurrent jobs.
        #[arg(long)]
        max_concurrency: Option<u32>,

        /// Input-cache TTL in seconds (<= 0 disables caching).
        #[arg(long)]
        cache_ttl_secs: Option<i64>,

        /// Start paused; toggle at runtime with SIGUSR1.
        #[arg(long)]
        paused: bool,

        /// TOML config file (defaults to ~/.skybridge/agent.toml if present).
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Submit a job JSON to a gateway and print the response.
    Submit {
        /// Gateway base URL.
        #[arg(long, default_value = "http://127.0.0.1:7411")]
        gateway: String,

        /// Job JSON file (stdin when omitted).
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Gateway {
            port,
            database_url,
            redis_url,
            storage_endpoint,
            storage_secret,
            signing_ttl_secs,
            jwt_secret,
        } => cli::run_gateway(cli::GatewayArgs {
            port,
            database_url,
            redis_url,
            storage_endpoint,
            storage_secret,
            signing_ttl_secs,
            jwt_secret,
        }),
        Commands::Agent {
            gateway_url,
            agent_id,
            agent_token,
            max_concurrency,
            cache_ttl_secs,
            paused,
            config,
        } => cli::run_agent(cli::AgentArgs {
            gateway_url,
            agent_id,
            agent_token,
            max_concurrency,
            cache_ttl_secs,
            paused,
            config,
        }),
        Commands::Submit { gateway, file } => cli::run_submit(&gateway, file.as_deref()),
    }
}
