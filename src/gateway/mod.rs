//! # Gateway — Coordinator HTTP Server and Duplex Hub
//!
//! Runs the Axum server that accepts job submissions over HTTP and holds
//! the persistent WebSocket connections agents dial out to. Dispatch and
//! reconciliation run inside each connection's read loop, so per-agent
//! decisions are serialized for free.
//!
//! ## Endpoints
//!
//! - `POST /api/jobs` — submit a job (JSON ≤ 1 MiB); 201 on success.
//! - `GET /api/jobs` — paginated listing, newest first, `?status=` filter.
//! - `GET /api/jobs/{job_id}` — full job record.
//! - `POST /api/jobs/{job_id}/cancel` — cancel a non-terminal job.
//! - `GET /api/agents/online` — registry snapshot after liveness filter.
//! - `GET /ws` — agent control connection upgrade.
//! - `GET /healthz` — store/queue reachability.
//! - `GET /metrics` — Prometheus exposition.
//!
//! ## State Management
//!
//! [`AppState`] holds the store, queue, and signer behind their trait
//! seams plus the mutex-guarded registry; shared via `Arc` across all
//! handlers and connections. Never process-wide singletons.

mod auth;
mod dispatch;
mod reconcile;
mod routes_agents;
mod routes_health;
mod routes_jobs;
mod websocket;

pub use websocket::OutboundSender;

use crate::prom_metrics::Metrics;
use crate::queue::{PendingQueue, SharedQueue};
use crate::registry::{AgentRegistry, ONLINE_WINDOW_SECS};
use crate::signer::{SharedSigner, DEFAULT_SIGNING_TTL};
use crate::store::SharedJobStore;
use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

/// Maximum accepted submission body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Lock a mutex, recovering from poisoning. If a previous holder panicked
/// we still get access to the data — the alternative is taking the whole
/// gateway down.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct GatewayConfig {
    /// Heartbeat cadence announced in RegisterAck.
    pub heartbeat_interval_sec: u64,
    /// Lifetime of the signed URLs minted at assignment time.
    pub signing_ttl: Duration,
    /// HS256 secret for agent-token validation; None accepts any token.
    pub jwt_secret: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            heartbeat_interval_sec: crate::protocol::HEARTBEAT_INTERVAL_SECS,
            signing_ttl: DEFAULT_SIGNING_TTL,
            jwt_secret: None,
        }
    }
}

pub struct AppState {
    pub store: SharedJobStore,
    pub queue: SharedQueue,
    pub signer: SharedSigner,
    pub registry: Mutex<AgentRegistry>,
    pub metrics: Metrics,
    pub config: GatewayConfig,
}

impl AppState {
    pub fn new(
        store: SharedJobStore,
        queue: SharedQueue,
        signer: SharedSigner,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(AppState {
            store,
            queue,
            signer,
            registry: Mutex::new(AgentRegistry::new()),
            metrics: Metrics::new(),
            config,
        })
    }
}

/// Build the Axum router with all routes and middleware layers.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket::handler_ws))
        .route(
            "/api/jobs",
            post(routes_jobs::create_job).get(routes_jobs::list_jobs),
        )
        .route("/api/jobs/{job_id}", get(routes_jobs::get_job))
        .route("/api/jobs/{job_id}/cancel", post(routes_jobs::cancel_job))
        .route("/api/agents/online", get(routes_agents::online_agents))
        .route("/healthz", get(routes_health::healthz))
        .route("/metrics", get(handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

async fn handler_metrics(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.metrics.render(),
    )
}

/// Serve the gateway until ctrl-c / SIGTERM.
pub async fn run(port: u16, state: Arc<AppState>) -> Result<()> {
    let app = build_router(Arc::clone(&state));

    // Background sweep: refresh gauges and drop registry entries whose
    // connection died without an unregister.
    let sweep_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let (online, pruned) = {
                let mut registry = lock_or_recover(&sweep_state.registry);
                let pruned = registry.prune_stale(ONLINE_WINDOW_SECS * 2);
                (registry.online().len(), pruned)
            };
            if pruned > 0 {
                warn!(pruned, "pruned silent registry entries");
            }
            sweep_state.metrics.agents_online.set(online as i64);
            match sweep_state.queue.size().await {
                Ok(depth) => {
                    sweep_state.metrics.queue_depth.set(depth as i64);
                }
                Err(e) => warn!(error = %e, "queue depth probe failed"),
            }
        }
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("gateway shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
