//! # Prometheus Metrics — Gateway Exposition
//!
//! Operational metrics in the Prometheus text exposition format, scraped
//! from `GET /metrics` on the gateway.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `skybridge_agents_online` | Gauge | — | Agents passing the liveness filter |
//! | `skybridge_queue_depth` | Gauge | — | Pending-queue length |
//! | `skybridge_jobs_dispatched_total` | Counter | — | JobAssigned frames committed |
//! | `skybridge_jobs_terminal_total` | Counter | `status` | Jobs reaching a terminal status |
//! | `skybridge_frames_discarded_total` | Counter | `reason` | Control frames dropped |
//!
//! Gauges refresh from the gateway's 30-second background sweep; counters
//! update inline in the dispatcher and reconciler.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabel {
    pub reason: String,
}

/// Thread-safe metrics registry for the gateway. All metric types are
/// internally atomic and safe to update from any task.
pub struct Metrics {
    pub registry: Registry,
    pub agents_online: Gauge,
    pub queue_depth: Gauge,
    pub jobs_dispatched: Counter,
    pub jobs_terminal: Family<StatusLabel, Counter>,
    pub frames_discarded: Family<ReasonLabel, Counter>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("skybridge");
        let agents_online = Gauge::default();
        registry.register(
            "agents_online",
            "Agents currently passing the liveness filter",
            agents_online.clone(),
        );
        let queue_depth = Gauge::default();
        registry.register(
            "queue_depth",
            "Jobs waiting in the pending queue",
            queue_depth.clone(),
        );
        let jobs_dispatched = Counter::default();
        registry.register(
            "jobs_dispatched",
            "JobAssigned frames committed to agents",
            jobs_dispatched.clone(),
        );
        let jobs_terminal = Family::<StatusLabel, Counter>::default();
        registry.register(
            "jobs_terminal",
            "Jobs that reached a terminal status",
            jobs_terminal.clone(),
        );
        let frames_discarded = Family::<ReasonLabel, Counter>::default();
        registry.register(
            "frames_discarded",
            "Control frames dropped by the gateway",
            frames_discarded.clone(),
        );
        Metrics {
            registry,
            agents_online,
            queue_depth,
            jobs_dispatched,
            jobs_terminal,
            frames_discarded,
        }
    }

    pub fn record_terminal(&self, status: &str) {
        self.jobs_terminal
            .get_or_create(&StatusLabel {
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_discard(&self, reason: &str) {
        self.frames_discarded
            .get_or_create(&ReasonLabel {
                reason: reason.to_string(),
            })
            .inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        // Encoding only fails on a formatter error, which String never produces.
        let _ = encode(&mut buf, &self.registry);
        buf
    }
}
