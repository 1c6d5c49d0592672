//! # Skybridge — Cloud-to-Edge Compute Dispatch Bridge
//!
//! A central gateway accepts job submissions over HTTP, holds persistent
//! outbound-initiated WebSocket connections from worker agents behind NAT,
//! and dispatches each job to exactly one eligible agent. Large payloads
//! flow out-of-band through an object store via short-lived signed URLs;
//! only metadata crosses the gateway.
//!
//! ## Architecture
//!
//! ```text
//! Client ──── POST /api/jobs ───→ Gateway ── create ──→ Job Store (PENDING)
//!                                    │      └ enqueue → Pending Queue
//! Agent  ←─── WebSocket duplex ───→ │
//!   │     RequestJob ────────────→  Dispatcher ── signs URLs, commits
//!   │     ←─────────── JobAssigned  │             assignment (compensating)
//!   │     JobStatus ─────────────→  Reconciler ── drives state machine,
//!   │                                             releases capacity
//!   └── GET/PUT signed URLs ─────→ Object store (out-of-band)
//! ```
//!
//! ## Module Map
//!
//! - [`protocol`] — tagged-union control envelope shared by both sides
//! - [`registry`] — in-memory view of connected agents and their capacity
//! - [`queue`] — FIFO of job ids awaiting assignment (memory or Redis)
//! - [`store`] — durable job records and the status state machine
//! - [`signer`] — short-lived signed-URL generation for payload transport
//! - [`gateway`] — HTTP API, duplex connection handling, dispatch, reconcile
//! - [`agent`] — worker-side runner: pull loop, executors, input cache
//! - [`sanitize`] — UTF-8 sanitization and bounded output truncation
//! - [`prom_metrics`] — Prometheus exposition for the gateway

pub mod agent;
pub mod gateway;
pub mod prom_metrics;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod sanitize;
pub mod signer;
pub mod store;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Redact the query string of a URL for logging.
///
/// Signed URLs carry their authorization in query parameters; anything past
/// `?` must never reach a log line.
pub fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?[redacted]", base),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_url_strips_query() {
        let url = "https://store.example/bucket/key?sb-expires=123&sb-signature=abc";
        assert_eq!(redact_url(url), "https://store.example/bucket/key?[redacted]");
    }

    #[test]
    fn redact_url_without_query_unchanged() {
        assert_eq!(redact_url("https://store.example/b/k"), "https://store.example/b/k");
    }

    #[test]
    fn now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
