//! # Registry — In-Memory Agent Capacity View
//!
//! Tracks connected agents and their capacity facts. Agents register over
//! the duplex connection and heartbeat every 20 seconds; an agent whose
//! last heartbeat is older than [`ONLINE_WINDOW_SECS`] is treated as
//! offline by every read path even if its connection lingers.
//!
//! ## Data Flow
//!
//! ```text
//! Agent ── register ───→ Registry::register()
//! Agent ── heartbeat ──→ Registry::update_heartbeat()
//! Dispatcher ──────────→ Registry::get() admission + increment_running()
//! Reconciler ──────────→ Registry::release_running() on terminal reports
//! API ─────────────────→ Registry::online() snapshot
//! Disconnect ──────────→ Registry::unregister()
//! ```
//!
//! ## Capacity accounting
//!
//! `running_jobs` is the gateway-tracked count: incremented exactly once
//! per committed assignment, decremented exactly once per observed
//! terminal report, clamped at zero. The heartbeat-carried count is kept
//! alongside as `reported_running` — a sanity signal only; divergence is
//! logged, never trusted for admission.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;

/// Heartbeats older than this mark an agent offline.
pub const ONLINE_WINDOW_SECS: u64 = 60;

#[derive(Clone, Serialize)]
pub struct AgentEntry {
    pub agent_id: String,
    pub hostname: String,
    pub max_concurrency: u32,
    pub paused: bool,
    /// Gateway-tracked running count, authoritative for admission.
    pub running_jobs: u32,
    /// Last heartbeat-carried running count (sanity signal).
    pub reported_running: u32,
    pub uptime_secs: u64,
    pub last_heartbeat_secs_ago: u64,
    #[serde(skip)]
    pub last_heartbeat: Instant,
    #[serde(skip)]
    pub connected_at: Instant,
}

impl AgentEntry {
    fn snapshot(&self, now: Instant) -> AgentEntry {
        let mut e = self.clone();
        e.uptime_secs = now.duration_since(self.connected_at).as_secs();
        e.last_heartbeat_secs_ago = now.duration_since(self.last_heartbeat).as_secs();
        e
    }

    fn is_online(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat).as_secs() < ONLINE_WINDOW_SECS
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry::default()
    }

    /// Upsert an agent on successful registration. Registration counts as a
    /// heartbeat so the agent is immediately online.
    pub fn register(&mut self, agent_id: String, hostname: String, max_concurrency: u32) {
        let now = Instant::now();
        self.agents.insert(
            agent_id.clone(),
            AgentEntry {
                agent_id,
                hostname,
                max_concurrency: max_concurrency.max(1),
                paused: false,
                running_jobs: 0,
                reported_running: 0,
                uptime_secs: 0,
                last_heartbeat_secs_ago: 0,
                last_heartbeat: now,
                connected_at: now,
            },
        );
    }

    /// Process a heartbeat. Returns false for unknown agents.
    pub fn update_heartbeat(&mut self, agent_id: &str, paused: bool, running_jobs: u32) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(entry) => {
                entry.paused = paused;
                entry.reported_running = running_jobs;
                entry.last_heartbeat = Instant::now();
                if running_jobs != entry.running_jobs {
                    warn!(
                        agent_id,
                        tracked = entry.running_jobs,
                        reported = running_jobs,
                        "heartbeat running_jobs diverges from tracked count"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Remove an agent on disconnect.
    pub fn unregister(&mut self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    /// Look up an agent, reporting absent when its liveness window lapsed.
    pub fn get(&self, agent_id: &str) -> Option<AgentEntry> {
        let now = Instant::now();
        self.agents
            .get(agent_id)
            .filter(|e| e.is_online(now))
            .map(|e| e.snapshot(now))
    }

    /// Snapshot of all agents passing the liveness filter.
    pub fn online(&self) -> Vec<AgentEntry> {
        let now = Instant::now();
        self.agents
            .values()
            .filter(|e| e.is_online(now))
            .map(|e| e.snapshot(now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Record a committed assignment. Returns false for unknown agents.
    pub fn increment_running(&mut self, agent_id: &str) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(entry) => {
                entry.running_jobs = entry.running_jobs.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Release one unit of capacity on a terminal report, clamped at zero.
    pub fn release_running(&mut self, agent_id: &str) {
        if let Some(entry) = self.agents.get_mut(agent_id) {
            if entry.running_jobs == 0 {
                warn!(agent_id, "capacity release with no tracked running jobs");
            }
            entry.running_jobs = entry.running_jobs.saturating_sub(1);
        }
    }

    /// Drop entries whose last heartbeat is older than `timeout_secs`.
    /// Connections normally unregister on close; this sweeps the rest.
    pub fn prune_stale(&mut self, timeout_secs: u64) -> usize {
        let now = Instant::now();
        let before = self.agents.len();
        self.agents
            .retain(|_, e| now.duration_since(e.last_heartbeat).as_secs() < timeout_secs);
        before - self.agents.len()
    }
}
