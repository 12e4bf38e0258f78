use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;

/// Passive health verdict for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No traffic observed yet. Admitted like Healthy.
    Unknown,
    Healthy,
    Unhealthy,
}

/// A configured backend service.
#[derive(Debug, Clone)]
pub struct Backend {
    pub name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub retry: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Backend {
    pub fn from_config(name: &str, config: &BackendConfig) -> Self {
        Self {
            name: name.to_string(),
            // Trailing slash would double up when the outbound path is
            // appended.
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            retry: config.retry,
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
        }
    }
}

/// Mutable per-backend health state, one entry per backend name.
#[derive(Debug, Clone)]
struct BackendState {
    status: HealthStatus,
    consecutive_failures: u32,
    unhealthy_since: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    short_circuits: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

impl BackendState {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            unhealthy_since: None,
            total_requests: 0,
            total_failures: 0,
            short_circuits: 0,
            last_success: None,
            last_failure: None,
        }
    }
}

/// Point-in-time view of one backend's health, for the admin API and
/// for assertions in tests.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub base_url: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub short_circuits: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Backend registry plus passive health tracking.
///
/// The backend set is fixed at startup. Health state lives in a
/// `DashMap` keyed by backend name so request handlers update it with
/// per-entry locking only; there is no table-wide lock on the request
/// path.
pub struct UpstreamTable {
    backends: HashMap<String, Backend>,
    health: DashMap<String, BackendState>,
}

impl UpstreamTable {
    pub fn new(configs: &HashMap<String, BackendConfig>) -> Self {
        let backends: HashMap<String, Backend> = configs
            .iter()
            .map(|(name, config)| (name.clone(), Backend::from_config(name, config)))
            .collect();

        let health = DashMap::new();
        for name in backends.keys() {
            health.insert(name.clone(), BackendState::new());
        }

        info!("Initialized {} backends", backends.len());
        Self { backends, health }
    }

    pub fn get(&self, name: &str) -> Option<&Backend> {
        self.backends.get(name)
    }

    /// Whether a request may be forwarded to this backend right now.
    ///
    /// Unknown and Healthy backends are always admitted. An Unhealthy
    /// backend is admitted again once its cool-down has elapsed; the
    /// next outcome then decides whether it recovers or the cool-down
    /// restarts.
    pub fn is_admitted(&self, name: &str) -> bool {
        let Some(state) = self.health.get(name) else {
            return false;
        };

        match state.status {
            HealthStatus::Unknown | HealthStatus::Healthy => true,
            HealthStatus::Unhealthy => state
                .unhealthy_since
                .map(|since| since.elapsed() >= self.cooldown_of(name))
                .unwrap_or(true),
        }
    }

    /// Record a request that was refused without being forwarded.
    pub fn record_short_circuit(&self, name: &str) {
        if let Some(mut state) = self.health.get_mut(name) {
            state.short_circuits += 1;
        }
    }

    /// Record a successful forward (any HTTP response counts, whatever
    /// its status).
    pub fn record_success(&self, name: &str) {
        if let Some(mut state) = self.health.get_mut(name) {
            state.total_requests += 1;
            state.last_success = Some(Utc::now());

            if state.status == HealthStatus::Unhealthy {
                info!(backend = name, "Backend recovered");
            }
            state.status = HealthStatus::Healthy;
            state.consecutive_failures = 0;
            state.unhealthy_since = None;
        }
    }

    /// Record a connection failure or timeout against this backend.
    ///
    /// At `failure_threshold` consecutive failures the backend flips
    /// to Unhealthy and the cool-down starts. A failure while already
    /// Unhealthy (a failed re-probe) restarts the cool-down.
    pub fn record_failure(&self, name: &str) {
        let Some(backend) = self.backends.get(name) else {
            return;
        };

        if let Some(mut state) = self.health.get_mut(name) {
            state.total_requests += 1;
            state.total_failures += 1;
            state.consecutive_failures += 1;
            state.last_failure = Some(Utc::now());

            if state.status == HealthStatus::Unhealthy {
                debug!(backend = name, "Re-probe failed, restarting cool-down");
                state.unhealthy_since = Some(Instant::now());
            } else if state.consecutive_failures >= backend.failure_threshold {
                warn!(
                    backend = name,
                    failures = state.consecutive_failures,
                    cooldown_ms = backend.cooldown.as_millis() as u64,
                    "Backend marked unhealthy"
                );
                state.status = HealthStatus::Unhealthy;
                state.unhealthy_since = Some(Instant::now());
            } else {
                debug!(
                    backend = name,
                    failures = state.consecutive_failures,
                    threshold = backend.failure_threshold,
                    "Backend failure recorded"
                );
            }
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<BackendSnapshot> {
        let backend = self.backends.get(name)?;
        let state = self.health.get(name)?;
        Some(Self::to_snapshot(backend, &state))
    }

    pub fn snapshot_all(&self) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<BackendSnapshot> = self
            .backends
            .values()
            .filter_map(|backend| {
                self.health
                    .get(&backend.name)
                    .map(|state| Self::to_snapshot(backend, &state))
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    fn cooldown_of(&self, name: &str) -> Duration {
        self.backends
            .get(name)
            .map(|b| b.cooldown)
            .unwrap_or(Duration::ZERO)
    }

    fn to_snapshot(backend: &Backend, state: &BackendState) -> BackendSnapshot {
        BackendSnapshot {
            name: backend.name.clone(),
            base_url: backend.base_url.clone(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            short_circuits: state.short_circuits,
            last_success: state.last_success,
            last_failure: state.last_failure,
        }
    }
}
