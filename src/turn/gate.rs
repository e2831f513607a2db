// src/turn/gate.rs
//! TURN gate facade
//!
//! `TurnGate` is what the relay engine talks to: authentication and permission
//! decisions on its hot path, plus event sinks for allocations, permissions,
//! channels and free-form steps. The dashboard reads sessions and stats from it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::credential_store::CredentialStore;
use super::dumper::{DiagnosticDumper, ProcessExit, Terminator};
use super::last_login::LastLoginQueue;
use super::metrics::MetricsCollector;
use super::models::{GateStats, Session, TrafficDelta};
use super::permission::{policy_for, PermissionDecision, PermissionPolicy};
use super::reaper::{BackgroundTask, IdleReaper, SummaryReporter};
use super::session_registry::SessionRegistry;
use super::trace::{TraceRegistry, TraceSummary};
use super::verifier::CredentialVerifier;
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};

/// Builder for [`TurnGate`]
pub struct TurnGateBuilder {
    config: GateConfig,
    store: Option<Arc<dyn CredentialStore>>,
    policy: Option<Arc<dyn PermissionPolicy>>,
    terminator: Option<Arc<dyn Terminator>>,
}

impl TurnGateBuilder {
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the policy selected by `permissions.mode`
    pub fn policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override process exit after a diagnostic dump
    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Build the gate. Must be called inside a tokio runtime.
    pub fn build(self) -> GateResult<TurnGate> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| GateError::Configuration("a credential store is required".into()))?;

        let config = self.config;
        let metrics = Arc::new(MetricsCollector::default());
        let sessions = Arc::new(SessionRegistry::new());
        let traces = Arc::new(TraceRegistry::new());

        let last_login = Arc::new(LastLoginQueue::spawn(
            store.clone(),
            config.verifier.last_login_queue_capacity,
            config.verifier.last_login_max_in_flight,
            config.verifier.last_login_timeout(),
            metrics.clone(),
        ));
        let verifier = CredentialVerifier::new(
            store,
            traces.clone(),
            last_login.clone(),
            metrics.clone(),
            config.verifier.lookup_timeout(),
        );
        let policy = self
            .policy
            .unwrap_or_else(|| policy_for(config.permissions.mode, metrics.clone()));
        let terminator = self
            .terminator
            .unwrap_or_else(|| Arc::new(ProcessExit) as Arc<dyn Terminator>);
        let dumper = Arc::new(DiagnosticDumper::new(&config.diagnostics, traces.clone(), terminator));
        let reaper = Arc::new(IdleReaper::new(
            sessions.clone(),
            traces.clone(),
            metrics.clone(),
            config.reaper.idle_threshold(),
            config.reaper.evict_traces,
        ));

        debug!(realm = %config.realm, policy = policy.name(), "TURN gate built");

        Ok(TurnGate {
            config,
            verifier,
            sessions,
            traces,
            policy,
            dumper,
            reaper,
            last_login,
            metrics,
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }
}

/// Session lifecycle tracker exposed to the relay engine
pub struct TurnGate {
    config: GateConfig,
    verifier: CredentialVerifier,
    sessions: Arc<SessionRegistry>,
    traces: Arc<TraceRegistry>,
    policy: Arc<dyn PermissionPolicy>,
    dumper: Arc<DiagnosticDumper>,
    reaper: Arc<IdleReaper>,
    last_login: Arc<LastLoginQueue>,
    metrics: Arc<MetricsCollector>,
    tasks: Mutex<Vec<BackgroundTask>>,
    started_at: Instant,
}

impl TurnGate {
    pub fn builder(config: GateConfig) -> TurnGateBuilder {
        TurnGateBuilder {
            config,
            store: None,
            policy: None,
            terminator: None,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn traces(&self) -> &Arc<TraceRegistry> {
        &self.traces
    }

    pub fn reaper(&self) -> &Arc<IdleReaper> {
        &self.reaper
    }

    /// Dumper to hand to `init_logging` so engine logs reach it
    pub fn dumper(&self) -> Arc<DiagnosticDumper> {
        self.dumper.clone()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Authentication callback. Returns the long-term key on success, `None` to refuse.
    ///
    /// A realm other than the configured one is refused before the store is consulted.
    #[instrument(skip(self))]
    pub async fn authenticate(&self, username: &str, realm: &str, client_addr: SocketAddr) -> Option<Vec<u8>> {
        if realm != self.config.realm {
            MetricsCollector::incr(&self.metrics.auth_requests);
            MetricsCollector::incr(&self.metrics.auth_failures);
            self.traces
                .record_step(client_addr, username, &format!("AUTHENTICATION_FAILED: unknown realm {}", realm));
            warn!(username, realm, "Authentication refused for foreign realm");
            return None;
        }

        let credential = self.verifier.verify(username, client_addr).await.ok()?;
        let session_id = self.sessions.open(&credential.user.username, client_addr);
        MetricsCollector::incr(&self.metrics.sessions_opened);
        self.traces
            .record_step(client_addr, username, &format!("SESSION_CREATED: {}", session_id));
        Some(credential.key)
    }

    /// Permission callback on the relay hot path
    pub fn check_permission(&self, client_addr: SocketAddr, peer: IpAddr) -> bool {
        let decision = self.permission_decision(client_addr, peer);
        debug!(
            client_addr = %client_addr,
            peer_addr = %peer,
            reason = decision.reason(),
            "Permission check"
        );
        decision.allowed()
    }

    /// Same as [`check_permission`](Self::check_permission) but returns the full decision
    pub fn permission_decision(&self, client_addr: SocketAddr, peer: IpAddr) -> PermissionDecision {
        MetricsCollector::incr(&self.metrics.permission_checks);
        self.traces
            .record_step(client_addr, "", &format!("PERMISSION_CHECK: {}", peer));
        self.sessions.touch_client(client_addr);
        self.policy.check(client_addr, peer, &self.traces)
    }

    pub fn on_allocation_created(&self, client_addr: SocketAddr, relay_addr: SocketAddr) {
        self.traces.record_allocation(client_addr, relay_addr);
        self.sessions.assign_relay(client_addr, relay_addr);
    }

    pub fn on_permission_created(&self, client_addr: SocketAddr, peer: IpAddr) {
        self.traces.record_permission(client_addr, peer);
        self.sessions.touch_client(client_addr);
    }

    pub fn on_channel_created(&self, client_addr: SocketAddr, peer_addr: SocketAddr, channel_number: u16) {
        self.traces.record_channel(client_addr, peer_addr, channel_number);
        self.sessions.touch_client(client_addr);
    }

    /// Free-form step reported by the engine
    pub fn on_step(&self, client_addr: SocketAddr, username: &str, description: &str) {
        self.traces.record_step(client_addr, username, description);
        self.sessions.touch_client(client_addr);
    }

    pub fn on_traffic(&self, client_addr: SocketAddr, delta: TrafficDelta) {
        if !self.sessions.record_traffic(client_addr, delta) {
            debug!(client_addr = %client_addr, "Traffic for client without a session");
        }
    }

    /// Error or warning logged by the relay engine.
    ///
    /// Returns true if the message triggered the diagnostic dump.
    pub fn on_engine_log(&self, message: &str) -> bool {
        if self.dumper.on_logged_error(message) {
            return true;
        }
        warn!(source = "relay_engine", "{}", message);
        false
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.list()
    }

    pub fn summarize(&self, client_addr: SocketAddr) -> Option<TraceSummary> {
        self.traces.summarize(client_addr)
    }

    pub fn get_stats(&self) -> GateStats {
        let sessions = self.sessions.list();
        let m = &self.metrics;
        GateStats {
            status: "healthy",
            realm: self.config.realm.clone(),
            policy: self.policy.name(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_sessions: sessions.len(),
            total_sessions: self.sessions.total_opened(),
            traced_clients: self.traces.len(),
            bytes_transferred: sessions
                .iter()
                .fold(0u64, |acc, s| acc.saturating_add(s.bytes_transferred())),
            packets_transferred: sessions
                .iter()
                .fold(0u64, |acc, s| acc.saturating_add(s.packets_transferred())),
            auth_requests: MetricsCollector::get(&m.auth_requests),
            auth_successes: MetricsCollector::get(&m.auth_successes),
            auth_failures: MetricsCollector::get(&m.auth_failures),
            quota_rejections: MetricsCollector::get(&m.quota_rejections),
            sessions_evicted: MetricsCollector::get(&m.sessions_evicted),
            permissions_auto_granted: MetricsCollector::get(&m.permissions_auto_granted),
            permissions_denied: MetricsCollector::get(&m.permissions_denied),
            last_login_failures: MetricsCollector::get(&m.last_login_failures),
            last_login_dropped: MetricsCollector::get(&m.last_login_dropped),
        }
    }

    /// Start the idle reaper and, if configured, the summary reporter.
    ///
    /// Call after logging is initialized; the startup configuration is logged here.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("TURN gate background tasks already running");
            return;
        }

        if self.dumper.is_enabled() {
            warn!("Diagnostic dumper enabled: a matching error will dump all traces and exit the process");
        }
        info!(
            realm = %self.config.realm,
            policy = self.policy.name(),
            idle_threshold = ?self.config.reaper.idle_threshold(),
            "TURN gate initialized"
        );

        tasks.push(self.reaper.clone().spawn(self.config.reaper.interval()));
        if let Some(period) = self.config.reaper.summary_interval() {
            let reporter = Arc::new(SummaryReporter::new(self.traces.clone()));
            tasks.push(reporter.spawn(period));
        }
        info!(tasks = tasks.len(), "TURN gate background tasks started");
    }

    /// Stop background tasks, letting in-flight ticks finish, then the last-login worker
    pub async fn shutdown(&self) {
        let tasks: Vec<BackgroundTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let name = task.name();
            task.stop().await;
            debug!(task = name, "Stopped");
        }
        self.last_login.shutdown().await;
        info!(
            active_sessions = self.sessions.len(),
            traced_clients = self.traces.len(),
            "TURN gate shut down"
        );
    }
}
