// src/turn/trace.rs
//! Per-client diagnostic traces
//!
//! A trace is keyed by client transport address, not by session, because the
//! relay engine reports steps before any session exists. Traces are created on
//! first use and live until explicitly evicted. The step log is append-only and
//! unbounded.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

const STEP_TIME_FORMAT: &str = "%H:%M:%S%.3f";

/// One timestamped step in a client's history
#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub at: DateTime<Utc>,
    pub description: String,
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.format(STEP_TIME_FORMAT), self.description)
    }
}

/// Relay allocation seen for a client
#[derive(Debug, Clone, Serialize)]
pub struct AllocationEntry {
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    created: Instant,
}

/// Peer permission seen for a client
#[derive(Debug, Clone, Serialize)]
pub struct PermissionEntry {
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    created: Instant,
}

/// Channel binding seen for a client
#[derive(Debug, Clone, Serialize)]
pub struct ChannelEntry {
    pub channel_number: u16,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    created: Instant,
}

macro_rules! impl_age {
    ($($entry:ty),*) => {
        $(impl $entry {
            /// Time since the entry was recorded
            pub fn age(&self) -> Duration {
                self.created.elapsed()
            }
        })*
    };
}

impl_age!(AllocationEntry, PermissionEntry, ChannelEntry);

/// Diagnostic history of one client address
#[derive(Debug, Clone)]
pub struct ClientTrace {
    pub client_addr: SocketAddr,
    pub username: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub steps: Vec<TraceStep>,
    pub allocations: HashMap<SocketAddr, AllocationEntry>,
    pub permissions: HashMap<IpAddr, PermissionEntry>,
    pub channels: HashMap<SocketAddr, ChannelEntry>,
    started: Instant,
    last_activity_at: Instant,
}

impl ClientTrace {
    fn new(client_addr: SocketAddr, username: &str) -> Self {
        let now = Instant::now();
        let wall = Utc::now();
        Self {
            client_addr,
            username: username.to_string(),
            start_time: wall,
            last_activity: wall,
            steps: Vec::new(),
            allocations: HashMap::new(),
            permissions: HashMap::new(),
            channels: HashMap::new(),
            started: now,
            last_activity_at: now,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Instant::now();
        self.last_activity = Utc::now();
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity_at.elapsed()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            client_addr: self.client_addr,
            username: self.username.clone(),
            total_steps: self.steps.len(),
            allocations: self.allocations.len(),
            permissions: self.permissions.len(),
            channels: self.channels.len(),
            session_duration: self.duration(),
            idle_for: self.idle_for(),
        }
    }
}

/// Counts and durations describing one trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub client_addr: SocketAddr,
    pub username: String,
    pub total_steps: usize,
    pub allocations: usize,
    pub permissions: usize,
    pub channels: usize,
    pub session_duration: Duration,
    pub idle_for: Duration,
}

impl TraceSummary {
    /// Emit the summary as one structured log line
    pub fn log(&self, reason: &str) {
        info!(
            client_addr = %self.client_addr,
            username = %self.username,
            total_steps = self.total_steps,
            allocations = self.allocations,
            permissions = self.permissions,
            channels = self.channels,
            session_duration = ?self.session_duration,
            idle_for = ?self.idle_for,
            reason,
            "Session summary"
        );
    }
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} steps, {} allocations, {} permissions, {} channels over {:?}",
            self.client_addr,
            self.username,
            self.total_steps,
            self.allocations,
            self.permissions,
            self.channels,
            self.session_duration
        )
    }
}

/// Full copy of a trace taken for a diagnostic dump
#[derive(Debug, Clone, Serialize)]
pub struct TraceDump {
    pub summary: TraceSummary,
    pub steps: Vec<TraceStep>,
    pub allocations: Vec<(SocketAddr, AllocationEntry)>,
    pub permissions: Vec<(IpAddr, PermissionEntry)>,
    pub channels: Vec<(SocketAddr, ChannelEntry)>,
}

/// Registry of client traces behind a single reader/writer lock
#[derive(Debug, Default)]
pub struct TraceRegistry {
    traces: RwLock<HashMap<SocketAddr, ClientTrace>>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the trace for `client_addr`, creating it first if needed
    fn with_trace<R>(
        &self,
        client_addr: SocketAddr,
        username: &str,
        f: impl FnOnce(&mut ClientTrace) -> R,
    ) -> R {
        let mut traces = self.traces.write();
        let trace = traces.entry(client_addr).or_insert_with(|| {
            info!(
                client_addr = %client_addr,
                username,
                action = "NEW_SESSION",
                "New client trace started"
            );
            ClientTrace::new(client_addr, username)
        });
        if trace.username.is_empty() && !username.is_empty() {
            trace.username = username.to_string();
        }
        trace.touch();
        f(trace)
    }

    /// Append a step. Returns the step count after the append.
    pub fn record_step(&self, client_addr: SocketAddr, username: &str, description: &str) -> usize {
        let (total_steps, session_duration) = self.with_trace(client_addr, username, |trace| {
            trace.steps.push(TraceStep {
                at: Utc::now(),
                description: description.to_string(),
            });
            (trace.steps.len(), trace.duration())
        });

        info!(
            client_addr = %client_addr,
            username,
            step = description,
            total_steps,
            session_duration = ?session_duration,
            "Client step recorded"
        );
        total_steps
    }

    pub fn record_allocation(&self, client_addr: SocketAddr, relay_addr: SocketAddr) {
        self.with_trace(client_addr, "", |trace| {
            trace.allocations.insert(
                relay_addr,
                AllocationEntry {
                    created_at: Utc::now(),
                    created: Instant::now(),
                },
            );
        });
        info!(client_addr = %client_addr, relay_addr = %relay_addr, action = "ALLOCATION_CREATED", "Allocation recorded");
    }

    /// Record a permission. Returns false if one already existed for the peer.
    pub fn record_permission(&self, client_addr: SocketAddr, peer: IpAddr) -> bool {
        let created = self.with_trace(client_addr, "", |trace| {
            if trace.permissions.contains_key(&peer) {
                return false;
            }
            trace.permissions.insert(
                peer,
                PermissionEntry {
                    created_at: Utc::now(),
                    created: Instant::now(),
                },
            );
            true
        });
        if created {
            info!(client_addr = %client_addr, peer_addr = %peer, action = "PERMISSION_CREATED", "Permission recorded");
        }
        created
    }

    pub fn record_channel(&self, client_addr: SocketAddr, peer_addr: SocketAddr, channel_number: u16) {
        self.with_trace(client_addr, "", |trace| {
            trace.channels.insert(
                peer_addr,
                ChannelEntry {
                    channel_number,
                    created_at: Utc::now(),
                    created: Instant::now(),
                },
            );
        });
        info!(
            client_addr = %client_addr,
            peer_addr = %peer_addr,
            channel_number,
            action = "CHANNEL_CREATED",
            "Channel binding recorded"
        );
    }

    pub fn has_permission(&self, client_addr: SocketAddr, peer: IpAddr) -> bool {
        self.traces
            .read()
            .get(&client_addr)
            .map_or(false, |trace| trace.permissions.contains_key(&peer))
    }

    pub fn summarize(&self, client_addr: SocketAddr) -> Option<TraceSummary> {
        self.traces.read().get(&client_addr).map(ClientTrace::summary)
    }

    /// Summaries of every trace together with its most recent `recent` steps
    pub fn summaries(&self, recent: usize) -> Vec<(TraceSummary, Vec<TraceStep>)> {
        self.traces
            .read()
            .values()
            .map(|trace| {
                let skip = trace.steps.len().saturating_sub(recent);
                (trace.summary(), trace.steps[skip..].to_vec())
            })
            .collect()
    }

    /// Copy of a single trace
    pub fn get(&self, client_addr: SocketAddr) -> Option<ClientTrace> {
        self.traces.read().get(&client_addr).cloned()
    }

    /// Copy of every trace for a diagnostic dump
    pub fn dump(&self) -> Vec<TraceDump> {
        self.traces
            .read()
            .values()
            .map(|trace| TraceDump {
                summary: trace.summary(),
                steps: trace.steps.clone(),
                allocations: trace.allocations.iter().map(|(k, v)| (*k, v.clone())).collect(),
                permissions: trace.permissions.iter().map(|(k, v)| (*k, v.clone())).collect(),
                channels: trace.channels.iter().map(|(k, v)| (*k, v.clone())).collect(),
            })
            .collect()
    }

    pub fn evict(&self, client_addr: SocketAddr) -> Option<ClientTrace> {
        self.traces.write().remove(&client_addr)
    }

    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.read().is_empty()
    }
}
