// src/turn/models.rs
//! Value objects shared between the credential store, the registries and the
//! dashboard surface

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User record owned by the credential store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,

    /// Hex-encoded long-term credential key, never serialized outward
    #[serde(skip_serializing, default)]
    pub auth_key: String,

    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<UserQuota>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
}

/// Per-user usage limits.
///
/// `current_sessions` is maintained by the store; the gate only reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserQuota {
    pub max_sessions: u32,
    /// Bytes per second
    pub max_bandwidth: u64,
    /// Seconds
    pub max_duration: u64,
    pub current_sessions: u32,
    pub used_bandwidth: u64,
    pub reset_at: Option<DateTime<Utc>>,
}

impl UserQuota {
    /// Quota that only caps concurrent sessions
    pub fn sessions(max_sessions: u32, current_sessions: u32) -> Self {
        Self {
            max_sessions,
            current_sessions,
            ..Default::default()
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_sessions >= self.max_sessions
    }
}

impl User {
    /// New enabled user with the given hex key
    pub fn new(username: impl Into<String>, auth_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            auth_key: auth_key.into(),
            enabled: true,
            quota: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            last_login: None,
        }
    }

    pub fn with_quota(mut self, quota: UserQuota) -> Self {
        self.quota = Some(quota);
        self
    }
}

/// One authenticated client allocation
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub client_addr: SocketAddr,
    pub relay_addr: Option<SocketAddr>,
    pub start_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,

    /// Monotonic clock reading used for idle computation
    #[serde(skip)]
    pub(crate) last_active_at: Instant,
}

impl Session {
    pub(crate) fn new(id: String, username: &str, client_addr: SocketAddr, now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            id,
            username: username.to_string(),
            client_addr,
            relay_addr: None,
            start_time: wall,
            last_active: wall,
            bytes_sent: 0,
            bytes_recv: 0,
            packets_sent: 0,
            packets_recv: 0,
            last_active_at: now,
        }
    }

    pub(crate) fn refresh(&mut self, now: Instant) {
        self.last_active_at = now;
        self.last_active = Utc::now();
    }

    /// Monotonic time of the last registry event for this session
    pub fn last_active_instant(&self) -> Instant {
        self.last_active_at
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_recv)
    }

    pub fn packets_transferred(&self) -> u64 {
        self.packets_sent.saturating_add(self.packets_recv)
    }
}

/// Traffic counters reported by the relay engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

/// Operational snapshot for the health/metrics surface
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub status: &'static str,
    pub realm: String,
    pub policy: &'static str,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub traced_clients: usize,
    pub bytes_transferred: u64,
    pub packets_transferred: u64,
    pub auth_requests: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub quota_rejections: u64,
    pub sessions_evicted: u64,
    pub permissions_auto_granted: u64,
    pub permissions_denied: u64,
    pub last_login_failures: u64,
    pub last_login_dropped: u64,
}
