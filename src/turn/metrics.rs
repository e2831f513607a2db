// src/turn/metrics.rs
//! Counters for the gate, read by `TurnGate::get_stats`

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by every gate component
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// Authentication metrics
    pub auth_requests: AtomicU64,
    pub auth_successes: AtomicU64,
    pub auth_failures: AtomicU64,
    pub quota_rejections: AtomicU64,
    pub store_unavailable: AtomicU64,

    /// Session metrics
    pub sessions_opened: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub reaper_scans: AtomicU64,

    /// Permission metrics
    pub permission_checks: AtomicU64,
    pub permissions_auto_granted: AtomicU64,
    pub permissions_denied: AtomicU64,

    /// Best-effort last-login writes
    pub last_login_written: AtomicU64,
    pub last_login_failures: AtomicU64,
    pub last_login_dropped: AtomicU64,
}

impl MetricsCollector {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
