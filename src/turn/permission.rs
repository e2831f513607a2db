// src/turn/permission.rs
//! Peer permission policies
//!
//! The gate asks a `PermissionPolicy` whether a client may relay to a peer. The
//! policy is swapped by configuration; the registries and reaper never see which
//! one is installed.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, warn};

use super::metrics::MetricsCollector;
use super::trace::TraceRegistry;
use crate::config::PolicyMode;

/// Outcome of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// The client already holds a permission for the peer
    Existing,
    /// First grant for the pair, issued without a CreatePermission from the client
    AutoGranted,
    Denied,
}

impl PermissionDecision {
    pub fn allowed(self) -> bool {
        !matches!(self, Self::Denied)
    }

    /// Reason string used in logs
    pub fn reason(self) -> &'static str {
        match self {
            Self::Existing => "existing_permission",
            Self::AutoGranted => "auto_grant_debug_mode",
            Self::Denied => "no_permission",
        }
    }
}

/// Strategy deciding peer permissions
pub trait PermissionPolicy: Send + Sync {
    fn check(&self, client_addr: SocketAddr, peer: IpAddr, traces: &TraceRegistry) -> PermissionDecision;

    /// Name reported in stats
    fn name(&self) -> &'static str;
}

/// Allow only peers the engine reported a permission for
#[derive(Debug, Clone, Default)]
pub struct StrictPolicy {
    metrics: Arc<MetricsCollector>,
}

impl StrictPolicy {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }
}

impl PermissionPolicy for StrictPolicy {
    fn check(&self, client_addr: SocketAddr, peer: IpAddr, traces: &TraceRegistry) -> PermissionDecision {
        if traces.has_permission(client_addr, peer) {
            return PermissionDecision::Existing;
        }
        MetricsCollector::incr(&self.metrics.permissions_denied);
        debug!(client_addr = %client_addr, peer_addr = %peer, "Permission denied");
        PermissionDecision::Denied
    }

    fn name(&self) -> &'static str {
        "strict"
    }
}

/// Grant every peer, recording and warning on the first grant of each pair.
///
/// This departs from allow-list semantics and is meant for diagnosing clients that
/// send data before creating permissions. Existing permissions are read from the
/// client's trace, so a trace evicted by the reaper starts over.
#[derive(Debug, Default)]
pub struct PermissivePolicy {
    metrics: Arc<MetricsCollector>,
}

impl PermissivePolicy {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }
}

impl PermissionPolicy for PermissivePolicy {
    fn check(&self, client_addr: SocketAddr, peer: IpAddr, traces: &TraceRegistry) -> PermissionDecision {
        if traces.has_permission(client_addr, peer) {
            return PermissionDecision::Existing;
        }

        // Only the caller whose record creates the entry warns
        if !traces.record_permission(client_addr, peer) {
            return PermissionDecision::Existing;
        }

        MetricsCollector::incr(&self.metrics.permissions_auto_granted);
        warn!(
            client_addr = %client_addr,
            peer_addr = %peer,
            action = "AUTO-CREATED PERMISSION (NON-STANDARD)",
            "Permission auto-granted, non-standard"
        );
        PermissionDecision::AutoGranted
    }

    fn name(&self) -> &'static str {
        "permissive"
    }
}

/// Build the policy selected by configuration
pub fn policy_for(mode: PolicyMode, metrics: Arc<MetricsCollector>) -> Arc<dyn PermissionPolicy> {
    match mode {
        PolicyMode::Strict => Arc::new(StrictPolicy::new(metrics)),
        PolicyMode::Permissive => Arc::new(PermissivePolicy::new(metrics)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn client() -> SocketAddr {
        "10.0.0.5:4000".parse().unwrap()
    }

    fn peer() -> IpAddr {
        "8.8.8.8".parse().unwrap()
    }

    #[test]
    fn test_permissive_grants_once() {
        let metrics = Arc::new(MetricsCollector::default());
        let policy = PermissivePolicy::new(metrics.clone());
        let traces = TraceRegistry::new();

        assert_eq!(policy.check(client(), peer(), &traces), PermissionDecision::AutoGranted);
        assert_eq!(policy.check(client(), peer(), &traces), PermissionDecision::Existing);
        assert_eq!(MetricsCollector::get(&metrics.permissions_auto_granted), 1);
        assert!(traces.has_permission(client(), peer()));
        assert_eq!(traces.summarize(client()).unwrap().permissions, 1);
    }

    #[test]
    fn test_permissive_concurrent_single_grant() {
        let metrics = Arc::new(MetricsCollector::default());
        let policy = Arc::new(PermissivePolicy::new(metrics.clone()));
        let traces = Arc::new(TraceRegistry::new());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let policy = policy.clone();
                let traces = traces.clone();
                thread::spawn(move || policy.check(client(), peer(), &traces))
            })
            .collect();
        let decisions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(decisions.iter().all(|d| d.allowed()));
        assert_eq!(
            decisions.iter().filter(|d| **d == PermissionDecision::AutoGranted).count(),
            1
        );
        assert_eq!(MetricsCollector::get(&metrics.permissions_auto_granted), 1);
        assert_eq!(traces.summarize(client()).unwrap().permissions, 1);
    }

    #[test]
    fn test_permissive_grants_again_after_trace_eviction() {
        let metrics = Arc::new(MetricsCollector::default());
        let policy = PermissivePolicy::new(metrics.clone());
        let traces = TraceRegistry::new();

        assert_eq!(policy.check(client(), peer(), &traces), PermissionDecision::AutoGranted);
        traces.evict(client());

        assert_eq!(policy.check(client(), peer(), &traces), PermissionDecision::AutoGranted);
        assert!(traces.has_permission(client(), peer()));
        assert_eq!(traces.summarize(client()).unwrap().permissions, 1);
        assert_eq!(MetricsCollector::get(&metrics.permissions_auto_granted), 2);
    }

    #[test]
    fn test_strict_requires_existing_permission() {
        let metrics = Arc::new(MetricsCollector::default());
        let policy = StrictPolicy::new(metrics.clone());
        let traces = TraceRegistry::new();

        assert_eq!(policy.check(client(), peer(), &traces), PermissionDecision::Denied);
        traces.record_permission(client(), peer());
        assert_eq!(policy.check(client(), peer(), &traces), PermissionDecision::Existing);
        assert_eq!(MetricsCollector::get(&metrics.permissions_denied), 1);
    }

    #[test]
    fn test_policy_for_mode() {
        let metrics = Arc::new(MetricsCollector::default());
        assert_eq!(policy_for(PolicyMode::Strict, metrics.clone()).name(), "strict");
        assert_eq!(policy_for(PolicyMode::Permissive, metrics).name(), "permissive");
        assert_eq!(PermissionDecision::Existing.reason(), "existing_permission");
    }
}
