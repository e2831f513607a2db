// src/turn/mod.rs
//! Authenticated session lifecycle tracking for a TURN relay.
//!
//! The relay engine owns the wire protocol and calls into [`TurnGate`] for
//! authentication and permission decisions and to report allocation events.

pub mod credential_store;
pub mod dumper;
pub mod gate;
pub mod last_login;
pub mod metrics;
pub mod models;
pub mod permission;
pub mod reaper;
pub mod session_registry;
pub mod trace;
pub mod verifier;

pub use credential_store::{generate_auth_key, AuthRecord, CredentialStore, MemoryCredentialStore};
pub use dumper::{DiagnosticDumper, DumperLayer, ProcessExit, Terminator};
pub use gate::{TurnGate, TurnGateBuilder};
pub use metrics::MetricsCollector;
pub use models::{GateStats, Session, TrafficDelta, User, UserQuota};
pub use permission::{PermissionDecision, PermissionPolicy, PermissivePolicy, StrictPolicy};
pub use reaper::{BackgroundTask, IdleReaper, SummaryReporter};
pub use session_registry::SessionRegistry;
pub use trace::{ClientTrace, TraceRegistry, TraceSummary};
pub use verifier::{CredentialVerifier, VerifiedCredential};
