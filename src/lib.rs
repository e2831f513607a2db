//! SHARP TURN gate (lib.rs)
//!
//! Control plane for a TURN relay: credential and quota checks, live session and
//! per-client trace registries, idle session reaping, peer permission policy and an
//! opt-in diagnostic dump on fatal engine errors.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod turn;

use std::sync::Arc;

pub use config::{GateConfig, LogFormat, PolicyMode};
pub use error::{AuthError, GateError, GateResult, SessionError, StoreError};
pub use turn::{
    generate_auth_key, CredentialStore, DiagnosticDumper, GateStats, MemoryCredentialStore, Session,
    TurnGate, User, UserQuota,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
///
/// # Arguments
/// * `level` - Filter directive used when `RUST_LOG` is unset
/// * `format` - Text or JSON lines
/// * `dumper` - When given, WARN and ERROR events are forwarded to it
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str, format: LogFormat, dumper: Option<Arc<DiagnosticDumper>>) -> GateResult<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let filter = match "tokio=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(dumper.map(turn::DumperLayer::new))
        .try_init()
        .map_err(|e| GateError::InvalidState(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_logging_twice_fails() {
        // Another test may already own the global subscriber
        let _ = init_logging("debug", LogFormat::Text, None);
        assert!(init_logging("debug", LogFormat::Json, None).is_err());
    }
}
