// src/turn/dumper.rs
//! Diagnostic dump on fatal log signatures
//!
//! Debug-only. When enabled, a single WARN/ERROR message containing one of the
//! configured signatures dumps every client trace to the log and terminates the
//! process with status 1. Never enable this in production.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{error, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::trace::TraceRegistry;
use crate::config::DiagnosticsConfig;

/// How the process ends after a dump
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

/// Exits the process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Watches logged errors and dumps trace state on a signature match
pub struct DiagnosticDumper {
    enabled: bool,
    signatures: Vec<String>,
    traces: Arc<TraceRegistry>,
    terminator: Arc<dyn Terminator>,
    triggered: AtomicBool,
}

impl fmt::Debug for DiagnosticDumper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticDumper")
            .field("enabled", &self.enabled)
            .field("signatures", &self.signatures)
            .field("triggered", &self.triggered.load(Ordering::Relaxed))
            .finish()
    }
}

impl DiagnosticDumper {
    pub fn new(config: &DiagnosticsConfig, traces: Arc<TraceRegistry>, terminator: Arc<dyn Terminator>) -> Self {
        Self {
            enabled: config.terminate_on_signature,
            signatures: config
                .fatal_signatures
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            traces,
            terminator,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `message` would trigger a dump
    pub fn matches(&self, message: &str) -> bool {
        self.enabled && self.signatures.iter().any(|s| message.contains(s.as_str()))
    }

    /// Inspect a logged error. Returns true if it triggered the dump.
    ///
    /// Only the first match dumps; messages logged by the dump itself, or matches
    /// racing on other threads, are ignored.
    pub fn on_logged_error(&self, message: &str) -> bool {
        if !self.matches(message) {
            return false;
        }
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.dump(message);
        self.terminator.terminate(1);
        true
    }

    fn dump(&self, message: &str) {
        let dumps = self.traces.dump();
        error!(
            trigger = message,
            traced_clients = dumps.len(),
            "Fatal signature observed, dumping all client traces"
        );

        for dump in &dumps {
            let summary = &dump.summary;
            error!(
                client_addr = %summary.client_addr,
                username = %summary.username,
                total_steps = summary.total_steps,
                allocations = summary.allocations,
                permissions = summary.permissions,
                channels = summary.channels,
                session_duration = ?summary.session_duration,
                "Client trace"
            );
            for (index, step) in dump.steps.iter().enumerate() {
                error!(client_addr = %summary.client_addr, index, step = %step, "Trace step");
            }
            for (relay_addr, entry) in &dump.allocations {
                error!(
                    client_addr = %summary.client_addr,
                    relay_addr = %relay_addr,
                    created_at = %entry.created_at.format("%H:%M:%S%.3f"),
                    age = ?entry.age(),
                    "Allocation"
                );
            }
            for (peer, entry) in &dump.permissions {
                error!(
                    client_addr = %summary.client_addr,
                    peer_addr = %peer,
                    created_at = %entry.created_at.format("%H:%M:%S%.3f"),
                    age = ?entry.age(),
                    "Permission"
                );
            }
            for (peer, entry) in &dump.channels {
                error!(
                    client_addr = %summary.client_addr,
                    peer_addr = %peer,
                    channel_number = entry.channel_number,
                    created_at = %entry.created_at.format("%H:%M:%S%.3f"),
                    age = ?entry.age(),
                    "Channel"
                );
            }
            match serde_json::to_string(dump) {
                Ok(json) => error!(client_addr = %summary.client_addr, trace = %json, "Trace dump"),
                Err(e) => error!(client_addr = %summary.client_addr, "Failed to serialize trace: {}", e),
            }
        }
    }
}

/// `tracing` layer forwarding WARN and ERROR messages to the dumper
pub struct DumperLayer {
    dumper: Arc<DiagnosticDumper>,
}

impl DumperLayer {
    pub fn new(dumper: Arc<DiagnosticDumper>) -> Self {
        Self { dumper }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

impl<S: Subscriber> Layer<S> for DumperLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() > Level::WARN || !self.dumper.is_enabled() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let Some(message) = visitor.message else {
            return;
        };
        if !self.dumper.matches(&message) {
            return;
        }

        // Events emitted from inside a subscriber callback are dropped, so the dump
        // has to log from another thread.
        let dumper = self.dumper.clone();
        let _ = std::thread::spawn(move || dumper.on_logged_error(&message)).join();
    }
}
