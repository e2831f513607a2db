// src/config.rs
//! Gate configuration
//!
//! Loaded from a JSON document; every field has a default so a partial file (or
//! `{}`) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Default signature of the engine error that triggers a diagnostic dump
pub const DEFAULT_FATAL_SIGNATURE: &str = "No Permission or Channel exists";

/// Top level gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Realm for long-term credentials
    pub realm: String,

    /// Credential verifier settings
    pub verifier: VerifierConfig,

    /// Idle reaper and summary reporter settings
    pub reaper: ReaperConfig,

    /// Peer permission policy
    pub permissions: PermissionConfig,

    /// Diagnostic dump on fatal log signatures
    pub diagnostics: DiagnosticsConfig,

    /// Logging
    pub logging: LoggingConfig,
}

/// Credential verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Upper bound on a credential store lookup
    pub lookup_timeout_ms: u64,

    /// Pending last-login writes kept before new ones are dropped
    pub last_login_queue_capacity: usize,

    /// Concurrent last-login writes
    pub last_login_max_in_flight: usize,

    /// Upper bound on a single last-login write
    pub last_login_timeout_ms: u64,
}

/// Idle reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Scan period
    pub interval_secs: u64,

    /// Sessions idle longer than this are evicted
    pub idle_threshold_secs: u64,

    /// Period of the active session summary log, 0 disables it
    pub summary_interval_secs: u64,

    /// Drop a client's trace once its last session is evicted
    pub evict_traces: bool,
}

/// Which permission strategy the gate installs
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Deny unless the engine reported a CreatePermission for the peer
    #[default]
    Strict,

    /// Grant everything and record first grants (diagnostic mode)
    Permissive,
}

/// Permission policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub mode: PolicyMode,
}

/// Diagnostic dumper configuration.
///
/// Enabling `terminate_on_signature` is a debugging aid only: one matching log line
/// anywhere in the engine callbacks dumps all trace state and exits the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub terminate_on_signature: bool,
    pub fatal_signatures: Vec<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    #[default]
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            realm: "sharp-turn".to_string(),
            verifier: VerifierConfig::default(),
            reaper: ReaperConfig::default(),
            permissions: PermissionConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: 5_000,
            last_login_queue_capacity: 256,
            last_login_max_in_flight: 8,
            last_login_timeout_ms: 5_000,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_threshold_secs: 300,
            summary_interval_secs: 30,
            evict_traces: false,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            terminate_on_signature: false,
            fatal_signatures: vec![DEFAULT_FATAL_SIGNATURE.to_string()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl VerifierConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn last_login_timeout(&self) -> Duration {
        Duration::from_millis(self.last_login_timeout_ms)
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    /// `None` when the summary reporter is disabled
    pub fn summary_interval(&self) -> Option<Duration> {
        (self.summary_interval_secs > 0).then(|| Duration::from_secs(self.summary_interval_secs))
    }
}

impl GateConfig {
    /// Parse and validate a configuration document
    pub fn from_json_str(json: &str) -> GateResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> GateResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values the gate cannot run with
    pub fn validate(&self) -> GateResult<()> {
        if self.realm.is_empty() {
            return Err(GateError::Configuration("realm must not be empty".into()));
        }
        if self.verifier.lookup_timeout_ms == 0 {
            return Err(GateError::Configuration("verifier.lookup_timeout_ms must be positive".into()));
        }
        if self.verifier.last_login_timeout_ms == 0 {
            return Err(GateError::Configuration("verifier.last_login_timeout_ms must be positive".into()));
        }
        if self.verifier.last_login_queue_capacity == 0 || self.verifier.last_login_max_in_flight == 0 {
            return Err(GateError::Configuration(
                "verifier last-login queue capacity and in-flight limit must be positive".into(),
            ));
        }
        if self.reaper.interval_secs == 0 {
            return Err(GateError::Configuration("reaper.interval_secs must be positive".into()));
        }
        if self.reaper.idle_threshold_secs < self.reaper.interval_secs {
            return Err(GateError::Configuration(format!(
                "reaper.idle_threshold_secs ({}) is shorter than reaper.interval_secs ({})",
                self.reaper.idle_threshold_secs, self.reaper.interval_secs
            )));
        }
        if self.diagnostics.terminate_on_signature
            && self.diagnostics.fatal_signatures.iter().all(|s| s.is_empty())
        {
            return Err(GateError::Configuration(
                "diagnostics.terminate_on_signature requires at least one fatal signature".into(),
            ));
        }
        Ok(())
    }
}
