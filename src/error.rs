// src/error.rs
//! Error types for the TURN gate

use std::io;
use thiserror::Error;

/// Authentication failures returned by the credential verifier.
///
/// Every variant is terminal for a single authentication attempt and surfaces to
/// the relay engine as a plain refusal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown or disabled user
    #[error("user not found")]
    UserNotFound,

    /// The user already holds its maximum number of sessions
    #[error("quota exceeded: {current} of {max} sessions in use")]
    QuotaExceeded { current: u32, max: u32 },

    /// Lookup timed out or the store could not be reached
    #[error("credential store unavailable: {0}")]
    CredentialStoreUnavailable(String),

    /// Stored key material could not be decoded
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),
}

impl AuthError {
    /// Short label used in metrics and trace steps
    pub fn label(&self) -> &'static str {
        match self {
            Self::UserNotFound => "user_not_found",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::CredentialStoreUnavailable(_) => "store_unavailable",
            Self::InvalidKeyEncoding(_) => "invalid_key_encoding",
        }
    }
}

/// Errors reported by credential store backends
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or failing
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record exists but cannot be interpreted
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Write rejected because it conflicts with existing data
    #[error("conflict: {0}")]
    Conflict(String),

    /// Record addressed by a write does not exist
    #[error("no such user: {0}")]
    NoSuchUser(String),
}

impl StoreError {
    /// Create an unavailable error from any displayable error
    pub fn unavailable<E: std::fmt::Display>(err: E) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Session lookups. Absence is expected when racing the idle reaper.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Top level error type for the gate
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for gate operations
pub type GateResult<T> = Result<T, GateError>;
