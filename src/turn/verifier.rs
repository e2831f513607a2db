// src/turn/verifier.rs
//! Credential verification
//!
//! Gates an authentication attempt on user existence, the enabled flag and the
//! session quota, and hands the decoded long-term key back to the relay engine,
//! which completes the MESSAGE-INTEGRITY check itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::credential_store::CredentialStore;
use super::last_login::LastLoginQueue;
use super::metrics::MetricsCollector;
use super::models::User;
use super::trace::TraceRegistry;
use crate::error::AuthError;

/// Key material and user record for an accepted attempt
#[derive(Debug, Clone)]
pub struct VerifiedCredential {
    pub key: Vec<u8>,
    pub user: User,
}

/// Checks credentials against the store with a bounded lookup
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore>,
    traces: Arc<TraceRegistry>,
    last_login: Arc<LastLoginQueue>,
    metrics: Arc<MetricsCollector>,
    lookup_timeout: Duration,
}

impl CredentialVerifier {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        traces: Arc<TraceRegistry>,
        last_login: Arc<LastLoginQueue>,
        metrics: Arc<MetricsCollector>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            store,
            traces,
            last_login,
            metrics,
            lookup_timeout,
        }
    }

    /// Verify `username` for a request from `client_addr`.
    ///
    /// Order of checks: lookup, key decode, quota. Store failures and timeouts fail
    /// closed. The last-login write is queued and never delays the result.
    #[instrument(skip(self))]
    pub async fn verify(&self, username: &str, client_addr: SocketAddr) -> Result<VerifiedCredential, AuthError> {
        MetricsCollector::incr(&self.metrics.auth_requests);
        self.traces.record_step(client_addr, username, "AUTHENTICATION_REQUEST");

        let result = self.check(username, client_addr).await;
        match &result {
            Ok(credential) => {
                MetricsCollector::incr(&self.metrics.auth_successes);
                self.traces.record_step(client_addr, username, "AUTHENTICATION_SUCCESS");
                self.last_login.enqueue(credential.user.id, Utc::now());
            }
            Err(e) => {
                MetricsCollector::incr(&self.metrics.auth_failures);
                warn!(username, reason = e.label(), "Authentication failed: {}", e);
            }
        }
        result
    }

    async fn check(&self, username: &str, client_addr: SocketAddr) -> Result<VerifiedCredential, AuthError> {
        let lookup = match timeout(self.lookup_timeout, self.store.lookup_auth_key(username)).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                return Err(self.fail_lookup(client_addr, username, AuthError::CredentialStoreUnavailable(e.to_string())))
            }
            Err(_) => {
                let reason = format!("lookup timed out after {:?}", self.lookup_timeout);
                return Err(self.fail_lookup(client_addr, username, AuthError::CredentialStoreUnavailable(reason)));
            }
        };

        let record = match lookup {
            Some(record) if record.user.enabled => record,
            Some(_) => {
                debug!(username, "User is disabled");
                return Err(self.fail_lookup(client_addr, username, AuthError::UserNotFound));
            }
            None => return Err(self.fail_lookup(client_addr, username, AuthError::UserNotFound)),
        };

        let key = hex::decode(&record.key).map_err(|e| {
            self.traces
                .record_step(client_addr, username, &format!("KEY_DECODE_FAILED: {}", e));
            AuthError::InvalidKeyEncoding(e.to_string())
        })?;

        if let Some(quota) = record.user.quota.as_ref().filter(|q| q.is_exhausted()) {
            MetricsCollector::incr(&self.metrics.quota_rejections);
            self.traces.record_step(client_addr, username, "QUOTA_EXCEEDED");
            return Err(AuthError::QuotaExceeded {
                current: quota.current_sessions,
                max: quota.max_sessions,
            });
        }

        Ok(VerifiedCredential { key, user: record.user })
    }

    fn fail_lookup(&self, client_addr: SocketAddr, username: &str, err: AuthError) -> AuthError {
        if matches!(err, AuthError::CredentialStoreUnavailable(_)) {
            MetricsCollector::incr(&self.metrics.store_unavailable);
        }
        self.traces
            .record_step(client_addr, username, &format!("AUTHENTICATION_FAILED: {}", err));
        err
    }
}
