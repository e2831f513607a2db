// src/turn/credential_store.rs
//! Credential store abstraction and the in-memory backend
//!
//! Stored keys are the long-term credential key `MD5(username:realm:password)`,
//! hex-encoded, which is what the relay engine needs to check MESSAGE-INTEGRITY.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{User, UserQuota};
use crate::error::{GateResult, StoreError};

/// Stored key plus the full user record
#[derive(Debug, Clone)]
pub struct AuthRecord {
    /// Hex-encoded key as persisted by the store
    pub key: String,
    pub user: User,
}

/// Credential store trait for authentication backends.
///
/// Implementations are called concurrently from every authentication attempt.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up the key and record for `username`. `Ok(None)` when absent.
    async fn lookup_auth_key(&self, username: &str) -> Result<Option<AuthRecord>, StoreError>;

    /// Record a successful login. Callers treat this as best effort.
    async fn update_last_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    async fn lookup_auth_key(&self, username: &str) -> Result<Option<AuthRecord>, StoreError> {
        (**self).lookup_auth_key(username).await
    }

    async fn update_last_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).update_last_login(user_id, at).await
    }
}

/// Derive the hex-encoded long-term credential key
pub fn generate_auth_key(username: &str, realm: &str, password: &str) -> String {
    let digest = Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes());
    hex::encode(digest)
}

/// User entry in a JSON seed file. Either `password` or a precomputed `auth_key`.
#[derive(Debug, Deserialize)]
struct UserSeed {
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth_key: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    quota: Option<UserQuota>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

/// In-memory credential store with user management
pub struct MemoryCredentialStore {
    realm: String,
    users: RwLock<HashMap<String, User>>,
}

impl MemoryCredentialStore {
    /// Create an empty store for `realm`
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Load users from a JSON array of seeds
    pub fn from_json_file(realm: impl Into<String>, path: impl AsRef<Path>) -> GateResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let seeds: Vec<UserSeed> = serde_json::from_str(&raw)?;
        let store = Self::new(realm);

        for seed in seeds {
            let key = match (seed.auth_key, seed.password) {
                (Some(key), _) => key,
                (None, Some(password)) => generate_auth_key(&seed.username, &store.realm, &password),
                (None, None) => {
                    return Err(StoreError::Corrupt(format!(
                        "user {} has neither password nor auth_key",
                        seed.username
                    ))
                    .into())
                }
            };
            let mut user = User::new(seed.username, key);
            user.enabled = seed.enabled;
            user.quota = seed.quota;
            user.metadata = seed.metadata;
            store.insert(user)?;
        }

        info!("Loaded {} users into memory credential store", store.len());
        Ok(store)
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Add a user from a plaintext password
    pub fn add_user(
        &self,
        username: &str,
        password: &str,
        quota: Option<UserQuota>,
    ) -> Result<User, StoreError> {
        let mut user = User::new(username, generate_auth_key(username, &self.realm, password));
        user.quota = quota;
        self.insert(user.clone())?;
        Ok(user)
    }

    /// Insert a prepared record, rejecting duplicate usernames
    pub fn insert(&self, user: User) -> Result<(), StoreError> {
        let mut users = self.users.write();
        if users.contains_key(&user.username) {
            return Err(StoreError::Conflict(format!("user '{}' already exists", user.username)));
        }
        debug!("Adding user {}", user.username);
        users.insert(user.username.clone(), user);
        Ok(())
    }

    pub fn remove_user(&self, username: &str) -> Result<User, StoreError> {
        self.users
            .write()
            .remove(username)
            .ok_or_else(|| StoreError::NoSuchUser(username.to_string()))
    }

    pub fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), StoreError> {
        self.modify(username, |user| user.enabled = enabled)
    }

    pub fn set_quota(&self, username: &str, quota: Option<UserQuota>) -> Result<(), StoreError> {
        self.modify(username, |user| user.quota = quota)
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let key = generate_auth_key(username, &self.realm, password);
        self.modify(username, |user| user.auth_key = key)
    }

    pub fn get(&self, username: &str) -> Option<User> {
        self.users.read().get(username).cloned()
    }

    /// All users, newest first
    pub fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        users
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    fn modify(&self, username: &str, f: impl FnOnce(&mut User)) -> Result<(), StoreError> {
        let mut users = self.users.write();
        let user = users
            .get_mut(username)
            .ok_or_else(|| StoreError::NoSuchUser(username.to_string()))?;
        f(user);
        user.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup_auth_key(&self, username: &str) -> Result<Option<AuthRecord>, StoreError> {
        Ok(self.users.read().get(username).map(|user| AuthRecord {
            key: user.auth_key.clone(),
            user: user.clone(),
        }))
    }

    async fn update_last_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut users = self.users.write();
        let user = users
            .values_mut()
            .find(|user| user.id == user_id)
            .ok_or_else(|| StoreError::NoSuchUser(user_id.to_string()))?;
        user.last_login = Some(at);
        Ok(())
    }
}
