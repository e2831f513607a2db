// src/turn/session_registry.rs
//! Live session map
//!
//! Sessions are keyed by id, with a secondary index from client address so engine
//! events (which only carry addresses) can refresh every session of a client.
//! Both maps live behind one lock, so a scan by the idle reaper never races a
//! concurrent update.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::models::{Session, TrafficDelta};
use crate::error::SessionError;

#[derive(Debug, Default)]
struct SessionMap {
    sessions: HashMap<String, Session>,
    by_client: HashMap<SocketAddr, HashSet<String>>,
}

impl SessionMap {
    fn unindex(&mut self, session: &Session) {
        if let Some(ids) = self.by_client.get_mut(&session.client_addr) {
            ids.remove(&session.id);
            if ids.is_empty() {
                self.by_client.remove(&session.client_addr);
            }
        }
    }

    /// Most recently started session of a client
    fn latest_for(&mut self, client_addr: SocketAddr) -> Option<&mut Session> {
        let id = self
            .by_client
            .get(&client_addr)?
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .max_by_key(|s| (s.start_time, s.id.clone()))?
            .id
            .clone();
        self.sessions.get_mut(&id)
    }
}

/// Concurrency-safe registry of authenticated sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<SessionMap>,
    seq: AtomicU64,
    opened: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session and return its id.
    ///
    /// Several sessions per client are allowed; ids stay unique for the life of the
    /// registry even when two opens land in the same millisecond.
    pub fn open(&self, username: &str, client_addr: SocketAddr) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}-{}", client_addr, Utc::now().timestamp_millis(), seq);
        let session = Session::new(id.clone(), username, client_addr, Instant::now());

        {
            let mut inner = self.inner.write();
            inner
                .by_client
                .entry(client_addr)
                .or_default()
                .insert(id.clone());
            inner.sessions.insert(id.clone(), session);
        }
        self.opened.fetch_add(1, Ordering::Relaxed);

        info!(session_id = %id, username, client_addr = %client_addr, "Session opened");
        id
    }

    /// Refresh `last_active`. Returns false, and does nothing else, if the session is gone.
    pub fn touch(&self, session_id: &str) -> bool {
        self.touch_at(session_id, Instant::now())
    }

    pub fn touch_at(&self, session_id: &str, now: Instant) -> bool {
        match self.inner.write().sessions.get_mut(session_id) {
            Some(session) => {
                session.refresh(now);
                true
            }
            None => {
                debug!(session_id, "Touch on missing session ignored");
                false
            }
        }
    }

    /// Refresh every session of a client. Returns how many were refreshed.
    pub fn touch_client(&self, client_addr: SocketAddr) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let SessionMap { sessions, by_client } = &mut *inner;
        let Some(ids) = by_client.get(&client_addr) else {
            return 0;
        };
        let mut touched = 0;
        for id in ids {
            let Some(session) = sessions.get_mut(id) else { continue };
            session.refresh(now);
            touched += 1;
        }
        touched
    }

    /// Set the relay address on the client's sessions that do not have one yet
    pub fn assign_relay(&self, client_addr: SocketAddr, relay_addr: SocketAddr) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let SessionMap { sessions, by_client } = &mut *inner;
        let Some(ids) = by_client.get(&client_addr) else {
            return 0;
        };
        let mut assigned = 0;
        for id in ids {
            let Some(session) = sessions.get_mut(id) else { continue };
            if session.relay_addr.is_none() {
                session.relay_addr = Some(relay_addr);
                assigned += 1;
            }
            session.refresh(now);
        }
        assigned
    }

    /// Add traffic to the client's most recent session
    pub fn record_traffic(&self, client_addr: SocketAddr, delta: TrafficDelta) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.write();
        match inner.latest_for(client_addr) {
            Some(session) => {
                session.bytes_sent = session.bytes_sent.saturating_add(delta.bytes_sent);
                session.bytes_recv = session.bytes_recv.saturating_add(delta.bytes_recv);
                session.packets_sent = session.packets_sent.saturating_add(delta.packets_sent);
                session.packets_recv = session.packets_recv.saturating_add(delta.packets_recv);
                session.refresh(now);
                true
            }
            None => false,
        }
    }

    /// Remove a session on allocation teardown
    pub fn close(&self, session_id: &str) -> Result<Session, SessionError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        inner.unindex(&session);
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    /// Copy of every live session, oldest first
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.inner.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Ids of the live sessions of one client
    pub fn sessions_for(&self, client_addr: SocketAddr) -> Vec<String> {
        self.inner
            .read()
            .by_client
            .get(&client_addr)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Sessions opened since the registry was created
    pub fn total_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Remove every session idle for longer than `threshold` as of `now`.
    ///
    /// The whole scan runs under the write lock and returns the removed sessions so the
    /// caller can log them after the lock is released.
    pub fn evict_idle(&self, now: Instant, threshold: Duration) -> Vec<Session> {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_active_instant()) > threshold)
            .map(|s| s.id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(session) = inner.sessions.remove(&id) {
                inner.unindex(&session);
                evicted.push(session);
            }
        }
        evicted
    }
}
