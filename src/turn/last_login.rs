// src/turn/last_login.rs
//! Best-effort last-login writes
//!
//! Authentication enqueues a write and returns immediately. A single worker drains
//! the queue with a bounded number of in-flight store calls; failures and drops are
//! only visible through metrics and debug logs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::credential_store::CredentialStore;
use super::metrics::MetricsCollector;

#[derive(Debug)]
struct LastLoginUpdate {
    user_id: Uuid,
    at: DateTime<Utc>,
}

/// Bounded queue of pending last-login writes
pub struct LastLoginQueue {
    tx: mpsc::Sender<LastLoginUpdate>,
    shutdown_tx: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsCollector>,
}

impl LastLoginQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<dyn CredentialStore>,
        capacity: usize,
        max_in_flight: usize,
        write_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(Self::worker_loop(
            store,
            rx,
            shutdown_rx,
            Arc::new(Semaphore::new(max_in_flight)),
            write_timeout,
            metrics.clone(),
        ));

        Self {
            tx,
            shutdown_tx,
            worker: parking_lot::Mutex::new(Some(worker)),
            metrics,
        }
    }

    /// Queue a write without waiting. Returns false when the update was dropped.
    pub fn enqueue(&self, user_id: Uuid, at: DateTime<Utc>) -> bool {
        match self.tx.try_send(LastLoginUpdate { user_id, at }) {
            Ok(()) => true,
            Err(e) => {
                MetricsCollector::incr(&self.metrics.last_login_dropped);
                debug!("Dropped last-login update for {}: {}", user_id, e);
                false
            }
        }
    }

    async fn worker_loop(
        store: Arc<dyn CredentialStore>,
        mut rx: mpsc::Receiver<LastLoginUpdate>,
        mut shutdown_rx: watch::Receiver<bool>,
        in_flight: Arc<Semaphore>,
        write_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) {
        loop {
            let update = tokio::select! {
                update = rx.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            // Writes that never finish must not keep shutdown waiting on a permit
            let permit = tokio::select! {
                permit = in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            let store = store.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match timeout(write_timeout, store.update_last_login(update.user_id, update.at)).await {
                    Ok(Ok(())) => MetricsCollector::incr(&metrics.last_login_written),
                    Ok(Err(e)) => {
                        MetricsCollector::incr(&metrics.last_login_failures);
                        debug!("Last-login update for {} failed: {}", update.user_id, e);
                    }
                    Err(_) => {
                        MetricsCollector::incr(&metrics.last_login_failures);
                        debug!("Last-login update for {} timed out after {:?}", update.user_id, write_timeout);
                    }
                }
            });
        }

        info!("Last-login worker stopped");
    }

    /// Stop accepting work and wait for the worker to exit
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Last-login worker ended abnormally: {}", e);
            }
        }
    }
}
