// src/turn/reaper.rs
//! Background tasks: idle session eviction and the periodic session summary

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::metrics::MetricsCollector;
use super::models::Session;
use super::session_registry::SessionRegistry;
use super::trace::TraceRegistry;

/// Steps shown per client in the periodic summary
const RECENT_STEPS: usize = 3;

/// Handle to a spawned periodic task
pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn spawn<F>(name: &'static str, period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => on_tick(),
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(task = name, "Background task stopped");
        });

        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task and wait for an in-progress tick to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(task = self.name, "Background task ended abnormally: {}", e);
        }
    }
}

/// Evicts sessions idle longer than the threshold
pub struct IdleReaper {
    sessions: Arc<SessionRegistry>,
    traces: Arc<TraceRegistry>,
    metrics: Arc<MetricsCollector>,
    idle_threshold: Duration,
    evict_traces: bool,
}

impl IdleReaper {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        traces: Arc<TraceRegistry>,
        metrics: Arc<MetricsCollector>,
        idle_threshold: Duration,
        evict_traces: bool,
    ) -> Self {
        Self {
            sessions,
            traces,
            metrics,
            idle_threshold,
            evict_traces,
        }
    }

    /// Run one scan as of `now` and return the evicted sessions
    pub fn tick_at(&self, now: Instant) -> Vec<Session> {
        MetricsCollector::incr(&self.metrics.reaper_scans);
        let evicted = self.sessions.evict_idle(now, self.idle_threshold);

        // Registry lock released; summaries take the trace lock on their own
        for session in &evicted {
            MetricsCollector::incr(&self.metrics.sessions_evicted);
            let idle_for = now.saturating_duration_since(session.last_active_instant());
            match self.traces.summarize(session.client_addr) {
                Some(summary) => {
                    info!(
                        session_id = %session.id,
                        client_addr = %session.client_addr,
                        username = %session.username,
                        total_steps = summary.total_steps,
                        allocations = summary.allocations,
                        permissions = summary.permissions,
                        channels = summary.channels,
                        session_duration = ?summary.session_duration,
                        idle_for = ?idle_for,
                        "Evicted idle session"
                    );
                }
                None => {
                    info!(
                        session_id = %session.id,
                        client_addr = %session.client_addr,
                        username = %session.username,
                        idle_for = ?idle_for,
                        "Evicted idle session without trace"
                    );
                }
            }

            if self.evict_traces && self.sessions.sessions_for(session.client_addr).is_empty() {
                self.traces.evict(session.client_addr);
            }
        }

        if !evicted.is_empty() {
            info!(
                evicted = evicted.len(),
                remaining = self.sessions.len(),
                "Idle session cleanup completed"
            );
        }
        evicted
    }

    pub fn tick(&self) -> Vec<Session> {
        self.tick_at(Instant::now())
    }

    /// Run `tick` every `period` until stopped
    pub fn spawn(self: Arc<Self>, period: Duration) -> BackgroundTask {
        BackgroundTask::spawn("idle-reaper", period, move || {
            self.tick();
        })
    }
}

/// Logs every traced client with its most recent steps
pub struct SummaryReporter {
    traces: Arc<TraceRegistry>,
}

impl SummaryReporter {
    pub fn new(traces: Arc<TraceRegistry>) -> Self {
        Self { traces }
    }

    /// Emit one summary round. Returns the number of clients reported.
    pub fn report(&self) -> usize {
        let summaries = self.traces.summaries(RECENT_STEPS);
        if summaries.is_empty() {
            info!("Session summary: no active sessions");
            return 0;
        }

        info!(active_sessions = summaries.len(), "Session summary");
        for (summary, recent) in &summaries {
            let recent_steps: Vec<String> = recent.iter().map(ToString::to_string).collect();
            info!(
                client_addr = %summary.client_addr,
                username = %summary.username,
                total_steps = summary.total_steps,
                allocations = summary.allocations,
                permissions = summary.permissions,
                channels = summary.channels,
                session_duration = ?summary.session_duration,
                recent_steps = ?recent_steps,
                "Client summary"
            );
        }
        summaries.len()
    }

    pub fn spawn(self: Arc<Self>, period: Duration) -> BackgroundTask {
        BackgroundTask::spawn("session-summary", period, move || {
            self.report();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn client() -> SocketAddr {
        "10.0.0.5:4000".parse().unwrap()
    }

    fn reaper(evict_traces: bool) -> (IdleReaper, Arc<SessionRegistry>, Arc<TraceRegistry>, Arc<MetricsCollector>) {
        let sessions = Arc::new(SessionRegistry::new());
        let traces = Arc::new(TraceRegistry::new());
        let metrics = Arc::new(MetricsCollector::default());
        let reaper = IdleReaper::new(
            sessions.clone(),
            traces.clone(),
            metrics.clone(),
            Duration::from_secs(300),
            evict_traces,
        );
        (reaper, sessions, traces, metrics)
    }

    #[test]
    fn test_idle_session_evicted_on_next_tick() {
        let (reaper, sessions, traces, metrics) = reaper(false);
        traces.record_step(client(), "bob", "AUTHENTICATION_SUCCESS");
        let id = sessions.open("bob", client());

        let now = Instant::now();
        assert!(reaper.tick_at(now).is_empty());

        let evicted = reaper.tick_at(now + Duration::from_secs(360));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, id);
        assert!(!sessions.touch(&id));
        assert_eq!(MetricsCollector::get(&metrics.sessions_evicted), 1);
        // Trace outlives the session unless configured otherwise
        assert!(traces.summarize(client()).is_some());
    }

    #[test]
    fn test_touched_session_survives_many_ticks() {
        let (reaper, sessions, _, _) = reaper(false);
        let id = sessions.open("bob", client());

        let start = Instant::now();
        for minute in 1..=60u64 {
            let now = start + Duration::from_secs(minute * 60);
            sessions.touch_at(&id, now);
            assert!(reaper.tick_at(now).is_empty());
        }
        assert!(sessions.get(&id).is_some());
    }

    #[test]
    fn test_trace_eviction_waits_for_last_session() {
        let (reaper, sessions, traces, _) = reaper(true);
        traces.record_step(client(), "bob", "AUTHENTICATION_SUCCESS");
        let stale = sessions.open("bob", client());
        let later = Instant::now() + Duration::from_secs(360);
        let live = sessions.open("bob", client());
        sessions.touch_at(&live, later);

        let evicted = reaper.tick_at(later);
        assert_eq!(evicted[0].id, stale);
        assert!(traces.summarize(client()).is_some());

        sessions.close(&live).unwrap();
        sessions.open("bob", client());
        reaper.tick_at(later + Duration::from_secs(360));
        assert!(traces.summarize(client()).is_none());
    }

    #[test]
    fn test_summary_report() {
        let traces = Arc::new(TraceRegistry::new());
        let reporter = SummaryReporter::new(traces.clone());
        assert_eq!(reporter.report(), 0);

        traces.record_step(client(), "bob", "AUTHENTICATION_REQUEST");
        traces.record_step("10.0.0.6:4000".parse().unwrap(), "carol", "AUTHENTICATION_REQUEST");
        assert_eq!(reporter.report(), 2);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicked_task_is_reported_on_stop() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let task = BackgroundTask::spawn("panicking", Duration::from_millis(5), || panic!("tick failed"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;

        let output = String::from_utf8_lossy(&logs.0.lock()).into_owned();
        assert!(output.contains("Background task ended abnormally"));
        assert!(output.contains("panicking"));
    }

    #[tokio::test]
    async fn test_spawned_reaper_stops() {
        let (reaper, _, _, metrics) = reaper(false);
        let task = Arc::new(reaper).spawn(Duration::from_millis(10));
        assert_eq!(task.name(), "idle-reaper");

        for _ in 0..100 {
            if MetricsCollector::get(&metrics.reaper_scans) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.stop().await;

        let scans = MetricsCollector::get(&metrics.reaper_scans);
        assert!(scans >= 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(MetricsCollector::get(&metrics.reaper_scans), scans);
    }
}
