// tests/gate_lifecycle.rs
//! End-to-end tests for the TURN gate through its public API

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use sharp_turn_gate::turn::{PermissionDecision, Terminator};
use sharp_turn_gate::{
    generate_auth_key, GateConfig, GateResult, MemoryCredentialStore, PolicyMode, TurnGate, UserQuota,
};

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Log sink shared with the test body
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTerminator {
    codes: Mutex<Vec<i32>>,
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().push(code);
    }
}

fn store(realm: &str) -> Arc<MemoryCredentialStore> {
    let store = Arc::new(MemoryCredentialStore::new(realm));
    store.add_user("bob", "bob-secret", None).unwrap();
    store
        .add_user("alice", "alice-secret", Some(UserQuota::sessions(1, 1)))
        .unwrap();
    store
}

fn gate_with(mode: PolicyMode) -> GateResult<TurnGate> {
    let mut config = GateConfig::default();
    config.permissions.mode = mode;
    let store = store(&config.realm);
    TurnGate::builder(config).store(store).build()
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn steps_of(gate: &TurnGate, client: SocketAddr) -> Vec<String> {
    gate.traces()
        .get(client)
        .map(|t| t.steps.into_iter().map(|s| s.description).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_alice_over_quota_is_refused() -> GateResult<()> {
    setup_test_logging();
    let gate = gate_with(PolicyMode::Strict)?;
    let client = addr("10.0.0.7:4000");

    assert!(gate.authenticate("alice", "sharp-turn", client).await.is_none());
    assert!(gate.list_sessions().is_empty());

    let quota_steps = steps_of(&gate, client)
        .into_iter()
        .filter(|s| s == "QUOTA_EXCEEDED")
        .count();
    assert_eq!(quota_steps, 1);
    assert_eq!(gate.get_stats().quota_rejections, 1);

    gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_user_is_refused() -> GateResult<()> {
    setup_test_logging();
    let gate = gate_with(PolicyMode::Strict)?;

    for name in ["mallory", "eve", ""] {
        assert!(gate.authenticate(name, "sharp-turn", addr("10.0.0.9:1234")).await.is_none());
    }
    assert!(gate.list_sessions().is_empty());
    assert_eq!(gate.get_stats().auth_failures, 3);

    gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_bob_auto_grant_warns_once() -> GateResult<()> {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let gate = gate_with(PolicyMode::Permissive)?;
    let client = addr("10.0.0.5:4000");
    let peer: IpAddr = "8.8.8.8".parse().unwrap();

    let key = gate.authenticate("bob", "sharp-turn", client).await;
    assert_eq!(
        key.map(hex::encode),
        Some(generate_auth_key("bob", "sharp-turn", "bob-secret"))
    );

    assert!(gate.check_permission(client, peer));
    assert_eq!(gate.permission_decision(client, peer), PermissionDecision::Existing);

    assert_eq!(logs.contents().matches("Permission auto-granted").count(), 1);
    assert_eq!(gate.get_stats().permissions_auto_granted, 1);
    assert_eq!(gate.summarize(client).map(|s| s.permissions), Some(1));

    let checks = steps_of(&gate, client)
        .into_iter()
        .filter(|s| s == "PERMISSION_CHECK: 8.8.8.8")
        .count();
    assert_eq!(checks, 2);

    gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_idle_session_evicted_with_summary() -> GateResult<()> {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let gate = gate_with(PolicyMode::Permissive)?;
    let client = addr("10.0.0.5:4000");
    gate.authenticate("bob", "sharp-turn", client).await;
    gate.on_allocation_created(client, addr("203.0.113.1:50000"));
    gate.check_permission(client, "8.8.8.8".parse().unwrap());

    let evicted = gate.reaper().tick_at(Instant::now() + Duration::from_secs(6 * 60));
    assert_eq!(evicted.len(), 1);
    assert!(gate.list_sessions().is_empty());
    assert!(!gate.sessions().touch(&evicted[0].id));

    let output = logs.contents();
    let line = output
        .lines()
        .find(|l| l.contains("Evicted idle session"))
        .expect("eviction summary logged");
    assert!(line.contains("allocations=1"));
    assert!(line.contains("permissions=1"));
    assert!(line.contains("total_steps="));
    assert_eq!(gate.get_stats().sessions_evicted, 1);

    gate.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients() -> GateResult<()> {
    setup_test_logging();
    let gate = Arc::new(gate_with(PolicyMode::Permissive)?);
    let shared_client = addr("10.0.0.5:4000");

    let mut handles = Vec::new();
    for i in 0..50u16 {
        let gate = gate.clone();
        handles.push(tokio::spawn(async move {
            let client = SocketAddr::from(([10, 1, 0, 1], 10_000 + i));
            assert!(gate.authenticate("bob", "sharp-turn", client).await.is_some());
            gate.on_step(shared_client, "bob", &format!("ENGINE_EVENT {}", i));
            gate.check_permission(shared_client, "8.8.8.8".parse().unwrap())
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let stats = gate.get_stats();
    assert_eq!(stats.active_sessions, 50);
    assert_eq!(stats.auth_successes, 50);
    assert_eq!(stats.permissions_auto_granted, 1);

    let events = steps_of(&gate, shared_client)
        .into_iter()
        .filter(|s| s.starts_with("ENGINE_EVENT"))
        .count();
    assert_eq!(events, 50);
    info!("Concurrent clients completed: {:?}", stats.active_sessions);

    gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_fatal_signature_dumps_and_terminates() -> GateResult<()> {
    setup_test_logging();
    let mut config = GateConfig::default();
    config.diagnostics.terminate_on_signature = true;
    let terminator = Arc::new(RecordingTerminator::default());
    let gate = TurnGate::builder(config.clone())
        .store(store(&config.realm))
        .terminator(terminator.clone())
        .build()?;

    let client = addr("10.0.0.5:4000");
    gate.authenticate("bob", "sharp-turn", client).await;

    assert!(!gate.on_engine_log("allocation mismatch"));
    assert!(gate.on_engine_log("failed to handle ChannelData from 10.0.0.5:4000: No Permission or Channel exists"));
    assert!(!gate.on_engine_log("No Permission or Channel exists"));
    assert_eq!(*terminator.codes.lock(), vec![1]);

    gate.shutdown().await;
    Ok(())
}

fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn test_fatal_dump_contains_full_trace() -> GateResult<()> {
    let (logs, _guard) = capture_logs();
    let mut config = GateConfig::default();
    config.diagnostics.terminate_on_signature = true;
    let terminator = Arc::new(RecordingTerminator::default());
    let gate = TurnGate::builder(config.clone())
        .store(store(&config.realm))
        .terminator(terminator.clone())
        .build()?;

    let client = addr("10.0.0.5:4000");
    let peer: IpAddr = "8.8.8.8".parse().unwrap();
    gate.authenticate("bob", "sharp-turn", client).await;
    gate.on_step(client, "bob", "ENGINE_STEP_ALPHA");
    gate.on_allocation_created(client, addr("203.0.113.1:50000"));
    gate.on_permission_created(client, peer);
    gate.on_channel_created(client, addr("8.8.8.8:53"), 0x4001);
    gate.on_step(client, "bob", "ENGINE_STEP_OMEGA");

    assert!(gate.on_engine_log("No Permission or Channel exists for 8.8.8.8"));
    assert_eq!(*terminator.codes.lock(), vec![1]);

    let output = logs.contents();
    let start = output
        .find("dumping all client traces")
        .expect("dump header logged");
    let dump = &output[start..];

    let summary = dump
        .lines()
        .find(|l| l.contains("Client trace"))
        .expect("trace summary in dump");
    assert!(summary.contains("username=bob"));
    assert!(summary.contains("total_steps=5"));
    assert!(summary.contains("allocations=1"));
    assert!(summary.contains("permissions=1"));
    assert!(summary.contains("channels=1"));

    let expected = [
        "AUTHENTICATION_REQUEST",
        "AUTHENTICATION_SUCCESS",
        "SESSION_CREATED",
        "ENGINE_STEP_ALPHA",
        "ENGINE_STEP_OMEGA",
    ];
    let step_lines: Vec<&str> = dump.lines().filter(|l| l.contains("Trace step")).collect();
    assert_eq!(step_lines.len(), expected.len());
    for (index, (line, step)) in step_lines.iter().zip(expected).enumerate() {
        assert!(line.contains(step), "step {} out of order: {}", index, line);
        assert!(line.contains(&format!("index={}", index)));
    }

    let entries: Vec<&str> = dump.lines().filter(|l| l.contains("created_at=")).collect();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|l| l.contains("age=")));
    assert!(entries.iter().any(|l| l.contains("relay_addr=203.0.113.1:50000")));
    assert!(entries.iter().any(|l| l.contains("Permission") && l.contains("peer_addr=8.8.8.8")));
    assert!(entries.iter().any(|l| l.contains("channel_number=16385")));

    gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_returning_client_is_granted_again_after_trace_eviction() -> GateResult<()> {
    let (logs, _guard) = capture_logs();
    let mut config = GateConfig::default();
    config.permissions.mode = PolicyMode::Permissive;
    config.reaper.evict_traces = true;
    let gate = TurnGate::builder(config.clone()).store(store(&config.realm)).build()?;

    let client = addr("10.0.0.5:4000");
    let peer: IpAddr = "8.8.8.8".parse().unwrap();
    gate.authenticate("bob", "sharp-turn", client).await;
    assert_eq!(gate.permission_decision(client, peer), PermissionDecision::AutoGranted);

    let evicted = gate.reaper().tick_at(Instant::now() + Duration::from_secs(6 * 60));
    assert_eq!(evicted.len(), 1);
    assert!(gate.summarize(client).is_none());

    gate.authenticate("bob", "sharp-turn", client).await;
    assert_eq!(gate.permission_decision(client, peer), PermissionDecision::AutoGranted);
    assert_eq!(gate.summarize(client).map(|s| s.permissions), Some(1));
    assert_eq!(gate.get_stats().permissions_auto_granted, 2);
    assert_eq!(logs.contents().matches("Permission auto-granted").count(), 2);

    gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_background_tasks_lifecycle() -> GateResult<()> {
    setup_test_logging();
    let gate = gate_with(PolicyMode::Strict)?;
    gate.start();
    gate.authenticate("bob", "sharp-turn", addr("10.0.0.5:4000")).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.shutdown().await;

    // Sessions survive shutdown; only the tasks stop
    assert_eq!(gate.list_sessions().len(), 1);
    Ok(())
}
