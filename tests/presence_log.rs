use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use watchpost::config::{PipelineConfig, PresenceConfig};
use watchpost::detect::{BoundingBox, Detection, DetectionResult, StubBackend};
use watchpost::{BackendRegistry, DefaultOpener, EventLog, PresenceState, Supervisor};

fn person() -> DetectionResult {
    DetectionResult::new(vec![Detection::classified(
        BoundingBox::new(4.0, 4.0, 12.0, 12.0),
        1,
        "person",
        0.9,
    )])
}

#[test]
fn supervisor_monitor_writes_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("log.txt");

    let mut cfg = PipelineConfig::default();
    cfg.cameras[0].source = "stub://camera0?fps=25&width=16&height=12".to_string();
    let mut presence = PresenceConfig::new("stub://security?fps=200&width=16&height=12");
    presence.check_interval = Duration::from_millis(10);
    presence.burst_size = 2;
    presence.log_path = log_path.clone();
    cfg.presence = Some(presence);

    // two empty bursts, then someone shows up for good
    let mut backend = StubBackend::new().with_fallback(person());
    for _ in 0..4 {
        backend.push_result(DetectionResult::default());
    }
    let mut registry = BackendRegistry::new();
    registry.register(backend);

    let mut sup = Supervisor::new(&cfg, &registry, Arc::new(DefaultOpener), None).unwrap();
    assert_eq!(sup.presence_state(), Some(PresenceState::Absent));
    sup.start_all().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while sup.presence_state() != Some(PresenceState::Present) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    sup.stop_all().unwrap();
    assert!(sup.presence_last_transition().is_some());

    let entries = EventLog::new(&log_path).read_entries().unwrap();
    let states: Vec<PresenceState> = entries.iter().map(|e| e.state).collect();
    assert_eq!(states, vec![PresenceState::Present]);

    let raw = std::fs::read_to_string(&log_path).unwrap();
    assert!(raw.ends_with(" - present\r\n"));
}

#[test]
fn absent_bursts_never_write() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("log.txt");

    let mut cfg = PipelineConfig::default();
    cfg.cameras[0].source = "stub://camera0?fps=25&width=16&height=12".to_string();
    let mut presence = PresenceConfig::new("stub://security?fps=200&width=16&height=12");
    presence.check_interval = Duration::from_millis(5);
    presence.burst_size = 3;
    presence.log_path = log_path.clone();
    cfg.presence = Some(presence);

    let backend = StubBackend::new();
    let calls = backend.calls();
    let mut registry = BackendRegistry::new();
    registry.register(backend);

    let mut sup = Supervisor::new(&cfg, &registry, Arc::new(DefaultOpener), None).unwrap();
    sup.start_all().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while calls.load(std::sync::atomic::Ordering::SeqCst) < 9 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    sup.stop_all().unwrap();

    assert!(calls.load(std::sync::atomic::Ordering::SeqCst) >= 9);
    assert!(!log_path.exists());
    assert_eq!(sup.presence_state(), Some(PresenceState::Absent));
    assert_eq!(sup.presence_last_transition(), None);
}
