//! End-to-end pipeline test: a test producer commits events into a ring
//! file, and the dispatcher -> watcher -> collector chain turns them into a
//! finalized bundle archive, then shuts down cleanly.

use aodd::config::{AnomalyConfig, CleanupConfig, GuardianConfig};
use aodd::{
    AnomalyKind, Collector, CollectorMetrics, Config, Dispatcher, DispatcherTuning,
    ShutdownSignal, Watcher,
};
use shmring::{encode_event, Event, RingGeometry, ShmRing, EVENT_SIZE, HEADER_LEN};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn pipeline_config(output_root: &Path) -> Config {
    let mut anomalies = BTreeMap::new();
    anomalies.insert(
        "latency".to_string(),
        AnomalyConfig {
            kind: AnomalyKind::Latency,
            tool: "smbsloweraod".to_string(),
            acceptable_count: 1,
            default_threshold_ms: Some(10),
            track: [(8u16, 50u64)].into_iter().collect(),
            actions: vec!["mounts".to_string()],
        },
    );
    Config {
        watch_interval_sec: 0,
        aod_output_dir: output_root.to_path_buf(),
        guardian: GuardianConfig { anomalies },
        cleanup: CleanupConfig {
            max_log_age_days: 2,
            max_total_log_size_mb: 200,
            cleanup_interval_sec: 60,
            archive_extension: ".tar.zst".to_string(),
        },
        tools_dir: PathBuf::from("/usr/libexec/aodd"),
    }
}

fn spike_event(seq: u64) -> Event {
    Event {
        pid: 100 + seq as i32,
        cmd_end_time_ns: seq,
        session_id: 1,
        mid: seq,
        smbcommand: 8,
        metric: 2_000_000_000, // over the one-second hard ceiling
        tool: 0,
        is_compounded: 0,
        task: *b"smbclient\0\0\0\0\0\0\0",
    }
}

fn wait_for_archive(batches: &Path, timeout: Duration) -> Option<PathBuf> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(dir) = std::fs::read_dir(batches) {
            for entry in dir.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("aod_quick_") && name.ends_with(".tar.zst") {
                    return Some(entry.path());
                }
            }
        }
        thread::sleep(Duration::from_millis(20));
    }
    None
}

#[test]
fn events_flow_from_ring_to_finalized_archive() {
    let root = tempfile::tempdir().unwrap();
    let output_root = root.path().join("out");
    let config = pipeline_config(&output_root);
    let shutdown = ShutdownSignal::new();

    let ring_path = root.path().join("bpf_shm");
    let geometry = RingGeometry::new(HEADER_LEN + 128 * EVENT_SIZE);
    let producer = ShmRing::open(&ring_path, geometry).unwrap();

    // The producer commits its burst of over-ceiling events before the
    // consumer starts, so the whole burst arrives as one batch.
    for seq in 0..12 {
        let written = producer.push_bytes(&encode_event(&spike_event(seq))).unwrap();
        assert_eq!(written, EVENT_SIZE);
    }

    // Wire the pipeline the way the supervisor does.
    let (events_tx, events_rx) = crossbeam_channel::bounded(16);
    let (action_tx, action_rx) = tokio::sync::mpsc::channel(8);

    let consumer = ShmRing::open(&ring_path, geometry).unwrap();
    let tuning = DispatcherTuning::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_settle_wait(Duration::from_millis(1));
    let dispatcher = Dispatcher::new(consumer, events_tx, shutdown.clone(), tuning);
    let dispatcher_handle = thread::spawn(move || dispatcher.run());

    let watcher = Watcher::new(&config, events_rx, action_tx, shutdown.clone());
    let watcher_handle = thread::spawn(move || watcher.run());

    let metrics = Arc::new(CollectorMetrics::default());
    let collector_rx = Arc::new(tokio::sync::Mutex::new(action_rx));
    let collector = Collector::new(&config, collector_rx, Arc::clone(&metrics));
    let collector_handle = thread::spawn(move || collector.run());

    // One anomaly fires and one bundle is finalized.
    let batches = output_root.join("batches");
    let archive = wait_for_archive(&batches, Duration::from_secs(10))
        .expect("no finalized archive appeared");

    // Clean shutdown: dispatcher drains, emits the sentinel, unlinks the
    // ring; the sentinel ripples through watcher and collector.
    shutdown.shutdown();
    dispatcher_handle.join().unwrap().unwrap();
    watcher_handle.join().unwrap().unwrap();
    collector_handle.join().unwrap().unwrap();

    assert!(!ring_path.exists(), "ring file must be unlinked on clean shutdown");
    assert!(archive.exists());
    assert_eq!(metrics.bundles_completed(), 1);
    assert_eq!(metrics.inflight_actions(), 0);

    // No working directory survives finalization.
    for entry in std::fs::read_dir(&batches).unwrap().flatten() {
        assert!(entry.metadata().unwrap().is_file());
    }

    // The audit receipt records the finalized bundle.
    let audit = std::fs::read_to_string(output_root.join("audit.log")).unwrap();
    let entry: serde_json::Value = serde_json::from_str(audit.lines().next().unwrap()).unwrap();
    assert_eq!(entry["kind"], "latency");
    assert_eq!(entry["finalized"], true);
}
