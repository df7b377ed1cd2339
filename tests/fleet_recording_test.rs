//! End-to-end recording: three sensor processes, one tabular saver recording two of them.

use daq_fleet::config::FleetConfig;
use daq_fleet::orchestrator::Orchestrator;
use daq_fleet::recording::{BackendRegistry, QUERY_EVENTS, START_RECORDING, STATUS};
use daq_fleet::supervisor::LifecycleState;
use daq_fleet::wire::{Mapping, Payload};
use daq_fleet::workers::WorkerRegistry;
use daq_fleet::ParticipantLauncher;
use serde_json::json;
use serial_test::serial;
use std::path::Path;
use std::time::{Duration, Instant};

const CONFIG: &str = r#"
    [transport]
    base_port = 17100

    [handshake]
    timeout = "10s"
    rebroadcast_interval = "50ms"
    join_timeout = "5s"

    [[modules]]
    name = "w1"
    worker = "mock_sensor"
    saver = "disk"

    [[modules]]
    name = "w2"
    worker = "mock_sensor"

    [[modules]]
    name = "w3"
    worker = "mock_sensor"

    [[savers]]
    name = "disk"
    backend = "tabular"
    workers = ["w2"]
    cache_size = 100
"#;

fn launcher() -> ParticipantLauncher {
    ParticipantLauncher::new(env!("CARGO_BIN_EXE_daq_fleet"))
}

/// Sensors that sample once per TRIGGER and always read 0.
fn config(base_port: u16) -> FleetConfig {
    let mut config = FleetConfig::from_toml_str(CONFIG).unwrap();
    config.transport.base_port = base_port;
    for module in &mut config.modules {
        module.params = json!({"period": null, "channels": ["value"], "amplitude": 0.0});
    }
    config
}

async fn launch(base_port: u16) -> Orchestrator {
    let mut fleet = Orchestrator::launch(
        config(base_port),
        &WorkerRegistry::new(),
        &BackendRegistry::new(),
        launcher(),
    )
    .await
    .unwrap();
    let report = fleet.connect().await;
    assert!(report.is_complete(), "{report:?}");
    fleet
}

async fn query(fleet: &mut Orchestrator, name: &str) -> Mapping {
    let reply = fleet
        .request("disk", name, Duration::from_secs(2))
        .await
        .expect("saver reply");
    match reply.into_payload() {
        Payload::Event { kwargs, .. } => kwargs,
        other => panic!("unexpected reply {other:?}"),
    }
}

async fn wait_for_status(fleet: &mut Orchestrator, what: &str, check: impl Fn(&Mapping) -> bool) -> Mapping {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = query(fleet, STATUS).await;
        if check(&current) {
            return current;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {current:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// One recording of a single trigger; returns the saver status after the flush.
async fn record_one_trigger(fleet: &mut Orchestrator, dir: &Path, flushed_before: u64) -> Mapping {
    assert!(fleet.start_recording(dir, "session").unwrap());
    wait_for_status(fleet, "recording", |s| s["recording"] == json!(true)).await;
    fleet.send_trigger().unwrap();
    wait_for_status(fleet, "two cached entries", |s| s["cached"] == json!(2)).await;
    assert!(fleet.stop_recording().unwrap());
    wait_for_status(fleet, "flush", |s| {
        s["recording"] == json!(false) && s["flushed"] == json!(flushed_before + 2)
    })
    .await
}

fn read_rows(path: &Path) -> Vec<String> {
    let csv = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("{}: {e}", path.display()));
    csv.lines().map(str::to_string).collect()
}

#[tokio::test]
#[serial]
async fn test_three_workers_one_saver_flushes_two_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut fleet = launch(17100).await;
    assert_eq!(fleet.topology().saver_workers("disk"), ["w2", "w1"]);
    assert_eq!(fleet.state("w3"), Some(LifecycleState::Running));

    assert!(fleet.start_recording(dir.path(), "session").unwrap());
    // a second start while recording changes nothing
    assert!(!fleet.start_recording(dir.path(), "other").unwrap());
    let status = wait_for_status(&mut fleet, "recording", |s| s["recording"] == json!(true)).await;
    assert_eq!(status["index"], json!(1));

    fleet.send_trigger().unwrap();
    wait_for_status(&mut fleet, "two cached entries", |s| s["cached"] == json!(2)).await;

    assert!(fleet.stop_recording().unwrap());
    assert!(!fleet.stop_recording().unwrap());
    let done = wait_for_status(&mut fleet, "flush", |s| s["flushed"] == json!(2)).await;
    assert_eq!(done["recording"], json!(false));
    assert_eq!(done["cached"], json!(0));
    assert_eq!(done["rejected"], json!(0));

    let path = dir.path().join("session_001.csv");
    assert_eq!(done["paths"], json!([path.display().to_string()]));
    let rows = read_rows(&path);
    assert_eq!(rows.len(), 3, "{rows:?}");
    assert_eq!(rows[0], "time,source,index,w1.value,w2.value");
    let sources: Vec<&str> = rows[1..]
        .iter()
        .map(|l| l.split(',').nth(1).unwrap())
        .collect();
    assert!(sources.contains(&"w1") && sources.contains(&"w2"));
    assert!(rows.iter().all(|row| !row.contains("w3")));
    assert!(!dir.path().join("other_001.csv").exists());

    assert!(fleet.errors().is_empty(), "{:?}", fleet.errors());
    fleet.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_each_recording_gets_its_own_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut fleet = launch(17110).await;

    record_one_trigger(&mut fleet, dir.path(), 0).await;
    let done = record_one_trigger(&mut fleet, dir.path(), 2).await;

    let second = dir.path().join("session_002.csv");
    assert_eq!(done["paths"], json!([second.display().to_string()]));
    assert_eq!(read_rows(&dir.path().join("session_001.csv")).len(), 3);
    assert_eq!(read_rows(&second).len(), 3);

    fleet.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_repeated_start_event_keeps_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mut fleet = launch(17120).await;

    assert!(fleet.start_recording(dir.path(), "session").unwrap());
    wait_for_status(&mut fleet, "recording", |s| s["recording"] == json!(true)).await;
    fleet.send_trigger().unwrap();
    wait_for_status(&mut fleet, "two cached entries", |s| s["cached"] == json!(2)).await;

    // a start event that reaches a saver mid-recording is ignored
    let mut kwargs = Mapping::new();
    kwargs.insert("directory".into(), json!(dir.path().display().to_string()));
    kwargs.insert("filename".into(), json!("intruder"));
    kwargs.insert("idx".into(), json!(9));
    fleet.send_event(START_RECORDING, kwargs).unwrap();
    let status = wait_for_status(&mut fleet, "second start logged", |s| s["events"] == json!(2)).await;
    assert_eq!(status["cached"], json!(2));
    assert_eq!(status["index"], json!(1));

    assert!(fleet.stop_recording().unwrap());
    wait_for_status(&mut fleet, "flush", |s| s["flushed"] == json!(2)).await;
    assert_eq!(read_rows(&dir.path().join("session_001.csv")).len(), 3);
    assert!(!dir.path().join("intruder_009.csv").exists());

    fleet.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_event_log_query_drains() {
    let dir = tempfile::tempdir().unwrap();
    let mut fleet = launch(17130).await;

    record_one_trigger(&mut fleet, dir.path(), 0).await;
    let reply = query(&mut fleet, QUERY_EVENTS).await;
    let names: Vec<&str> = reply["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["start_recording", "stop_recording"]);
    assert_eq!(reply["events"][0]["kwargs"]["filename"], "session");
    assert_eq!(reply["events"][0]["kwargs"]["idx"], 1);

    let reply = query(&mut fleet, QUERY_EVENTS).await;
    assert_eq!(reply["events"], json!([]));

    fleet.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_unknown_request_is_a_non_critical_error() {
    let mut fleet = launch(17150).await;

    let reply = fleet
        .request("disk", "connection", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.payload(), &Payload::Connection(true));

    let reply = fleet
        .request("disk", "rewind", Duration::from_secs(2))
        .await
        .unwrap();
    match reply.payload() {
        Payload::Error { report, trace } => {
            assert!(!report.critical);
            assert!(report.message.contains("rewind"));
            assert!(!trace.is_empty());
        }
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(fleet.shutdown_requests().is_empty());
    assert_eq!(fleet.errors().len(), 1);

    fleet.shutdown(Duration::from_secs(5)).await.unwrap();
}
