//! Connection handshake with participants that cannot answer in time, or at all.

use daq_fleet::config::FleetConfig;
use daq_fleet::error::FleetError;
use daq_fleet::orchestrator::Orchestrator;
use daq_fleet::recording::BackendRegistry;
use daq_fleet::workers::WorkerRegistry;
use daq_fleet::ParticipantLauncher;
use serial_test::serial;
use std::time::{Duration, Instant};

const CONFIG: &str = r#"
    [transport]
    base_port = 17200

    [handshake]
    timeout = "1s"
    rebroadcast_interval = "50ms"

    [[modules]]
    name = "fast"
    worker = "mock_sensor"
    params = { period = "20ms" }

    [[modules]]
    name = "sleepy"
    worker = "mock_faulty"
    params = { setup_delay = "2500ms" }
"#;

fn launcher() -> ParticipantLauncher {
    ParticipantLauncher::new(env!("CARGO_BIN_EXE_daq_fleet"))
}

async fn launch(config: FleetConfig) -> Orchestrator {
    Orchestrator::launch(config, &WorkerRegistry::new(), &BackendRegistry::new(), launcher())
        .await
        .unwrap()
}

#[tokio::test]
#[serial]
async fn test_handshake_reports_silent_worker_without_failing() {
    let mut fleet = launch(FleetConfig::from_toml_str(CONFIG).unwrap()).await;

    let started = Instant::now();
    let report = fleet.connect().await;
    let elapsed = started.elapsed();

    assert!(!report.is_complete());
    assert!(report.responded.contains_key("fast"), "{report:?}");
    assert_eq!(report.unresponsive.len(), 1);
    let (name, waited) = &report.unresponsive[0];
    assert_eq!(name, "sleepy");
    assert!(*waited >= Duration::from_secs(1));
    assert!(report.exited.is_empty());
    assert!(elapsed < Duration::from_secs(2), "handshake overran: {elapsed:?}");

    // the slow participant still finishes cleanly once it gets to its loop
    fleet.shutdown(Duration::from_secs(10)).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_handshake_completes_for_responsive_fleet() {
    let mut config = FleetConfig::from_toml_str(CONFIG).unwrap();
    config.transport.base_port = 17250;
    config.modules.retain(|m| m.name == "fast");
    let mut fleet = launch(config).await;

    let report = fleet.connect().await;
    assert!(report.is_complete(), "{report:?}");
    assert!(fleet.is_connected("fast"));
    assert!(fleet.subscriptions_live());

    fleet.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_handshake_stops_waiting_for_exited_participant() {
    let mut config = FleetConfig::from_toml_str(CONFIG).unwrap();
    config.transport.base_port = 17270;
    config.handshake.timeout = Duration::from_secs(5);
    let sleepy = config
        .modules
        .iter_mut()
        .find(|m| m.name == "sleepy")
        .unwrap();
    sleepy.params = serde_json::json!({"setup_delay": "300ms", "abort_after": "100ms"});
    let mut fleet = launch(config).await;

    let started = Instant::now();
    let report = fleet.connect().await;

    assert!(!report.is_complete());
    assert!(report.responded.contains_key("fast"), "{report:?}");
    assert_eq!(report.exited, ["sleepy"]);
    assert!(report.unresponsive.is_empty(), "{report:?}");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(fleet.has_exited("sleepy"));

    let err = fleet.shutdown(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, FleetError::ShutdownFailed(_)), "{err:?}");
}
