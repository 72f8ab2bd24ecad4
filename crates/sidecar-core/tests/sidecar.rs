//! Whole-process wiring: start, serve, shut down

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{outbound_gateway, register_carrier, Harness};
use sbc_sidecar_core::config::SidecarConfig;
use sbc_sidecar_core::error::SidecarError;
use sbc_sidecar_core::sidecar::parse_hostports;
use sbc_sidecar_core::sip::{InboundRequest, SipMethod};
use sbc_sidecar_core::telemetry::AlertKind;
use sbc_sidecar_core::{MemoryRegistrar, Sidecar};

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_sidecar_lifecycle() {
    let harness = Harness::new();
    harness.directory.upsert_carrier(register_carrier("c1", "alice", "secret"));
    harness
        .directory
        .upsert_gateway(outbound_gateway("g1", "c1", "198.51.100.10"));

    let dir = tempfile::tempdir().unwrap();
    let mut config = SidecarConfig::default();
    config.socket_path = dir.path().join("sbc.sock");
    config.regbot.max_initial_delay = Duration::ZERO;
    config.shutdown_grace = Duration::from_secs(2);

    let mut sidecar = Sidecar::new(config.clone(), harness.services(), Arc::new(MemoryRegistrar::new()))
        .with_sbc_addresses(parse_hostports("udp/203.0.113.5:5060,tls/203.0.113.5:5061"));
    sidecar.start().await.unwrap();
    assert!(config.socket_path.exists());

    let monitor = sidecar.monitor().unwrap();
    assert!(wait_for(|| monitor.regbot_snapshots().len() == 1).await);
    assert!(monitor.is_active());
    assert!(wait_for(|| harness.directory.sbc_addresses().len() == 1).await);
    assert_eq!(harness.directory.sbc_addresses()[0].tls_port, Some(5061));

    let reply = sidecar
        .presence()
        .handle_options(
            &InboundRequest::new(SipMethod::Options, "10.0.0.5", 5070).with_header("X-FS-Status", "open"),
        )
        .await;
    assert_eq!(reply.header("X-Members"), Some("1"));

    sidecar.shutdown().await;
    assert_eq!(harness.alerts.of_kind(AlertKind::SystemDown).len(), 1);
    assert!(wait_for(|| !config.socket_path.exists()).await);
    assert!(monitor.regbot_snapshots().is_empty());
}

fn test_config(dir: &tempfile::TempDir) -> SidecarConfig {
    let mut config = SidecarConfig::default();
    config.socket_path = dir.path().join("sbc.sock");
    config.regbot.max_initial_delay = Duration::ZERO;
    config.shutdown_grace = Duration::from_secs(2);
    config
}

/// A worker that panics takes the sidecar down with an alert and an error
#[tokio::test]
async fn test_panicking_worker_is_fatal() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let mut sidecar = Sidecar::new(config.clone(), harness.services(), Arc::new(MemoryRegistrar::new()));
    sidecar.spawn_worker(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        panic!("worker blew up");
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        sidecar.run_until(std::future::pending::<Result<(), SidecarError>>()),
    )
    .await
    .expect("a dead worker ends the run");

    let err = result.unwrap_err();
    assert!(err.to_string().contains("background task failed"), "{}", err);

    let alerts = harness.alerts.of_kind(AlertKind::SystemDown);
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].message.contains("failed"));
    assert!(wait_for(|| !config.socket_path.exists()).await);
}

/// A worker returning before shutdown is just as fatal as one panicking
#[tokio::test]
async fn test_worker_exiting_early_is_fatal() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();

    let mut sidecar = Sidecar::new(test_config(&dir), harness.services(), Arc::new(MemoryRegistrar::new()));
    sidecar.spawn_worker(async {});

    let err = sidecar.run_until(std::future::pending::<Result<(), SidecarError>>()).await.unwrap_err();
    assert!(err.to_string().contains("exited unexpectedly"), "{}", err);
    assert_eq!(harness.alerts.of_kind(AlertKind::SystemDown).len(), 1);
}

#[tokio::test]
async fn test_requested_shutdown_is_clean() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();

    let sidecar = Sidecar::new(test_config(&dir), harness.services(), Arc::new(MemoryRegistrar::new()));
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<(), SidecarError>(())
    };
    sidecar.run_until(shutdown).await.unwrap();

    let alerts = harness.alerts.of_kind(AlertKind::SystemDown);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].message, "sbc-sip-sidecar is shutting down");
}

/// Periods that would make the tickers panic are refused before anything is spawned
#[tokio::test]
async fn test_zero_interval_is_refused_at_start() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.presence.check_interval = Duration::ZERO;

    let mut sidecar = Sidecar::new(config.clone(), harness.services(), Arc::new(MemoryRegistrar::new()));
    let err = sidecar.start().await.unwrap_err();
    assert!(matches!(err, SidecarError::Config { .. }));
    assert!(!config.socket_path.exists());
}
