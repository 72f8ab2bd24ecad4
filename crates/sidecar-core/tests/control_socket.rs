//! Control socket end-to-end tests

#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use common::Harness;
use sbc_sidecar_core::runtime_config::{ControlHandler, ControlServer, FeatureServerConfig, RuntimeConfig};
use sbc_sidecar_core::store::KeyValueStore;

fn control_handler(harness: &Harness) -> ControlHandler {
    let config = RuntimeConfig::spawn();
    let servers = FeatureServerConfig::new(harness.store.clone(), harness.keys.clone(), config.clone());
    ControlHandler::new(config, servers)
}

/// Send each line and collect one response per line
async fn exchange(path: &Path, lines: &[&str]) -> Vec<Value> {
    let stream = UnixStream::connect(path).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).lines();

    let mut responses = Vec::new();
    for line in lines {
        writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        let response = reader.next_line().await.unwrap().unwrap();
        responses.push(serde_json::from_str(&response).unwrap());
    }
    responses
}

#[tokio::test]
async fn test_requests_are_answered_in_order() {
    let harness = Harness::new();
    harness.store.add_to_set("test:active-fs", "10.0.0.10").await.unwrap();
    harness.store.add_to_set("test:active-fs", "10.0.0.11").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sbc.sock");
    let server = ControlServer::bind(&path, control_handler(&harness)).unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server.run(cancel.clone()));

    let responses = exchange(
        &path,
        &[
            r#"{"action":"fs-drain","server":"10.0.0.10"}"#,
            r#"{"action":"fs-available"}"#,
            r#"{"action":"launch"}"#,
            "{broken",
        ],
    )
    .await;

    assert_eq!(responses[0]["success"], Value::Bool(true));
    assert_eq!(responses[0]["drained"], serde_json::json!(["10.0.0.10"]));
    assert_eq!(responses[1]["available"], serde_json::json!(["10.0.0.11"]));
    assert_eq!(responses[2]["success"], Value::Bool(false));
    assert_eq!(responses[2]["error"], "Unknown action");
    assert_eq!(responses[3]["error"], "Invalid command");

    cancel.cancel();
    task.await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_socket_is_owner_only_and_replaces_stale_file() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sbc.sock");
    std::fs::write(&path, b"stale").unwrap();

    let server = ControlServer::bind(&path, control_handler(&harness)).unwrap();
    assert_eq!(server.path(), path.as_path());

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

/// Blank lines are skipped rather than answered
#[tokio::test]
async fn test_blank_lines_are_ignored() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sbc.sock");
    let server = ControlServer::bind(&path, control_handler(&harness)).unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server.run(cancel.clone()));

    let stream = UnixStream::connect(&path).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(b"\n  \n{\"action\":\"list\"}\n")
        .await
        .unwrap();
    let line = BufReader::new(reader).lines().next_line().await.unwrap().unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["success"], Value::Bool(true));
    assert_eq!(response["config"], serde_json::json!({}));

    cancel.cancel();
    task.await.unwrap();
}
