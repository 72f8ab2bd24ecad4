//! Control socket client
//!
//! One request per connection: write a JSON line, read one JSON line back.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use sbc_sidecar_core::runtime_config::{ControlRequest, ControlResponse};

pub struct ControlClient {
    path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Send a request and wait for its response, giving up after the timeout
    pub async fn send(&self, request: &ControlRequest) -> Result<ControlResponse> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| anyhow!("Command timed out"))?
    }

    async fn exchange(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| anyhow!("Connection failed: {}", e))?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| anyhow!("Connection failed: {}", e))?;

        let mut response = String::new();
        BufReader::new(reader)
            .read_line(&mut response)
            .await
            .map_err(|e| anyhow!("Connection failed: {}", e))?;
        let _ = writer.shutdown().await;

        serde_json::from_str(response.trim()).map_err(|_| anyhow!("Invalid response from server"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::UnixListener;

    /// Accept one connection, read its request line and answer with `reply`
    fn serve_once(listener: UnixListener, reply: &'static str) -> tokio::task::JoinHandle<String> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut request = String::new();
            BufReader::new(reader).read_line(&mut request).await.unwrap();
            writer.write_all(reply.as_bytes()).await.unwrap();
            request
        })
    }

    #[tokio::test]
    async fn request_and_response_are_single_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbc.sock");
        let server = serve_once(
            UnixListener::bind(&path).unwrap(),
            "{\"success\":true,\"available\":[\"10.0.0.1\"]}\n",
        );

        let client = ControlClient::new(path, Duration::from_secs(5));
        let response = client.send(&ControlRequest::FsAvailable).await.unwrap();
        assert!(response.success);
        assert_eq!(response.field::<Vec<String>>("available"), Some(vec!["10.0.0.1".to_string()]));

        assert_eq!(server.await.unwrap(), "{\"action\":\"fs-available\"}\n");
    }

    #[tokio::test]
    async fn garbage_reply_is_an_invalid_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbc.sock");
        let _server = serve_once(UnixListener::bind(&path).unwrap(), "not json\n");

        let client = ControlClient::new(path, Duration::from_secs(5));
        let err = client.send(&ControlRequest::List).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid response from server");
    }

    #[tokio::test]
    async fn missing_socket_is_a_connection_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(dir.path().join("absent.sock"), Duration::from_secs(5));
        let err = client.send(&ControlRequest::List).await.unwrap_err();
        assert!(err.to_string().starts_with("Connection failed: "));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = ControlClient::new(path, Duration::from_millis(100));
        let err = client.send(&ControlRequest::List).await.unwrap_err();
        assert_eq!(err.to_string(), "Command timed out");
    }
}
