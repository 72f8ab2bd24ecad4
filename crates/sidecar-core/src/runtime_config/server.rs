//! Unix-socket listener for the control protocol

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ControlHandler;
use crate::error::Result;

pub struct ControlServer {
    path: PathBuf,
    listener: UnixListener,
    handler: Arc<ControlHandler>,
}

impl ControlServer {
    /// Bind the socket, replacing any stale socket file, and restrict it to
    /// the owner.
    pub fn bind(path: impl AsRef<Path>, handler: ControlHandler) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        info!(socket_path = %path.display(), "CLI server started");

        Ok(Self {
            path,
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve connections until cancelled, then remove the socket file
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = self.handler.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler, cancel).await {
                                error!("Socket error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Server error: {}", e),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove control socket: {}", e);
        }
        info!("CLI server stopped");
    }
}

/// Answer each request line in order on one connection
async fn serve_connection(stream: UnixStream, handler: Arc<ControlHandler>, cancel: CancellationToken) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = handler.handle_line(line).await;
        let mut out = response.to_line();
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}
