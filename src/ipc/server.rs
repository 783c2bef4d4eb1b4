// IPC Server - Accepts client connections and dispatches commands

use crate::error::{HostplaneError, Result};
use crate::ipc::{Command, Envelope, Request, Response};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Unix socket server speaking newline-delimited JSON
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the socket, replacing a stale one, and restrict it to the owner
    pub fn bind(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                HostplaneError::IpcError(format!("Failed to remove existing socket: {}", e))
            })?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| HostplaneError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                HostplaneError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        info!("Listening on {}", self.socket_path.display());
        self.listener = Some(listener);
        Ok(())
    }

    /// Serve connections until `shutdown` resolves
    pub async fn run<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Envelope> + Send,
        S: Future<Output = ()>,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| HostplaneError::IpcError("Server not bound".to_string()))?;
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handler).await {
                            debug!("Connection closed with error: {}", e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("IPC server shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Remove the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                HostplaneError::IpcError(format!("Failed to remove socket file: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Socket cleanup failed: {}", e);
        }
    }
}

async fn serve_connection<F, Fut>(stream: UnixStream, handler: Arc<F>) -> Result<()>
where
    F: Fn(Command) -> Fut + Send + Sync,
    Fut: Future<Output = Envelope> + Send,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| HostplaneError::IpcError(format!("Failed to read request: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => Response::new(request.id, handler(request.command).await),
            Err(e) => {
                warn!("Malformed request: {}", e);
                Response::new(
                    0,
                    Envelope::from_error(&HostplaneError::Validation(format!(
                        "Malformed request: {}",
                        e
                    ))),
                )
            }
        };

        let mut payload = serde_json::to_string(&response).map_err(|e| {
            HostplaneError::SerializationError(format!("Failed to serialize response: {}", e))
        })?;
        payload.push('\n');
        write_half
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| HostplaneError::IpcError(format!("Failed to write response: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| HostplaneError::IpcError(format!("Failed to flush stream: {}", e)))?;
    }

    Ok(())
}
