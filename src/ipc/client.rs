// IPC Client - Talks to the daemon over its Unix socket

use crate::error::{HostplaneError, Result};
use crate::ipc::{Command, Envelope, Request, Response};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of connection attempts before giving up
const MAX_CONNECT_ATTEMPTS: u32 = 3;

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Blocking client for the control plane socket
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and wait for its envelope.
    ///
    /// Only connecting is retried; once a request is written it is never resent.
    pub fn send(&self, command: Command) -> Result<Envelope> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let mut stream = self.connect_with_retry()?;

        let line = serde_json::to_string(&request).map_err(|e| {
            HostplaneError::SerializationError(format!("Failed to serialize request: {}", e))
        })?;
        writeln!(stream, "{}", line)
            .map_err(|e| HostplaneError::IpcError(format!("Failed to write request: {}", e)))?;
        stream
            .flush()
            .map_err(|e| HostplaneError::IpcError(format!("Failed to flush stream: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .map_err(|e| HostplaneError::IpcError(format!("Failed to read response: {}", e)))?;
        if response_line.trim().is_empty() {
            return Err(HostplaneError::ProtocolError(
                "Daemon closed the connection without a response".to_string(),
            ));
        }

        let response: Response = serde_json::from_str(&response_line).map_err(|e| {
            HostplaneError::DeserializationError(format!("Failed to deserialize response: {}", e))
        })?;

        if response.id != request_id {
            return Err(HostplaneError::ProtocolError(format!(
                "Response ID mismatch: expected {}, got {}",
                request_id, response.id
            )));
        }

        Ok(response.envelope)
    }

    fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut last_error = None;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match self.connect() {
                Ok(stream) => return Ok(stream),
                Err(HostplaneError::DaemonNotRunning) => return Err(HostplaneError::DaemonNotRunning),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            HostplaneError::ConnectionError("Failed to connect after retries".to_string())
        }))
    }

    fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(HostplaneError::DaemonNotRunning);
        }

        UnixStream::connect(&self.socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                HostplaneError::DaemonNotRunning
            } else {
                HostplaneError::ConnectionError(format!("Failed to connect to daemon: {}", e))
            }
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_with_custom_path() {
        let client = IpcClient::new("/tmp/custom-hostplane.sock");
        assert_eq!(client.socket_path(), Path::new("/tmp/custom-hostplane.sock"));
    }

    #[test]
    fn test_daemon_not_running_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::new(dir.path().join("missing.sock"));
        match client.send(Command::Ping) {
            Err(HostplaneError::DaemonNotRunning) => {}
            other => panic!("Expected DaemonNotRunning, got: {:?}", other),
        }
    }
}
