// Integration test for IPC client

use hostplane::error::HostplaneError;
use hostplane::ipc::{Command, IpcClient};
use tempfile::TempDir;

#[test]
fn test_client_daemon_not_running() {
    let dir = TempDir::new().unwrap();
    let client = IpcClient::new(dir.path().join("absent.sock"));
    let result = client.send(Command::Ping);

    match result {
        Err(HostplaneError::DaemonNotRunning) => {}
        other => panic!("Expected DaemonNotRunning error, got: {:?}", other),
    }
}

#[test]
fn test_client_stale_socket_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stale.sock");
    // A listener that is gone leaves its socket file behind
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

    let result = IpcClient::new(&path).send(Command::Ping);
    assert!(matches!(result, Err(HostplaneError::DaemonNotRunning)));
}

#[test]
fn test_client_socket_path() {
    let custom_path = "/tmp/custom-hostplane-test.sock";
    let client = IpcClient::new(custom_path);
    assert_eq!(client.socket_path().to_str().unwrap(), custom_path);
}
