// IPC module - Communication between the CLI and the daemon

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Command, Envelope, Request, Response};
pub use server::IpcServer;
