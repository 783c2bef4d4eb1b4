use crate::error::{HostplaneError, Result};
use crate::model::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything a supervisor needs to run one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    /// Site environment overlaid with service environment, then PORT
    pub env: BTreeMap<String, String>,
    pub port: u16,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub user: Option<String>,
    pub stop_signal: String,
    pub stop_timeout_secs: u64,
}

impl UnitDescriptor {
    /// Merge environments; service keys win, PORT always reflects the assignment
    pub fn merged_env(
        site: &BTreeMap<String, String>,
        service: &BTreeMap<String, String>,
        port: u16,
    ) -> BTreeMap<String, String> {
        let mut env = site.clone();
        env.extend(service.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("PORT".to_string(), port.to_string());
        env
    }
}

/// Point-in-time view of a unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub active: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub exit_code: Option<i32>,
}

/// Unexpected termination of a unit nobody asked to stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitExit {
    pub unit: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub oom: bool,
}

/// Process supervisor backing the service lifecycle
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Create or replace the unit definition
    async fn install_unit(&self, unit: &UnitDescriptor) -> Result<()>;

    /// Stop the unit if needed and forget it
    async fn remove_unit(&self, name: &str) -> Result<()>;

    /// Start the unit; starting an active unit is a no-op
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop the unit; `force` skips the grace period
    async fn stop(&self, name: &str, force: bool) -> Result<()>;

    async fn status(&self, name: &str) -> Result<UnitStatus>;

    /// Drain exits observed since the last call
    async fn poll_exits(&self) -> Result<Vec<UnitExit>>;
}

/// Parse a signal name as accepted in configuration
#[cfg(unix)]
pub fn parse_signal(signal_name: &str) -> Result<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;

    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(HostplaneError::Validation(format!(
            "Unsupported stop signal: {}",
            signal_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_env_precedence() {
        let mut site = BTreeMap::new();
        site.insert("NODE_ENV".to_string(), "production".to_string());
        site.insert("SHARED".to_string(), "site".to_string());
        let mut service = BTreeMap::new();
        service.insert("SHARED".to_string(), "service".to_string());

        let env = UnitDescriptor::merged_env(&site, &service, 4001);
        assert_eq!(env["NODE_ENV"], "production");
        assert_eq!(env["SHARED"], "service");
        assert_eq!(env["PORT"], "4001");
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_signal() {
        assert!(parse_signal("SIGTERM").is_ok());
        assert!(parse_signal("SIGFOO").is_err());
    }
}
