use super::{ResourceLimits, ServiceId, SiteId};
use crate::error::{HostplaneError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observed service state, driven by supervisor confirmations and exit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Failed,
    Unknown,
}

impl ServiceStatus {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;

        match (self, next) {
            (a, b) if a == b => true,
            (Stopped, Running) | (Stopped, Failed) | (Stopped, Unknown) => true,
            (Running, Stopped) | (Running, Failed) | (Running, Unknown) => true,
            // Recovery from failed happens only through an explicit start or stop
            (Failed, Running) | (Failed, Stopped) | (Failed, Unknown) => true,
            (Unknown, _) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Operator intent for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl DesiredState {
    pub fn matches(self, status: ServiceStatus) -> bool {
        matches!(
            (self, status),
            (DesiredState::Running, ServiceStatus::Running)
                | (DesiredState::Stopped, ServiceStatus::Stopped)
        )
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Running => write!(f, "running"),
            DesiredState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of the most recent install run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Uninstalled,
    Installed,
    Failed,
}

/// Runtime flavour of a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Node,
    Python,
    Php,
    Static,
    #[default]
    Generic,
}

/// Named shell invocation scoped to a service directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
    /// Wall-clock bound; falls back to the configured default
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Stop the service before running and leave it stopped
    #[serde(default)]
    pub requires_stop: bool,
    /// Only platform operators may run it
    #[serde(default)]
    pub dangerous: bool,
}

/// Supervised long-running process within a site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub site_id: SiteId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub kind: ServiceKind,
    pub start_command: String,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub desired: DesiredState,
    pub status: ServiceStatus,
    pub install_state: InstallState,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub custom_commands: Vec<CustomCommand>,
    /// Supervisor unit name
    pub unit: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: ServiceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HostplaneError::InvalidState(
                format!("service {}", self.name),
                format!("cannot move from {} to {}", self.status, next),
            ));
        }
        self.status = next;
        if next != ServiceStatus::Running {
            self.pid = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn find_command(&self, name: &str) -> Option<&CustomCommand> {
        self.custom_commands.iter().find(|c| c.name == name)
    }

    /// Supervisor unit name for a service of a given site
    pub fn unit_name(site_name: &str, service_name: &str) -> String {
        format!("{}-{}", site_name, service_name)
    }
}

/// Request to create a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub kind: ServiceKind,
    pub start_command: String,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    /// Explicit port; allocated from the site range when absent
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub custom_commands: Vec<CustomCommand>,
}

impl NewService {
    pub fn new(name: impl Into<String>, start_command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            kind: ServiceKind::Generic,
            start_command: start_command.into(),
            install_command: None,
            build_command: None,
            port: None,
            environment: BTreeMap::new(),
            auto_start: false,
            limits: ResourceLimits::default(),
            custom_commands: Vec::new(),
        }
    }
}

/// Editable service fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub auto_start: Option<bool>,
}
