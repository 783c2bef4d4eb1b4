// IPC Protocol definitions for client-daemon communication

use crate::error::{ErrorCode, HostplaneError};
use crate::model::{
    AlertFilter, AlertId, CallerRole, CustomCommand, NewService, NewSite, ServiceUpdate,
    SiteUpdate,
};
use crate::stats::MonitoringUpdate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All operations the control plane accepts.
///
/// `site` fields take a site id or name. `service` fields take a service id
/// or `site/service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    // Sites
    CreateSite(NewSite),
    GetSite {
        site: String,
    },
    ListSites {
        #[serde(default)]
        include_deleted: bool,
    },
    UpdateSite {
        site: String,
        update: SiteUpdate,
    },
    DeleteSite {
        site: String,
        #[serde(default)]
        force: bool,
    },
    StartSite {
        site: String,
    },
    StopSite {
        site: String,
    },
    RestartSite {
        site: String,
    },
    AddDomain {
        site: String,
        domain: String,
    },
    RemoveDomain {
        site: String,
        domain: String,
    },
    SetSiteEnvironment {
        site: String,
        environment: BTreeMap<String, String>,
    },

    // Services
    CreateService {
        site: String,
        service: NewService,
    },
    GetService {
        service: String,
    },
    ListServices {
        #[serde(default)]
        site: Option<String>,
    },
    UpdateService {
        service: String,
        update: ServiceUpdate,
    },
    DeleteService {
        service: String,
        #[serde(default)]
        force: bool,
    },
    StartService {
        service: String,
    },
    StopService {
        service: String,
    },
    RestartService {
        service: String,
    },
    ServiceStatus {
        service: String,
    },
    ServiceHealth {
        service: String,
    },
    InstallService {
        service: String,
    },
    BuildService {
        service: String,
    },
    SetServiceEnvironment {
        service: String,
        environment: BTreeMap<String, String>,
    },
    ListCommands {
        service: String,
    },
    AddCommand {
        service: String,
        command: CustomCommand,
    },
    RemoveCommand {
        service: String,
        name: String,
    },
    ExecuteCommand {
        service: String,
        name: String,
        #[serde(default)]
        role: CallerRole,
    },

    // Stats and alerts
    ServerStats,
    ServerHistory {
        hours: u32,
        #[serde(default)]
        limit: Option<usize>,
    },
    SiteStats {
        site: String,
    },
    SiteHistory {
        site: String,
        hours: u32,
        #[serde(default)]
        limit: Option<usize>,
    },
    SiteServicesStats {
        site: String,
    },
    ListAlerts {
        #[serde(default)]
        filter: AlertFilter,
    },
    AcknowledgeAlert {
        alert_id: AlertId,
        #[serde(default)]
        by: Option<String>,
    },
    ResolveAlert {
        alert_id: AlertId,
    },
    GetMonitoringConfig,
    UpdateMonitoringConfig(MonitoringUpdate),
    CollectorMetrics,

    /// Liveness probe for the daemon
    Ping,
}

/// Result wrapper returned for every command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl Envelope {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                data: Some(value),
                message: None,
                error: None,
                code: None,
            },
            Err(e) => Self::from_error(&HostplaneError::SerializationError(e.to_string())),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn failure(error: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(error.into()),
            code,
        }
    }

    pub fn from_error(err: &HostplaneError) -> Self {
        Self::failure(err.public_message(), Some(err.code()))
    }

    /// Decode the payload of a successful envelope
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, HostplaneError> {
        let value = self.data.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
            .map_err(|e| HostplaneError::DeserializationError(e.to_string()))
    }
}

/// Request message from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub envelope: Envelope,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn new(id: u64, envelope: Envelope) -> Self {
        Self { id, envelope }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_format() {
        let command = Command::DeleteSite {
            site: "demo".to_string(),
            force: true,
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value, json!({"op": "delete_site", "site": "demo", "force": true}));

        let parsed: Command = serde_json::from_value(json!({"op": "stop_site", "site": "demo"})).unwrap();
        assert!(matches!(parsed, Command::StopSite { site } if site == "demo"));
    }

    #[test]
    fn test_optional_fields_default() {
        let parsed: Command =
            serde_json::from_value(json!({"op": "delete_service", "service": "demo/web"})).unwrap();
        assert!(matches!(parsed, Command::DeleteService { force: false, .. }));

        let parsed: Command =
            serde_json::from_value(json!({"op": "server_history", "hours": 6})).unwrap();
        assert!(matches!(parsed, Command::ServerHistory { hours: 6, limit: None }));
    }

    #[test]
    fn test_success_envelope_shape() {
        let envelope = Envelope::ok(&json!({"name": "demo"})).with_message("Site created");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"success": true, "data": {"name": "demo"}, "message": "Site created"})
        );
    }

    #[test]
    fn test_failure_envelope_shape() {
        let envelope = Envelope::from_error(&HostplaneError::ResourceExhausted(
            "no free port range".to_string(),
        ));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["code"], json!("RESOURCE_EXHAUSTED"));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_request_roundtrip() {
        let request = Request::new(7, Command::Ping);
        let line = serde_json::to_string(&request).unwrap();
        let parsed: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, 7);
        assert!(matches!(parsed.command, Command::Ping));
    }
}
