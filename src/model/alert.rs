use super::{AlertId, ServiceId, SiteId};
use crate::error::{HostplaneError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Alert lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    /// Active and acknowledged alerts still absorb repeated triggers
    pub fn is_open(self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Active => write!(f, "active"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// What the alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    CpuHigh,
    MemoryHigh,
    DiskHigh,
    SiteMemoryHigh,
    ServiceFailed,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertType::CpuHigh => "cpu_high",
            AlertType::MemoryHigh => "memory_high",
            AlertType::DiskHigh => "disk_high",
            AlertType::SiteMemoryHigh => "site_memory_high",
            AlertType::ServiceFailed => "service_failed",
        };
        write!(f, "{}", s)
    }
}

/// Deduplicated, severity-graded notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    #[serde(default)]
    pub site_id: Option<SiteId>,
    #[serde(default)]
    pub service_id: Option<ServiceId>,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Triggers absorbed by this alert, including the first
    pub occurrences: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Whether this alert shares the dedup key
    pub fn same_key(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        site_id: Option<SiteId>,
        service_id: Option<ServiceId>,
    ) -> bool {
        self.alert_type == alert_type
            && self.severity == severity
            && self.site_id == site_id
            && self.service_id == service_id
    }

    pub fn acknowledge(&mut self, by: Option<String>) -> Result<()> {
        match self.status {
            AlertStatus::Active => {
                self.status = AlertStatus::Acknowledged;
                self.acknowledged_at = Some(Utc::now());
                self.acknowledged_by = by;
                Ok(())
            }
            AlertStatus::Acknowledged => Ok(()),
            AlertStatus::Resolved => Err(HostplaneError::InvalidState(
                format!("alert {}", self.id),
                "resolved alerts cannot be acknowledged".to_string(),
            )),
        }
    }

    pub fn resolve(&mut self) -> Result<()> {
        match self.status {
            AlertStatus::Active | AlertStatus::Acknowledged => {
                self.status = AlertStatus::Resolved;
                self.resolved_at = Some(Utc::now());
                Ok(())
            }
            AlertStatus::Resolved => Ok(()),
        }
    }
}

/// Filter for alert listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    #[serde(default)]
    pub status: Option<AlertStatus>,
    #[serde(default)]
    pub severity: Option<AlertSeverity>,
    #[serde(default)]
    pub alert_type: Option<AlertType>,
    #[serde(default)]
    pub site_id: Option<SiteId>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.status.map_or(true, |s| alert.status == s)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.site_id.map_or(true, |id| alert.site_id == Some(id))
    }
}
