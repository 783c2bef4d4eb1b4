use super::{ResourceLimits, SiteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Site lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Pending,
    Creating,
    Active,
    Stopped,
    Error,
    Deleting,
    Deleted,
}

impl SiteStatus {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SiteStatus) -> bool {
        use SiteStatus::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (Pending, Creating) | (Pending, Error) => true,
            (Creating, Active) | (Creating, Error) => true,
            (Active, Stopped) | (Active, Error) | (Active, Deleting) => true,
            (Stopped, Active) | (Stopped, Error) | (Stopped, Deleting) => true,
            (Error, Active) | (Error, Stopped) | (Error, Deleting) => true,
            (Deleting, Deleted) | (Deleting, Error) => true,
            (Deleted, _) => false,
            _ => false,
        }
    }

    /// Whether the site still holds its port range
    pub fn holds_ports(self) -> bool {
        self != SiteStatus::Deleted
    }

    /// Whether services can be created or started in this site
    pub fn accepts_services(self) -> bool {
        matches!(
            self,
            SiteStatus::Active | SiteStatus::Stopped | SiteStatus::Error
        )
    }
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SiteStatus::Pending => "pending",
            SiteStatus::Creating => "creating",
            SiteStatus::Active => "active",
            SiteStatus::Stopped => "stopped",
            SiteStatus::Error => "error",
            SiteStatus::Deleting => "deleting",
            SiteStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// Half-open port range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// Tenant workspace owning services, a port range and domains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub status: SiteStatus,
    pub owner: String,
    pub port_range: PortRange,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub root: PathBuf,
    #[serde(default)]
    pub account: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Request to create a site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSite {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub owner: String,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    /// Number of ports to reserve; defaults to the configured width
    #[serde(default)]
    pub port_count: Option<u16>,
}

impl NewSite {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            description: String::new(),
            owner: owner.into(),
            limits: None,
            port_count: None,
        }
    }
}

/// Editable site metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
