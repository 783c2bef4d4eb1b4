// Model module - Persisted entities and their state machines

pub mod alert;
pub mod service;
pub mod site;
pub mod stats;

use crate::error::{HostplaneError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use alert::{Alert, AlertFilter, AlertSeverity, AlertStatus, AlertType};
pub use service::{
    CustomCommand, DesiredState, InstallState, NewService, Service, ServiceKind, ServiceStatus,
    ServiceUpdate,
};
pub use site::{NewSite, PortRange, Site, SiteStatus, SiteUpdate};
pub use stats::{EntityCounts, ServerSample, ServiceUsage, SiteSample};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn parse(value: &str) -> Option<Self> {
                uuid::Uuid::parse_str(value).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a site
    SiteId
);
entity_id!(
    /// Unique identifier for a service
    ServiceId
);
entity_id!(
    /// Unique identifier for an alert
    AlertId
);
entity_id!(
    /// Unique identifier for a stats sample
    SampleId
);

/// Resource limits requested for a site or a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in megabytes
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// CPU ceiling as a percentage of one core (200 = two cores)
    #[serde(default)]
    pub cpu_percent: Option<u32>,

    /// Maximum number of processes
    #[serde(default)]
    pub max_processes: Option<u32>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none() && self.cpu_percent.is_none() && self.max_processes.is_none()
    }

    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory_mb.map(|mb| mb * 1024 * 1024)
    }
}

/// Privilege of the caller issuing an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerRole {
    /// Site owner
    #[default]
    Owner,
    /// Platform operator
    Admin,
}

/// Validate a slug used for site, service and custom command names
pub fn validate_slug(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(HostplaneError::Validation(format!(
            "Invalid {} name '{}': use 1-63 lowercase letters, digits or '-'",
            kind, value
        )))
    }
}

/// Validate environment variable names
pub fn validate_environment(env: &BTreeMap<String, String>) -> Result<()> {
    for key in env.keys() {
        let mut chars = key.chars();
        let valid_head = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !valid_head || !valid_tail {
            return Err(HostplaneError::Validation(format!(
                "Invalid environment variable name: '{}'",
                key
            )));
        }

        if key == "PORT" {
            return Err(HostplaneError::Validation(
                "PORT is assigned by the platform and cannot be overridden".to_string(),
            ));
        }
    }
    Ok(())
}
