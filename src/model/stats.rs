use super::{SampleId, ServiceId, ServiceStatus, SiteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of managed entities at sample time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub sites: usize,
    pub active_sites: usize,
    pub services: usize,
    pub running_services: usize,
    /// Distinct site owners
    pub users: usize,
}

/// Host-wide usage snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSample {
    pub id: SampleId,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub load_average: [f64; 3],
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_percent: f64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub uptime_secs: u64,
    pub counts: EntityCounts,
}

/// Per-site usage snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSample {
    pub id: SampleId,
    pub site_id: SiteId,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub services_total: usize,
    pub services_running: usize,
}

/// Live usage of one service, read from the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUsage {
    pub service_id: ServiceId,
    pub name: String,
    pub status: ServiceStatus,
    pub active: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub uptime_secs: u64,
}

/// Percentage helper that tolerates an empty total
pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
