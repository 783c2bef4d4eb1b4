// Probe module - Host resource readings

use crate::error::{HostplaneError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Disks, Networks, System};

/// Raw host readings, before counts and percentages are attached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub cpu_percent: f64,
    pub load_average: [f64; 3],
    pub memory_total: u64,
    pub memory_used: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub uptime_secs: u64,
}

/// Source of host metrics. Calls may block; the collector runs them off the
/// async workers.
pub trait HostProbe: Send + Sync {
    fn sample(&self) -> Result<HostSnapshot>;

    /// Bytes used by everything under `path`
    fn path_usage(&self, path: &Path) -> Result<u64>;
}

/// Probe backed by sysinfo
pub struct SysinfoProbe {
    system: Mutex<System>,
    networks: Mutex<Networks>,
    /// Disk reported is the one holding this path
    disk_path: PathBuf,
}

impl SysinfoProbe {
    pub fn new<P: AsRef<Path>>(disk_path: P) -> Self {
        let mut system = System::new();
        // First CPU reading is only meaningful relative to a previous one
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            system: Mutex::new(system),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            disk_path: disk_path.as_ref().to_path_buf(),
        }
    }

    fn disk_usage(&self) -> (u64, u64) {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| self.disk_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| {
                let total = d.total_space();
                (total, total.saturating_sub(d.available_space()))
            })
            .unwrap_or((0, 0))
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self) -> Result<HostSnapshot> {
        let (cpu_percent, memory_total, memory_used) = {
            let mut system = self.system.lock().map_err(poisoned)?;
            system.refresh_cpu_usage();
            system.refresh_memory();

            let cpus = system.cpus();
            let cpu = if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() as f64 / cpus.len() as f64
            };
            (cpu, system.total_memory(), system.used_memory())
        };

        let (network_rx_bytes, network_tx_bytes) = {
            let mut networks = self.networks.lock().map_err(poisoned)?;
            networks.refresh();
            networks.list().iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (
                    rx.saturating_add(data.total_received()),
                    tx.saturating_add(data.total_transmitted()),
                )
            })
        };

        let (disk_total, disk_used) = self.disk_usage();
        let load = System::load_average();

        Ok(HostSnapshot {
            cpu_percent,
            load_average: [load.one, load.five, load.fifteen],
            memory_total,
            memory_used,
            disk_total,
            disk_used,
            network_rx_bytes,
            network_tx_bytes,
            uptime_secs: System::uptime(),
        })
    }

    fn path_usage(&self, path: &Path) -> Result<u64> {
        if !path.exists() {
            return Ok(0);
        }
        dir_size(path)
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0u64;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        // Entries can vanish while we walk
        match dir_size(&entry.path()) {
            Ok(size) => total = total.saturating_add(size),
            Err(HostplaneError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> HostplaneError {
    HostplaneError::Internal("probe lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sample_has_memory() {
        let probe = SysinfoProbe::new("/");
        let snapshot = probe.sample().unwrap();
        assert!(snapshot.memory_total > 0);
        assert!(snapshot.memory_used <= snapshot.memory_total);
        assert!(snapshot.cpu_percent >= 0.0);
    }

    #[test]
    fn test_path_usage_sums_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("b"), vec![0u8; 50]).unwrap();

        let probe = SysinfoProbe::new(dir.path());
        assert_eq!(probe.path_usage(dir.path()).unwrap(), 150);
        assert_eq!(probe.path_usage(&dir.path().join("missing")).unwrap(), 0);
    }
}
