// Limits module - cgroup v2 resource limits for supervised units

use crate::error::{HostplaneError, Result};
use crate::model::ResourceLimits;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CGROUP_BASE: &str = "/sys/fs/cgroup";
const CGROUP_PARENT: &str = "hostplane";
const CPU_PERIOD_USEC: u64 = 100_000;

/// Per-unit cgroup
#[derive(Debug)]
pub struct UnitCgroup {
    path: PathBuf,
    unit: String,
}

impl UnitCgroup {
    pub fn new(unit: &str) -> Self {
        Self {
            path: PathBuf::from(CGROUP_BASE).join(CGROUP_PARENT).join(unit),
            unit: unit.to_string(),
        }
    }

    /// Check if cgroups v2 is available
    pub fn is_available() -> bool {
        Path::new(CGROUP_BASE).join("cgroup.controllers").exists()
    }

    fn setup(&self) -> Result<()> {
        if !Self::is_available() {
            return Err(limit_error("cgroups v2 not available on this system"));
        }

        let parent = PathBuf::from(CGROUP_BASE).join(CGROUP_PARENT);
        if !parent.exists() {
            fs::create_dir(&parent).map_err(|e| {
                limit_error(&format!(
                    "Failed to create {} cgroup: {}. You may need root privileges.",
                    CGROUP_PARENT, e
                ))
            })?;

            fs::write(parent.join("cgroup.subtree_control"), "+cpu +memory +pids")
                .map_err(|e| limit_error(&format!("Failed to enable controllers: {}", e)))?;
        }

        if !self.path.exists() {
            fs::create_dir(&self.path)
                .map_err(|e| limit_error(&format!("Failed to create cgroup: {}", e)))?;
        }

        Ok(())
    }

    /// Move `pid` into the unit cgroup and write its limits
    pub fn apply(&self, pid: u32, limits: &ResourceLimits) -> Result<()> {
        self.setup()?;

        if let Some(cpu) = limits.cpu_percent {
            // "$QUOTA $PERIOD": 50% is 50ms out of every 100ms
            let quota = (CPU_PERIOD_USEC * cpu as u64) / 100;
            self.write("cpu.max", &format!("{} {}", quota, CPU_PERIOD_USEC))?;
        }
        if let Some(bytes) = limits.memory_bytes() {
            self.write("memory.max", &bytes.to_string())?;
        }
        if let Some(procs) = limits.max_processes {
            self.write("pids.max", &procs.to_string())?;
        }

        self.write("cgroup.procs", &pid.to_string())?;

        info!(
            "Applied limits to unit {} (PID: {}): {:?}",
            self.unit, pid, limits
        );

        Ok(())
    }

    /// Whether the kernel OOM killer fired inside this cgroup
    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|events| parse_oom_kills(&events) > 0)
            .unwrap_or(false)
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(file), value)
            .map_err(|e| limit_error(&format!("Failed to write {}: {}", file, e)))
    }

    /// Remove the cgroup directory once the unit has no processes left
    pub fn cleanup(&self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_dir(&self.path) {
                warn!("Failed to remove cgroup for {}: {}", self.unit, e);
            }
        }
    }
}

impl Drop for UnitCgroup {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn limit_error(detail: &str) -> HostplaneError {
    HostplaneError::Internal(format!("resource limits: {}", detail))
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.strip_prefix("oom_kill "))
        .filter_map(|n| n.trim().parse().ok())
        .next()
        .unwrap_or(0)
}
