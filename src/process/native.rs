use super::limits::UnitCgroup;
use super::monitor::ProcessMonitor;
use super::supervisor::{Supervisor, UnitDescriptor, UnitExit, UnitStatus};
use crate::error::{HostplaneError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

struct UnitEntry {
    descriptor: UnitDescriptor,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    cgroup: Option<UnitCgroup>,
    last_exit: Option<i32>,
}

impl UnitEntry {
    fn new(descriptor: UnitDescriptor) -> Self {
        Self {
            descriptor,
            child: None,
            pid: None,
            started_at: None,
            cgroup: None,
            last_exit: None,
        }
    }

    /// Reap the child if it exited on its own
    fn reap(&mut self) -> Option<UnitExit> {
        let status = match self.child.as_mut()?.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("try_wait failed for unit {}: {}", self.descriptor.name, e);
                return None;
            }
        };

        self.child = None;
        self.pid = None;
        self.started_at = None;
        self.last_exit = status.code();
        let oom = self.cgroup.take().map(|c| c.oom_killed()).unwrap_or(false);

        Some(UnitExit {
            unit: self.descriptor.name.clone(),
            code: status.code(),
            signal: exit_signal(&status),
            oom,
        })
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// In-process supervisor: unit descriptors as JSON files, children spawned
/// through `/bin/sh -c` with output appended to `<unit>.log`.
pub struct NativeSupervisor {
    units_dir: PathBuf,
    units: Mutex<HashMap<String, UnitEntry>>,
    exits: StdMutex<Vec<UnitExit>>,
    monitor: StdMutex<ProcessMonitor>,
}

impl NativeSupervisor {
    /// Open the units directory, loading previously installed descriptors
    pub fn new<P: AsRef<Path>>(units_dir: P) -> Result<Self> {
        let units_dir = units_dir.as_ref().to_path_buf();
        fs::create_dir_all(&units_dir)?;

        let mut units = HashMap::new();
        for entry in fs::read_dir(&units_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(HostplaneError::from)
                .and_then(|raw| {
                    serde_json::from_str::<UnitDescriptor>(&raw)
                        .map_err(|e| HostplaneError::DeserializationError(e.to_string()))
                }) {
                Ok(descriptor) => {
                    units.insert(descriptor.name.clone(), UnitEntry::new(descriptor));
                }
                Err(e) => tracing::warn!("Skipping unit file {}: {}", path.display(), e),
            }
        }

        tracing::info!(
            "Native supervisor loaded {} units from {}",
            units.len(),
            units_dir.display()
        );

        Ok(Self {
            units_dir,
            units: Mutex::new(units),
            exits: StdMutex::new(Vec::new()),
            monitor: StdMutex::new(ProcessMonitor::new()),
        })
    }

    fn unit_file(&self, name: &str) -> PathBuf {
        self.units_dir.join(format!("{}.json", name))
    }

    /// Combined stdout/stderr of the unit
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.units_dir.join(format!("{}.log", name))
    }

    fn spawn(&self, descriptor: &UnitDescriptor) -> Result<Child> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file(&descriptor.name))
            .map_err(|e| supervisor_error(&descriptor.name, "open log", e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| supervisor_error(&descriptor.name, "open log", e))?;

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&descriptor.command)
            .current_dir(&descriptor.cwd)
            .envs(&descriptor.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            command.process_group(0);
            if let Some(ref user) = descriptor.user {
                let (uid, gid) = super::runner::lookup_user(user)?;
                command.uid(uid).gid(gid);
            }
        }

        command
            .spawn()
            .map_err(|e| supervisor_error(&descriptor.name, "spawn", e))
    }

    fn not_installed(name: &str) -> HostplaneError {
        HostplaneError::Supervisor(name.to_string(), "unit is not installed".to_string())
    }
}

fn supervisor_error(unit: &str, action: &str, e: impl std::fmt::Display) -> HostplaneError {
    HostplaneError::Supervisor(unit.to_string(), format!("Failed to {}: {}", action, e))
}

#[cfg(unix)]
fn signal_group(unit: &str, pid: u32, signal: Signal) -> Result<()> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(supervisor_error(unit, &format!("send {:?}", signal), e)),
    }
}

#[async_trait]
impl Supervisor for NativeSupervisor {
    async fn install_unit(&self, unit: &UnitDescriptor) -> Result<()> {
        let raw = serde_json::to_string_pretty(unit)
            .map_err(|e| HostplaneError::SerializationError(e.to_string()))?;
        let path = self.unit_file(&unit.name);
        let temp = path.with_extension("tmp");
        fs::write(&temp, raw).map_err(|e| supervisor_error(&unit.name, "write unit", e))?;
        fs::rename(&temp, &path).map_err(|e| supervisor_error(&unit.name, "write unit", e))?;

        let mut units = self.units.lock().await;
        match units.get_mut(&unit.name) {
            // A running child keeps going; the new definition applies on next start
            Some(entry) => entry.descriptor = unit.clone(),
            None => {
                units.insert(unit.name.clone(), UnitEntry::new(unit.clone()));
            }
        }

        tracing::debug!("Installed unit {}", unit.name);
        Ok(())
    }

    async fn remove_unit(&self, name: &str) -> Result<()> {
        let installed = self.units.lock().await.contains_key(name);
        if installed {
            self.stop(name, true).await?;
        }

        self.units.lock().await.remove(name);

        let path = self.unit_file(name);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| supervisor_error(name, "remove unit", e))?;
        }

        tracing::debug!("Removed unit {}", name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut units = self.units.lock().await;
        let entry = units.get_mut(name).ok_or_else(|| Self::not_installed(name))?;

        if let Some(exit) = entry.reap() {
            self.exits.lock().map_err(poisoned)?.push(exit);
        }
        if entry.child.is_some() {
            return Ok(());
        }

        let child = self.spawn(&entry.descriptor)?;
        let pid = child
            .id()
            .ok_or_else(|| supervisor_error(name, "read pid", "process exited immediately"))?;

        if !entry.descriptor.limits.is_empty() {
            let cgroup = UnitCgroup::new(name);
            match cgroup.apply(pid, &entry.descriptor.limits) {
                Ok(()) => entry.cgroup = Some(cgroup),
                Err(e) => tracing::warn!("Limits for unit {} not enforced: {}", name, e),
            }
        }

        tracing::info!("Started unit {} (PID: {})", name, pid);
        entry.child = Some(child);
        entry.pid = Some(pid);
        entry.started_at = Some(Instant::now());
        Ok(())
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let (mut child, pid, stop_signal, grace) = {
            let mut units = self.units.lock().await;
            let entry = units.get_mut(name).ok_or_else(|| Self::not_installed(name))?;
            if let Some(exit) = entry.reap() {
                self.exits.lock().map_err(poisoned)?.push(exit);
            }
            let Some(child) = entry.child.take() else {
                return Ok(());
            };
            let pid = entry.pid.take().unwrap_or_default();
            entry.started_at = None;
            (
                child,
                pid,
                entry.descriptor.stop_signal.clone(),
                Duration::from_secs(entry.descriptor.stop_timeout_secs),
            )
        };

        #[cfg(unix)]
        {
            if force {
                tracing::info!("Force stopping unit {} (PID: {}) with SIGKILL", name, pid);
                signal_group(name, pid, Signal::SIGKILL)?;
            } else {
                let signal = super::supervisor::parse_signal(&stop_signal)?;
                tracing::info!(
                    "Gracefully stopping unit {} (PID: {}) with {}",
                    name,
                    pid,
                    stop_signal
                );
                signal_group(name, pid, signal)?;

                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::info!("Unit {} exited with status: {:?}", name, status);
                    }
                    Ok(Err(e)) => return Err(supervisor_error(name, "wait", e)),
                    Err(_) => {
                        tracing::warn!(
                            "Unit {} did not exit within {:?}, sending SIGKILL",
                            name,
                            grace
                        );
                        signal_group(name, pid, Signal::SIGKILL)?;
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (force, stop_signal, grace, pid);
            child
                .start_kill()
                .map_err(|e| supervisor_error(name, "kill", e))?;
        }

        let status = child.wait().await.ok();

        let mut units = self.units.lock().await;
        if let Some(entry) = units.get_mut(name) {
            entry.last_exit = status.and_then(|s| s.code());
            entry.cgroup = None;
        }

        tracing::info!("Unit {} stopped", name);
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<UnitStatus> {
        let mut units = self.units.lock().await;
        let entry = units.get_mut(name).ok_or_else(|| Self::not_installed(name))?;

        if let Some(exit) = entry.reap() {
            self.exits.lock().map_err(poisoned)?.push(exit);
        }

        let Some(pid) = entry.pid else {
            return Ok(UnitStatus {
                exit_code: entry.last_exit,
                ..Default::default()
            });
        };

        let usage = self.monitor.lock().map_err(poisoned)?.tree_usage(pid);

        Ok(UnitStatus {
            active: true,
            pid: Some(pid),
            uptime_secs: entry.started_at.map(|t| t.elapsed().as_secs()),
            memory_bytes: usage.map(|u| u.memory_bytes),
            cpu_percent: usage.map(|u| u.cpu_percent),
            exit_code: None,
        })
    }

    async fn poll_exits(&self) -> Result<Vec<UnitExit>> {
        let mut found = Vec::new();
        {
            let mut units = self.units.lock().await;
            for entry in units.values_mut() {
                if let Some(exit) = entry.reap() {
                    found.push(exit);
                }
            }
        }

        let mut exits = self.exits.lock().map_err(poisoned)?;
        exits.extend(found);
        Ok(std::mem::take(&mut *exits))
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> HostplaneError {
    HostplaneError::Internal("supervisor lock poisoned".to_string())
}
