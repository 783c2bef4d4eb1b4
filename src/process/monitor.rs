use std::collections::HashSet;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Resource usage of a process tree
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub processes: usize,
}

/// Samples CPU and memory of supervised process trees
pub struct ProcessMonitor {
    system: System,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Usage of `pid` and all of its descendants.
    ///
    /// Returns `None` when the root process is gone.
    pub fn tree_usage(&mut self, pid: u32) -> Option<ProcessUsage> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let root = Pid::from_u32(pid);
        self.system.process(root)?;

        let mut members: HashSet<Pid> = HashSet::new();
        members.insert(root);

        // Parents may be listed after children, so iterate until stable
        loop {
            let before = members.len();
            for (child_pid, process) in self.system.processes() {
                if let Some(parent) = process.parent() {
                    if members.contains(&parent) {
                        members.insert(*child_pid);
                    }
                }
            }
            if members.len() == before {
                break;
            }
        }

        let mut usage = ProcessUsage::default();
        for member in &members {
            if let Some(process) = self.system.process(*member) {
                usage.cpu_percent += process.cpu_usage();
                usage.memory_bytes += process.memory();
                usage.processes += 1;
            }
        }

        Some(usage)
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}
