// Mock module - In-memory supervisor, runner, probe and provisioner

use crate::error::{HostplaneError, Result};
use crate::model::Site;
use crate::process::{
    CommandOutcome, CommandSpec, ProcessRunner, Supervisor, UnitDescriptor, UnitExit, UnitStatus,
};
use crate::sites::SiteProvisioner;
use crate::stats::{HostProbe, HostSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Supervisor operations, for call logs and injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorOp {
    Install,
    Remove,
    Start,
    Stop,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorCall {
    pub op: SupervisorOp,
    pub unit: String,
}

#[derive(Debug, Clone)]
struct MockUnit {
    descriptor: UnitDescriptor,
    pid: Option<u32>,
    started_at: Option<Instant>,
    cpu_percent: f32,
    memory_bytes: u64,
    last_exit: Option<i32>,
}

#[derive(Debug, Default)]
struct MockState {
    units: HashMap<String, MockUnit>,
    calls: Vec<SupervisorCall>,
    failures: HashSet<(SupervisorOp, String)>,
    unconfirmed: HashSet<String>,
    exits: Vec<UnitExit>,
    next_pid: u32,
}

/// Supervisor that keeps units in memory
#[derive(Debug, Default)]
pub struct MockSupervisor {
    state: Mutex<MockState>,
    start_delay: Duration,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every start take this long before returning
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Fail `op` for `unit` until cleared
    pub async fn fail_on(&self, op: SupervisorOp, unit: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert((op, unit.to_string()));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Accept starts for `unit` but never report it active
    pub async fn never_confirm(&self, unit: &str) {
        self.state.lock().await.unconfirmed.insert(unit.to_string());
    }

    /// Kill the unit behind the platform's back, without an exit event
    pub async fn kill(&self, unit: &str) {
        if let Some(u) = self.state.lock().await.units.get_mut(unit) {
            u.pid = None;
            u.started_at = None;
            u.last_exit = None;
        }
    }

    /// Simulate a crash that the next `poll_exits` reports
    pub async fn crash(&self, unit: &str, code: i32) {
        let mut state = self.state.lock().await;
        if let Some(u) = state.units.get_mut(unit) {
            u.pid = None;
            u.started_at = None;
            u.last_exit = Some(code);
        }
        state.exits.push(UnitExit {
            unit: unit.to_string(),
            code: Some(code),
            signal: None,
            oom: false,
        });
    }

    pub async fn set_usage(&self, unit: &str, cpu_percent: f32, memory_bytes: u64) {
        if let Some(u) = self.state.lock().await.units.get_mut(unit) {
            u.cpu_percent = cpu_percent;
            u.memory_bytes = memory_bytes;
        }
    }

    pub async fn calls(&self) -> Vec<SupervisorCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count(&self, op: SupervisorOp, unit: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op && c.unit == unit)
            .count()
    }

    pub async fn start_count(&self, unit: &str) -> usize {
        self.count(SupervisorOp::Start, unit).await
    }

    pub async fn descriptor(&self, unit: &str) -> Option<UnitDescriptor> {
        self.state
            .lock()
            .await
            .units
            .get(unit)
            .map(|u| u.descriptor.clone())
    }

    pub async fn is_active(&self, unit: &str) -> bool {
        self.state
            .lock()
            .await
            .units
            .get(unit)
            .map_or(false, |u| u.pid.is_some())
    }

    pub async fn unit_count(&self) -> usize {
        self.state.lock().await.units.len()
    }

    async fn record(&self, op: SupervisorOp, unit: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(SupervisorCall {
            op,
            unit: unit.to_string(),
        });
        if state.failures.contains(&(op, unit.to_string())) {
            return Err(HostplaneError::Supervisor(
                unit.to_string(),
                format!("injected {:?} failure", op),
            ));
        }
        Ok(())
    }
}

fn not_installed(unit: &str) -> HostplaneError {
    HostplaneError::Supervisor(unit.to_string(), "unit is not installed".to_string())
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn install_unit(&self, unit: &UnitDescriptor) -> Result<()> {
        self.record(SupervisorOp::Install, &unit.name).await?;
        let mut state = self.state.lock().await;
        match state.units.get_mut(&unit.name) {
            Some(existing) => existing.descriptor = unit.clone(),
            None => {
                state.units.insert(
                    unit.name.clone(),
                    MockUnit {
                        descriptor: unit.clone(),
                        pid: None,
                        started_at: None,
                        cpu_percent: 0.0,
                        memory_bytes: 0,
                        last_exit: None,
                    },
                );
            }
        }
        debug!("MockSupervisor: installed {}", unit.name);
        Ok(())
    }

    async fn remove_unit(&self, name: &str) -> Result<()> {
        self.record(SupervisorOp::Remove, name).await?;
        self.state.lock().await.units.remove(name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record(SupervisorOp::Start, name).await?;
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let mut state = self.state.lock().await;
        if state.unconfirmed.contains(name) {
            return Ok(());
        }
        state.next_pid += 1;
        let pid = 10_000 + state.next_pid;
        let unit = state.units.get_mut(name).ok_or_else(|| not_installed(name))?;
        if unit.pid.is_none() {
            unit.pid = Some(pid);
            unit.started_at = Some(Instant::now());
            unit.last_exit = None;
        }
        debug!("MockSupervisor: started {}", name);
        Ok(())
    }

    async fn stop(&self, name: &str, _force: bool) -> Result<()> {
        self.record(SupervisorOp::Stop, name).await?;
        let mut state = self.state.lock().await;
        let unit = state.units.get_mut(name).ok_or_else(|| not_installed(name))?;
        if unit.pid.take().is_some() {
            unit.last_exit = Some(0);
        }
        unit.started_at = None;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<UnitStatus> {
        self.record(SupervisorOp::Status, name).await?;
        let state = self.state.lock().await;
        let unit = state.units.get(name).ok_or_else(|| not_installed(name))?;
        Ok(match unit.pid {
            Some(pid) => UnitStatus {
                active: true,
                pid: Some(pid),
                uptime_secs: unit.started_at.map(|t| t.elapsed().as_secs()),
                memory_bytes: Some(unit.memory_bytes),
                cpu_percent: Some(unit.cpu_percent),
                exit_code: None,
            },
            None => UnitStatus {
                exit_code: unit.last_exit,
                ..Default::default()
            },
        })
    }

    async fn poll_exits(&self) -> Result<Vec<UnitExit>> {
        Ok(std::mem::take(&mut self.state.lock().await.exits))
    }
}

/// Runner that records invocations and replays canned outcomes
#[derive(Debug, Default)]
pub struct MockRunner {
    responses: Mutex<Vec<(String, CommandOutcome)>>,
    invocations: Mutex<Vec<CommandSpec>>,
    delay_ms: AtomicU64,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `outcome` to any command containing `pattern`
    pub async fn respond(&self, pattern: &str, outcome: CommandOutcome) {
        self.responses
            .lock()
            .await
            .push((pattern.to_string(), outcome));
    }

    /// Every command takes this long to finish
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations.lock().await.clone()
    }

    pub fn success(output: &str) -> CommandOutcome {
        CommandOutcome {
            success: true,
            exit_code: Some(0),
            output: output.to_string(),
            timed_out: false,
            duration_ms: 1,
        }
    }

    pub fn failure(code: i32, output: &str) -> CommandOutcome {
        CommandOutcome {
            success: false,
            exit_code: Some(code),
            output: output.to_string(),
            timed_out: false,
            duration_ms: 1,
        }
    }

    pub fn timed_out() -> CommandOutcome {
        CommandOutcome {
            success: false,
            exit_code: None,
            output: "command timed out".to_string(),
            timed_out: true,
            duration_ms: 1,
        }
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        self.invocations.lock().await.push(spec.clone());
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let responses = self.responses.lock().await;
        // Latest matching response wins
        let outcome = responses
            .iter()
            .rev()
            .find(|(pattern, _)| spec.command.contains(pattern.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| Self::success(""));
        Ok(outcome)
    }
}

/// Probe with settable readings
#[derive(Debug)]
pub struct MockProbe {
    cpu_bits: AtomicU64,
    memory_used: AtomicU64,
    memory_total: AtomicU64,
    disk_used: AtomicU64,
    disk_total: AtomicU64,
    path_bytes: AtomicU64,
    delay_ms: AtomicU64,
    failing: AtomicBool,
    samples: AtomicUsize,
}

impl MockProbe {
    pub fn new() -> Self {
        Self {
            cpu_bits: AtomicU64::new(10.0f64.to_bits()),
            memory_used: AtomicU64::new(2 << 30),
            memory_total: AtomicU64::new(8 << 30),
            disk_used: AtomicU64::new(10 << 30),
            disk_total: AtomicU64::new(100 << 30),
            path_bytes: AtomicU64::new(4096),
            delay_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            samples: AtomicUsize::new(0),
        }
    }

    pub fn set_cpu(&self, percent: f64) {
        self.cpu_bits.store(percent.to_bits(), Ordering::SeqCst);
    }

    pub fn set_memory(&self, used: u64, total: u64) {
        self.memory_used.store(used, Ordering::SeqCst);
        self.memory_total.store(total, Ordering::SeqCst);
    }

    pub fn set_disk(&self, used: u64, total: u64) {
        self.disk_used.store(used, Ordering::SeqCst);
        self.disk_total.store(total, Ordering::SeqCst);
    }

    /// Each `sample` call blocks this long
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of host samples taken
    pub fn sample_count(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for MockProbe {
    fn sample(&self) -> Result<HostSnapshot> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(HostplaneError::Internal("probe unavailable".to_string()));
        }
        self.samples.fetch_add(1, Ordering::SeqCst);

        Ok(HostSnapshot {
            cpu_percent: f64::from_bits(self.cpu_bits.load(Ordering::SeqCst)),
            load_average: [0.5, 0.4, 0.3],
            memory_total: self.memory_total.load(Ordering::SeqCst),
            memory_used: self.memory_used.load(Ordering::SeqCst),
            disk_total: self.disk_total.load(Ordering::SeqCst),
            disk_used: self.disk_used.load(Ordering::SeqCst),
            network_rx_bytes: 1024,
            network_tx_bytes: 2048,
            uptime_secs: 3600,
        })
    }

    fn path_usage(&self, _path: &Path) -> Result<u64> {
        Ok(self.path_bytes.load(Ordering::SeqCst))
    }
}

/// Provisioner operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionOp {
    CreateRoot,
    CreateAccount,
    RemoveDatabases,
    RemoveAccount,
    RemoveRoot,
}

/// Provisioner that only records what it was asked to do
#[derive(Debug, Default)]
pub struct MockProvisioner {
    calls: Mutex<Vec<(ProvisionOp, String)>>,
    failures: Mutex<HashSet<ProvisionOp>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_on(&self, op: ProvisionOp) {
        self.failures.lock().await.insert(op);
    }

    pub async fn calls(&self) -> Vec<(ProvisionOp, String)> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, op: ProvisionOp, site: &Site) -> Result<()> {
        self.calls.lock().await.push((op, site.name.clone()));
        if self.failures.lock().await.contains(&op) {
            return Err(HostplaneError::Provision(format!(
                "injected {:?} failure for site {}",
                op, site.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SiteProvisioner for MockProvisioner {
    async fn create_root(&self, site: &Site) -> Result<()> {
        self.record(ProvisionOp::CreateRoot, site).await
    }

    async fn create_account(&self, site: &Site) -> Result<Option<String>> {
        self.record(ProvisionOp::CreateAccount, site).await?;
        Ok(None)
    }

    async fn remove_databases(&self, site: &Site) -> Result<()> {
        self.record(ProvisionOp::RemoveDatabases, site).await
    }

    async fn remove_account(&self, site: &Site) -> Result<()> {
        self.record(ProvisionOp::RemoveAccount, site).await
    }

    async fn remove_root(&self, site: &Site) -> Result<()> {
        self.record(ProvisionOp::RemoveRoot, site).await
    }
}
