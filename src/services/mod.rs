// Services module - Service lifecycle on top of the supervisor

use crate::allocator;
use crate::config::PlatformConfig;
use crate::error::{HostplaneError, Result};
use crate::events::EventBus;
use crate::model::{
    validate_environment, validate_slug, CallerRole, CustomCommand, DesiredState, InstallState,
    NewService, Service, ServiceId, ServiceStatus, ServiceUpdate, ServiceUsage, Site, SiteId,
};
use crate::process::{CommandOutcome, CommandSpec, ProcessRunner, Supervisor, UnitDescriptor, UnitExit, UnitStatus};
use crate::state::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Persisted status of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusView {
    pub service_id: ServiceId,
    pub name: String,
    pub status: ServiceStatus,
    pub desired: DesiredState,
    pub install_state: InstallState,
    pub port: u16,
    pub pid: Option<u32>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
}

/// Live supervisor view compared with the persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub service_id: ServiceId,
    pub name: String,
    pub desired: DesiredState,
    /// Status on record
    pub recorded: ServiceStatus,
    /// Status the supervisor reports right now
    pub actual: ServiceStatus,
    pub drift: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub checked_at: DateTime<Utc>,
}

/// A running service the supervisor saw die
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFailure {
    pub service_id: ServiceId,
    pub site_id: SiteId,
    pub name: String,
    pub exit: UnitExit,
}

/// Drives services through their lifecycle
pub struct ServiceManager {
    store: Arc<Store>,
    supervisor: Arc<dyn Supervisor>,
    runner: Arc<dyn ProcessRunner>,
    config: PlatformConfig,
    events: EventBus,
    /// Serializes lifecycle transitions per service
    locks: Mutex<HashMap<ServiceId, Arc<Mutex<()>>>>,
}

impl ServiceManager {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<dyn Supervisor>,
        runner: Arc<dyn ProcessRunner>,
        config: PlatformConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            supervisor,
            runner,
            config,
            events,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: ServiceId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Working directory of a service
    pub fn service_dir(site: &Site, service: &Service) -> PathBuf {
        site.root.join(&service.name)
    }

    fn descriptor(&self, site: &Site, service: &Service) -> UnitDescriptor {
        UnitDescriptor {
            name: service.unit.clone(),
            command: service.start_command.clone(),
            cwd: Self::service_dir(site, service),
            env: UnitDescriptor::merged_env(&site.environment, &service.environment, service.port),
            port: service.port,
            limits: service.limits.clone(),
            user: site.account.clone(),
            stop_signal: self.config.supervisor.stop_signal.clone(),
            stop_timeout_secs: self.config.supervisor.stop_timeout_secs,
        }
    }

    async fn service_and_site(&self, id: ServiceId) -> Result<(Service, Site)> {
        self.store
            .read(|t| {
                let service = t.service(id)?.clone();
                let site = t.site(service.site_id)?.clone();
                Ok((service, site))
            })
            .await
    }

    fn validate_custom_command(&self, command: &CustomCommand) -> Result<()> {
        validate_slug("command", &command.name)?;
        if command.command.trim().is_empty() {
            return Err(HostplaneError::Validation(format!(
                "Custom command '{}' has an empty command line",
                command.name
            )));
        }
        if let Some(timeout) = command.timeout_secs {
            let max = self.config.commands.max_custom_timeout_secs;
            if timeout == 0 || timeout > max {
                return Err(HostplaneError::Validation(format!(
                    "Custom command timeout must be between 1 and {} seconds",
                    max
                )));
            }
        }
        Ok(())
    }

    /// Create a service in a site, allocating its port
    pub async fn create(&self, site_id: SiteId, def: NewService) -> Result<Service> {
        validate_slug("service", &def.name)?;
        validate_environment(&def.environment)?;
        if def.start_command.trim().is_empty() {
            return Err(HostplaneError::Validation(
                "Start command must not be empty".to_string(),
            ));
        }
        allocator::validate_limits(&def.limits, &self.config.limits)?;
        let mut seen = std::collections::HashSet::new();
        for command in &def.custom_commands {
            self.validate_custom_command(command)?;
            if !seen.insert(command.name.as_str()) {
                return Err(HostplaneError::Validation(format!(
                    "Custom command '{}' is defined twice",
                    command.name
                )));
            }
        }

        let (service, site) = self
            .store
            .write(|t| {
                let site = t.site(site_id)?.clone();
                if !site.status.accepts_services() {
                    return Err(HostplaneError::InvalidState(
                        format!("site {}", site.name),
                        format!("cannot add services while {}", site.status),
                    ));
                }
                if t.services_of(site_id).any(|s| s.name == def.name) {
                    return Err(HostplaneError::AlreadyExists(format!(
                        "service {} in site {}",
                        def.name, site.name
                    )));
                }
                allocator::validate_within(&def.limits, &site.limits)?;

                let port = match def.port {
                    Some(port) => allocator::claim_port(&site, t.services.values(), port)?,
                    None => allocator::allocate_port(&site, t.services.values())?,
                };

                let now = Utc::now();
                let service = Service {
                    id: ServiceId::new(),
                    site_id,
                    unit: Service::unit_name(&site.name, &def.name),
                    display_name: def.display_name.clone().unwrap_or_else(|| def.name.clone()),
                    name: def.name.clone(),
                    kind: def.kind,
                    start_command: def.start_command.clone(),
                    install_command: def.install_command.clone(),
                    build_command: def.build_command.clone(),
                    port,
                    environment: def.environment.clone(),
                    desired: DesiredState::Stopped,
                    status: ServiceStatus::Stopped,
                    install_state: InstallState::Uninstalled,
                    auto_start: def.auto_start,
                    limits: def.limits.clone(),
                    custom_commands: def.custom_commands.clone(),
                    pid: None,
                    last_started_at: None,
                    last_exit_code: None,
                    created_at: now,
                    updated_at: now,
                };
                t.services.insert(service.id, service.clone());
                Ok((service, site))
            })
            .await?;

        let dir = Self::service_dir(&site, &service);
        let installed = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => self.supervisor.install_unit(&self.descriptor(&site, &service)).await,
            Err(e) => Err(HostplaneError::from(e)),
        };

        if let Err(e) = installed {
            error!(
                "Failed to install unit {} for service {}: {}",
                service.unit, service.name, e
            );
            self.store
                .write(|t| {
                    t.services.remove(&service.id);
                    Ok(())
                })
                .await?;
            return Err(match e {
                HostplaneError::Supervisor(..) => e,
                other => HostplaneError::Supervisor(service.unit.clone(), other.to_string()),
            });
        }

        info!(
            "Created service {} in site {} on port {}",
            service.name, site.name, service.port
        );
        self.events
            .service_status(service.id, site_id, ServiceStatus::Stopped);

        if service.auto_start {
            if let Err(e) = self.start(service.id).await {
                warn!("Auto start of service {} failed: {}", service.name, e);
            }
            return self.get(service.id).await;
        }

        Ok(service)
    }

    pub async fn get(&self, id: ServiceId) -> Result<Service> {
        self.store.service(id).await
    }

    /// Services of one site, or all services
    pub async fn list(&self, site_id: Option<SiteId>) -> Vec<Service> {
        match site_id {
            Some(site_id) => self.store.services_for_site(site_id).await,
            None => self.store.services().await,
        }
    }

    pub async fn find_by_name(&self, site_id: SiteId, name: &str) -> Result<Service> {
        self.store
            .read(|t| t.services_of(site_id).find(|s| s.name == name).cloned())
            .await
            .ok_or_else(|| HostplaneError::ServiceNotFound(name.to_string()))
    }

    pub async fn get_status(&self, id: ServiceId) -> Result<ServiceStatusView> {
        let service = self.get(id).await?;
        Ok(ServiceStatusView {
            service_id: service.id,
            name: service.name,
            status: service.status,
            desired: service.desired,
            install_state: service.install_state,
            port: service.port,
            pid: service.pid,
            last_started_at: service.last_started_at,
            last_exit_code: service.last_exit_code,
        })
    }

    /// Compare the live supervisor view with the record; never changes either
    pub async fn check_health(&self, id: ServiceId) -> Result<HealthReport> {
        let service = self.get(id).await?;
        let live = self.supervisor.status(&service.unit).await.map_err(|e| {
            error!("Health query for unit {} failed: {}", service.unit, e);
            e
        })?;

        let actual = if live.active {
            ServiceStatus::Running
        } else {
            ServiceStatus::Stopped
        };
        let drift = !service.desired.matches(actual) || service.status != actual;

        if drift {
            debug!(
                "Service {} drifted: desired={}, recorded={}, actual={}",
                service.name, service.desired, service.status, actual
            );
        }

        Ok(HealthReport {
            service_id: service.id,
            name: service.name,
            desired: service.desired,
            recorded: service.status,
            actual,
            drift,
            pid: live.pid,
            uptime_secs: live.uptime_secs,
            memory_bytes: live.memory_bytes,
            cpu_percent: live.cpu_percent,
            checked_at: Utc::now(),
        })
    }

    pub async fn start(&self, id: ServiceId) -> Result<Service> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    pub async fn stop(&self, id: ServiceId) -> Result<Service> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        self.stop_locked(id, false).await
    }

    pub async fn restart(&self, id: ServiceId) -> Result<Service> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let service = self.get(id).await?;
        let live = self.supervisor.status(&service.unit).await?;
        if live.active || service.status != ServiceStatus::Stopped {
            self.stop_locked(id, false).await?;
        }
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: ServiceId) -> Result<Service> {
        let (service, site) = self.service_and_site(id).await?;
        if !site.status.accepts_services() {
            return Err(HostplaneError::InvalidState(
                format!("site {}", site.name),
                format!("cannot start services while {}", site.status),
            ));
        }

        if service.status == ServiceStatus::Running {
            let live = self.supervisor.status(&service.unit).await?;
            if live.active {
                debug!("Service {} already running", service.name);
                return self.set_desired(id, DesiredState::Running).await;
            }
        }

        self.set_desired(id, DesiredState::Running).await?;

        if let Err(e) = self.supervisor.start(&service.unit).await {
            error!("Supervisor rejected start of {}: {}", service.unit, e);
            self.record_status(id, ServiceStatus::Failed, None).await?;
            return Err(HostplaneError::Supervisor(
                service.unit,
                "start was rejected".to_string(),
            ));
        }

        match self.await_confirmation(&service.unit, true).await {
            Ok(live) => {
                info!("Service {} is running (PID: {:?})", service.name, live.pid);
                self.record_status(id, ServiceStatus::Running, Some(live)).await
            }
            Err(e) => {
                error!("Start of {} not confirmed: {}", service.unit, e);
                self.record_status(id, ServiceStatus::Unknown, None).await?;
                Err(HostplaneError::Supervisor(
                    service.unit,
                    "start was not confirmed".to_string(),
                ))
            }
        }
    }

    async fn stop_locked(&self, id: ServiceId, force: bool) -> Result<Service> {
        let service = self.get(id).await?;

        if service.status == ServiceStatus::Stopped {
            let live = self.supervisor.status(&service.unit).await?;
            if !live.active {
                debug!("Service {} already stopped", service.name);
                return self.set_desired(id, DesiredState::Stopped).await;
            }
        }

        self.set_desired(id, DesiredState::Stopped).await?;

        if let Err(e) = self.supervisor.stop(&service.unit, force).await {
            error!("Supervisor rejected stop of {}: {}", service.unit, e);
            self.record_status(id, ServiceStatus::Failed, None).await?;
            return Err(HostplaneError::Supervisor(
                service.unit,
                "stop was rejected".to_string(),
            ));
        }

        match self.await_confirmation(&service.unit, false).await {
            Ok(live) => {
                info!("Service {} stopped", service.name);
                self.record_status(id, ServiceStatus::Stopped, Some(live)).await
            }
            Err(e) => {
                error!("Stop of {} not confirmed: {}", service.unit, e);
                self.record_status(id, ServiceStatus::Unknown, None).await?;
                Err(HostplaneError::Supervisor(
                    service.unit,
                    "stop was not confirmed".to_string(),
                ))
            }
        }
    }

    /// Poll the supervisor until the unit reaches `active`, bounded by the
    /// start timeout (or the stop grace period when waiting for a stop)
    async fn await_confirmation(&self, unit: &str, active: bool) -> Result<UnitStatus> {
        let timeout = if active {
            self.config.supervisor.start_timeout()
        } else {
            self.config.supervisor.stop_timeout()
        };
        let deadline = Instant::now() + timeout;
        let poll = self.config.supervisor.confirm_poll();

        loop {
            let status = self.supervisor.status(unit).await?;
            if status.active == active {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(HostplaneError::Timeout(format!(
                    "unit {} did not become {} within {:?}",
                    unit,
                    if active { "active" } else { "inactive" },
                    timeout
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn set_desired(&self, id: ServiceId, desired: DesiredState) -> Result<Service> {
        self.store
            .write(|t| {
                let service = t.service_mut(id)?;
                if service.desired != desired {
                    service.desired = desired;
                    service.updated_at = Utc::now();
                }
                Ok(service.clone())
            })
            .await
    }

    async fn record_status(
        &self,
        id: ServiceId,
        status: ServiceStatus,
        live: Option<UnitStatus>,
    ) -> Result<Service> {
        let service = self
            .store
            .write(|t| {
                let service = t.service_mut(id)?;
                service.transition(status)?;
                if let Some(live) = live {
                    match status {
                        ServiceStatus::Running => {
                            service.pid = live.pid;
                            service.last_started_at = Some(Utc::now());
                        }
                        _ => {
                            if live.exit_code.is_some() {
                                service.last_exit_code = live.exit_code;
                            }
                        }
                    }
                }
                Ok(service.clone())
            })
            .await?;

        self.events
            .service_status(service.id, service.site_id, service.status);
        Ok(service)
    }

    pub async fn update(&self, id: ServiceId, update: ServiceUpdate) -> Result<Service> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let (mut service, site) = self.service_and_site(id).await?;

        if let Some(display_name) = update.display_name {
            service.display_name = display_name;
        }
        if let Some(start_command) = update.start_command {
            if start_command.trim().is_empty() {
                return Err(HostplaneError::Validation(
                    "Start command must not be empty".to_string(),
                ));
            }
            service.start_command = start_command;
        }
        if let Some(install_command) = update.install_command {
            service.install_command = Some(install_command).filter(|c| !c.trim().is_empty());
        }
        if let Some(build_command) = update.build_command {
            service.build_command = Some(build_command).filter(|c| !c.trim().is_empty());
        }
        if let Some(limits) = update.limits {
            allocator::validate_limits(&limits, &self.config.limits)?;
            allocator::validate_within(&limits, &site.limits)?;
            service.limits = limits;
        }
        if let Some(auto_start) = update.auto_start {
            service.auto_start = auto_start;
        }

        self.save_definition(&site, service).await
    }

    /// Replace the service's own environment
    pub async fn set_environment(
        &self,
        id: ServiceId,
        environment: BTreeMap<String, String>,
    ) -> Result<Service> {
        validate_environment(&environment)?;

        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let (mut service, site) = self.service_and_site(id).await?;
        service.environment = environment;
        self.save_definition(&site, service).await
    }

    /// Rewrite the unit, then persist the definition fields of `service`
    async fn save_definition(&self, site: &Site, service: Service) -> Result<Service> {
        self.supervisor
            .install_unit(&self.descriptor(site, &service))
            .await
            .map_err(|e| {
                error!("Failed to rewrite unit {}: {}", service.unit, e);
                e
            })?;

        let saved = self
            .store
            .write(|t| {
                let current = t.service_mut(service.id)?;
                current.display_name = service.display_name.clone();
                current.start_command = service.start_command.clone();
                current.install_command = service.install_command.clone();
                current.build_command = service.build_command.clone();
                current.limits = service.limits.clone();
                current.auto_start = service.auto_start;
                current.environment = service.environment.clone();
                current.custom_commands = service.custom_commands.clone();
                current.updated_at = Utc::now();
                Ok(current.clone())
            })
            .await?;

        info!("Updated service {}", saved.name);
        Ok(saved)
    }

    /// Rewrite unit descriptors of every service in a site
    pub async fn refresh_units(&self, site_id: SiteId) -> Result<()> {
        let site = self.store.site(site_id).await?;
        for service in self.store.services_for_site(site_id).await {
            self.supervisor
                .install_unit(&self.descriptor(&site, &service))
                .await?;
        }
        Ok(())
    }

    /// Stop, remove the unit and drop the record. `force` kills without
    /// grace and ignores supervisor failures.
    pub async fn delete(&self, id: ServiceId, force: bool) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let service = self.get(id).await?;

        if force {
            if let Err(e) = self.supervisor.stop(&service.unit, true).await {
                warn!("Ignoring stop failure for {}: {}", service.unit, e);
            }
            if let Err(e) = self.supervisor.remove_unit(&service.unit).await {
                warn!("Ignoring unit removal failure for {}: {}", service.unit, e);
            }
        } else {
            if service.status != ServiceStatus::Stopped {
                self.stop_locked(id, false).await?;
            }
            self.supervisor
                .remove_unit(&service.unit)
                .await
                .map_err(|e| {
                    error!("Failed to remove unit {}: {}", service.unit, e);
                    HostplaneError::Supervisor(service.unit.clone(), "unit removal failed".to_string())
                })?;
        }

        self.store
            .write(|t| {
                t.services.remove(&id);
                Ok(())
            })
            .await?;

        self.locks.lock().await.remove(&id);
        info!("Deleted service {}", service.name);
        Ok(())
    }

    async fn run_in_service(
        &self,
        site: &Site,
        service: &Service,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let spec = CommandSpec {
            command: command.to_string(),
            cwd: Self::service_dir(site, service),
            env: UnitDescriptor::merged_env(&site.environment, &service.environment, service.port),
            timeout,
            user: site.account.clone(),
            max_output_bytes: self.config.commands.max_output_bytes,
        };

        let outcome = self.runner.run(&spec).await?;
        if outcome.success {
            info!(
                "Command for {} finished in {}ms",
                service.name, outcome.duration_ms
            );
        } else {
            warn!(
                "Command for {} failed (exit {:?}, timed out: {})",
                service.name, outcome.exit_code, outcome.timed_out
            );
        }
        Ok(outcome)
    }

    /// Run the install command; a failing install is a result, not an error
    pub async fn install(&self, id: ServiceId) -> Result<CommandOutcome> {
        let (service, site) = self.service_and_site(id).await?;
        let command = service.install_command.clone().ok_or_else(|| {
            HostplaneError::Validation(format!("Service {} has no install command", service.name))
        })?;

        let timeout = Duration::from_secs(self.config.commands.install_timeout_secs);
        let outcome = self.run_in_service(&site, &service, &command, timeout).await?;

        let state = if outcome.success {
            InstallState::Installed
        } else {
            InstallState::Failed
        };
        self.store
            .write(|t| {
                let service = t.service_mut(id)?;
                service.install_state = state;
                service.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        Ok(outcome)
    }

    pub async fn build(&self, id: ServiceId) -> Result<CommandOutcome> {
        let (service, site) = self.service_and_site(id).await?;
        let command = service.build_command.clone().ok_or_else(|| {
            HostplaneError::Validation(format!("Service {} has no build command", service.name))
        })?;

        let timeout = Duration::from_secs(self.config.commands.build_timeout_secs);
        self.run_in_service(&site, &service, &command, timeout).await
    }

    pub async fn list_commands(&self, id: ServiceId) -> Result<Vec<CustomCommand>> {
        Ok(self.get(id).await?.custom_commands)
    }

    pub async fn add_command(&self, id: ServiceId, command: CustomCommand) -> Result<Service> {
        self.validate_custom_command(&command)?;
        self.store
            .write(|t| {
                let service = t.service_mut(id)?;
                if service.find_command(&command.name).is_some() {
                    return Err(HostplaneError::AlreadyExists(format!(
                        "custom command {} on service {}",
                        command.name, service.name
                    )));
                }
                service.custom_commands.push(command);
                service.updated_at = Utc::now();
                Ok(service.clone())
            })
            .await
    }

    pub async fn remove_command(&self, id: ServiceId, name: &str) -> Result<Service> {
        self.store
            .write(|t| {
                let service = t.service_mut(id)?;
                let index = service
                    .custom_commands
                    .iter()
                    .position(|c| c.name == name)
                    .ok_or_else(|| HostplaneError::CommandNotFound(name.to_string()))?;
                service.custom_commands.remove(index);
                service.updated_at = Utc::now();
                Ok(service.clone())
            })
            .await
    }

    /// Run a custom command. Commands that require a stopped service leave it stopped.
    pub async fn execute_command(
        &self,
        id: ServiceId,
        name: &str,
        role: CallerRole,
    ) -> Result<CommandOutcome> {
        let (service, site) = self.service_and_site(id).await?;
        let command = service
            .find_command(name)
            .cloned()
            .ok_or_else(|| HostplaneError::CommandNotFound(name.to_string()))?;

        if command.dangerous && role != CallerRole::Admin {
            return Err(HostplaneError::PermissionDenied(format!(
                "custom command {} requires an administrator",
                name
            )));
        }

        // Held until the command finishes
        let lock = self.lock_for(id).await;
        let _guard = if command.requires_stop {
            let guard = lock.lock().await;
            self.stop_locked(id, false).await?;
            Some(guard)
        } else {
            None
        };

        let max = self.config.commands.max_custom_timeout_secs;
        let timeout = command
            .timeout_secs
            .unwrap_or(self.config.commands.custom_timeout_secs)
            .min(max);

        info!("Executing custom command {} on {}", name, service.name);
        self.run_in_service(&site, &service, &command.command, Duration::from_secs(timeout))
            .await
    }

    /// Mark running services whose units died on their own as failed.
    ///
    /// The drained batch is always processed to the end: an exit that cannot
    /// be handled is logged and skipped.
    pub async fn handle_supervisor_exits(&self) -> Result<Vec<ServiceFailure>> {
        let exits = self.supervisor.poll_exits().await?;
        let mut failures = Vec::new();

        for exit in exits {
            let unit = exit.unit.clone();
            match self.handle_exit(exit).await {
                Ok(Some(failure)) => failures.push(failure),
                Ok(None) => {}
                Err(e) => error!("Failed to handle exit of unit {}: {}", unit, e),
            }
        }

        Ok(failures)
    }

    async fn handle_exit(&self, exit: UnitExit) -> Result<Option<ServiceFailure>> {
        let Some(service) = self
            .store
            .read(|t| t.services.values().find(|s| s.unit == exit.unit).cloned())
            .await
        else {
            debug!("Exit of unknown unit {}", exit.unit);
            return Ok(None);
        };

        let lock = self.lock_for(service.id).await;
        let _guard = lock.lock().await;

        let current = self.get(service.id).await?;
        if current.status != ServiceStatus::Running {
            return Ok(None);
        }
        // Restarted since the exit was observed
        if self.supervisor.status(&current.unit).await?.active {
            return Ok(None);
        }

        warn!(
            "Service {} exited unexpectedly (code {:?}, signal {:?}, oom {})",
            current.name, exit.code, exit.signal, exit.oom
        );
        let code = exit.code;
        self.store
            .write(|t| {
                let service = t.service_mut(current.id)?;
                service.transition(ServiceStatus::Failed)?;
                service.last_exit_code = code;
                Ok(())
            })
            .await?;
        self.events
            .service_status(current.id, current.site_id, ServiceStatus::Failed);

        Ok(Some(ServiceFailure {
            service_id: current.id,
            site_id: current.site_id,
            name: current.name,
            exit,
        }))
    }

    /// Live per-service usage for a site
    pub async fn service_usage(&self, site_id: SiteId) -> Result<Vec<ServiceUsage>> {
        self.store.site(site_id).await?;

        let mut usage = Vec::new();
        for service in self.store.services_for_site(site_id).await {
            let live = match self.supervisor.status(&service.unit).await {
                Ok(live) => live,
                Err(e) => {
                    warn!("Status of unit {} unavailable: {}", service.unit, e);
                    UnitStatus::default()
                }
            };
            usage.push(ServiceUsage {
                service_id: service.id,
                name: service.name,
                status: service.status,
                active: live.active,
                pid: live.pid,
                port: service.port,
                cpu_percent: live.cpu_percent.unwrap_or(0.0) as f64,
                memory_bytes: live.memory_bytes.unwrap_or(0),
                uptime_secs: live.uptime_secs.unwrap_or(0),
            });
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRunner, MockSupervisor, SupervisorOp};
    use crate::model::{PortRange, ResourceLimits, SiteStatus};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: ServiceManager,
        supervisor: Arc<MockSupervisor>,
        runner: Arc<MockRunner>,
        site: Site,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::in_memory());
        let mut config = PlatformConfig::default();
        config.supervisor.start_timeout_secs = 1;
        config.supervisor.confirm_poll_ms = 10;

        let now = Utc::now();
        let site = Site {
            id: SiteId::new(),
            name: "demo".to_string(),
            display_name: "demo".to_string(),
            description: String::new(),
            status: SiteStatus::Active,
            owner: "alice".to_string(),
            port_range: PortRange::new(4001, 4011),
            domains: vec![],
            environment: BTreeMap::new(),
            limits: ResourceLimits::default(),
            root: dir.path().join("demo"),
            account: None,
            created_at: now,
            updated_at: now,
        };
        let inserted = site.clone();
        store
            .write(|t| {
                t.sites.insert(inserted.id, inserted);
                Ok(())
            })
            .await
            .unwrap();

        let supervisor = Arc::new(MockSupervisor::new());
        let runner = Arc::new(MockRunner::new());
        let manager = ServiceManager::new(
            store,
            supervisor.clone(),
            runner.clone(),
            config,
            EventBus::new(),
        );

        Fixture {
            _dir: dir,
            manager,
            supervisor,
            runner,
            site,
        }
    }

    #[tokio::test]
    async fn test_create_allocates_lowest_port() {
        let f = fixture().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "node server.js"))
            .await
            .unwrap();
        let worker = f
            .manager
            .create(f.site.id, NewService::new("worker", "node worker.js"))
            .await
            .unwrap();

        assert_eq!(web.port, 4001);
        assert_eq!(worker.port, 4002);
        assert_eq!(web.status, ServiceStatus::Stopped);
        assert_eq!(web.unit, "demo-web");

        let descriptor = f.supervisor.descriptor("demo-web").await.unwrap();
        assert_eq!(descriptor.env["PORT"], "4001");
        assert!(descriptor.cwd.ends_with("demo/web"));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let f = fixture().await;
        f.manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();
        let result = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await;
        assert!(matches!(result, Err(HostplaneError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_create_rolls_back_when_unit_install_fails() {
        let f = fixture().await;
        f.supervisor.fail_on(SupervisorOp::Install, "demo-web").await;

        let result = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await;
        assert!(matches!(result, Err(HostplaneError::Supervisor(_, _))));
        assert!(f.manager.list(Some(f.site.id)).await.is_empty());

        // The port is free again
        f.supervisor.clear_failures().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();
        assert_eq!(web.port, 4001);
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let f = fixture().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();

        let started = f.manager.start(web.id).await.unwrap();
        assert_eq!(started.status, ServiceStatus::Running);
        assert_eq!(started.desired, DesiredState::Running);
        assert!(started.pid.is_some());

        let stopped = f.manager.stop(web.id).await.unwrap();
        assert_eq!(stopped.status, ServiceStatus::Stopped);
        assert!(stopped.pid.is_none());

        // Converged stop does not reach the supervisor again
        f.manager.stop(web.id).await.unwrap();
        assert_eq!(f.supervisor.count(SupervisorOp::Stop, "demo-web").await, 1);
    }

    #[tokio::test]
    async fn test_rejected_start_marks_failed() {
        let f = fixture().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();
        f.supervisor.fail_on(SupervisorOp::Start, "demo-web").await;

        let result = f.manager.start(web.id).await;
        assert!(matches!(result, Err(HostplaneError::Supervisor(_, _))));
        assert_eq!(
            f.manager.get(web.id).await.unwrap().status,
            ServiceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_start_marks_unknown() {
        let f = fixture().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();
        f.supervisor.never_confirm("demo-web").await;

        let result = f.manager.start(web.id).await;
        assert!(result.is_err());
        assert_eq!(
            f.manager.get(web.id).await.unwrap().status,
            ServiceStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_install_outcome_updates_state() {
        let f = fixture().await;
        let mut def = NewService::new("web", "run");
        def.install_command = Some("npm ci".to_string());
        let web = f.manager.create(f.site.id, def).await.unwrap();

        f.runner
            .respond("npm ci", MockRunner::failure(1, "missing lockfile"))
            .await;
        let outcome = f.manager.install(web.id).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(
            f.manager.get(web.id).await.unwrap().install_state,
            InstallState::Failed
        );

        f.runner.respond("npm ci", MockRunner::success("added 12 packages")).await;
        let outcome = f.manager.install(web.id).await.unwrap();
        assert!(outcome.success);
        assert_eq!(
            f.manager.get(web.id).await.unwrap().install_state,
            InstallState::Installed
        );

        let invocation = f.runner.invocations().await.pop().unwrap();
        assert!(invocation.cwd.ends_with("demo/web"));
        assert_eq!(invocation.env["PORT"], "4001");
    }

    #[tokio::test]
    async fn test_build_without_command_is_validation_error() {
        let f = fixture().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();
        assert!(matches!(
            f.manager.build(web.id).await,
            Err(HostplaneError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_crash_marks_failed_once() {
        let f = fixture().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();
        f.manager.start(web.id).await.unwrap();

        f.supervisor.crash("demo-web", 137).await;
        let failures = f.manager.handle_supervisor_exits().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].service_id, web.id);

        let failed = f.manager.get(web.id).await.unwrap();
        assert_eq!(failed.status, ServiceStatus::Failed);
        assert_eq!(failed.last_exit_code, Some(137));

        assert!(f.manager.handle_supervisor_exits().await.unwrap().is_empty());

        // Explicit start recovers
        let recovered = f.manager.start(web.id).await.unwrap();
        assert_eq!(recovered.status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_environment_rewrites_unit() {
        let f = fixture().await;
        let web = f
            .manager
            .create(f.site.id, NewService::new("web", "run"))
            .await
            .unwrap();

        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), "production".to_string());
        f.manager.set_environment(web.id, env).await.unwrap();

        let descriptor = f.supervisor.descriptor("demo-web").await.unwrap();
        assert_eq!(descriptor.env["NODE_ENV"], "production");

        let mut bad = BTreeMap::new();
        bad.insert("1BAD".to_string(), "x".to_string());
        assert!(f.manager.set_environment(web.id, bad).await.is_err());
    }
}
