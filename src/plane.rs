// Control plane - Owns the store, the managers and the collector

use crate::config::PlatformConfig;
use crate::error::{ErrorCode, HostplaneError, Result};
use crate::events::EventBus;
use crate::ipc::{Command, Envelope};
use crate::model::{Service, ServiceId, Site, SiteId};
use crate::process::{NativeSupervisor, ProcessRunner, ShellRunner, Supervisor};
use crate::services::ServiceManager;
use crate::sites::{LocalProvisioner, SiteManager, SiteProvisioner};
use crate::state::Store;
use crate::stats::{AlertEngine, HostProbe, StatsCollector, SysinfoProbe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// OS-facing capabilities the control plane is built on
pub struct Collaborators {
    pub supervisor: Arc<dyn Supervisor>,
    pub runner: Arc<dyn ProcessRunner>,
    pub probe: Arc<dyn HostProbe>,
    pub provisioner: Arc<dyn SiteProvisioner>,
}

pub struct ControlPlane {
    config: PlatformConfig,
    store: Arc<Store>,
    events: EventBus,
    sites: SiteManager,
    services: Arc<ServiceManager>,
    alerts: Arc<AlertEngine>,
    collector: Arc<StatsCollector>,
    sweep_stop: Arc<Notify>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn new(config: PlatformConfig, store: Arc<Store>, collab: Collaborators) -> Self {
        let events = EventBus::new();
        let monitoring = Arc::new(RwLock::new(config.monitoring.clone()));

        let services = Arc::new(ServiceManager::new(
            store.clone(),
            collab.supervisor,
            collab.runner,
            config.clone(),
            events.clone(),
        ));
        let sites = SiteManager::new(
            store.clone(),
            services.clone(),
            collab.provisioner,
            config.clone(),
            events.clone(),
        );
        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            events.clone(),
            monitoring.clone(),
        ));
        let collector = Arc::new(StatsCollector::new(
            store.clone(),
            services.clone(),
            collab.probe,
            alerts.clone(),
            events.clone(),
            monitoring,
        ));

        Self {
            config,
            store,
            events,
            sites,
            services,
            alerts,
            collector,
            sweep_stop: Arc::new(Notify::new()),
            sweep: Mutex::new(None),
        }
    }

    /// Build a control plane backed by the host: persisted state, native
    /// supervisor, shell runner and sysinfo probe
    pub fn native(config: PlatformConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.paths.state_file)?);
        let runner: Arc<dyn ProcessRunner> = Arc::new(ShellRunner::new());
        let collab = Collaborators {
            supervisor: Arc::new(NativeSupervisor::new(&config.paths.units_dir)?),
            runner: runner.clone(),
            probe: Arc::new(SysinfoProbe::new(&config.paths.sites_root)),
            provisioner: Arc::new(LocalProvisioner::new(config.provisioning.clone(), runner)),
        };
        Ok(Self::new(config, store, collab))
    }

    pub fn sites(&self) -> &SiteManager {
        &self.sites
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn collector(&self) -> &Arc<StatsCollector> {
        &self.collector
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Start the background work: collection loop and supervisor exit sweep
    pub async fn start(self: &Arc<Self>) {
        self.collector.start().await;

        let mut sweep = self.sweep.lock().await;
        if sweep.is_none() {
            let this = Arc::clone(self);
            let period = Duration::from_millis(self.config.supervisor.exit_sweep_ms.max(10));
            *sweep = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => this.sweep_supervisor_exits().await,
                        _ = this.sweep_stop.notified() => break,
                    }
                }
            }));
        }
        info!("Control plane started");
    }

    /// Stop background work and flush state
    pub async fn shutdown(&self) -> Result<()> {
        self.collector.stop().await;

        if let Some(handle) = self.sweep.lock().await.take() {
            self.sweep_stop.notify_one();
            if let Err(e) = handle.await {
                warn!("Exit sweep ended abnormally: {}", e);
            }
        }

        self.store.flush().await?;
        info!("Control plane stopped");
        Ok(())
    }

    /// Mark crashed services failed and raise an alert for each
    pub async fn sweep_supervisor_exits(&self) {
        let failures = match self.services.handle_supervisor_exits().await {
            Ok(failures) => failures,
            Err(e) => {
                error!("Supervisor exit sweep failed: {}", e);
                return;
            }
        };

        for failure in failures {
            if let Err(e) = self.alerts.service_failed(&failure).await {
                error!("Failed to raise alert for {}: {}", failure.name, e);
            }
        }
    }

    /// Resolve a site by id or name
    pub async fn site(&self, reference: &str) -> Result<Site> {
        self.sites.resolve(reference).await
    }

    /// Resolve a service by id or `site/service`
    pub async fn service(&self, reference: &str) -> Result<Service> {
        if let Some(id) = ServiceId::parse(reference) {
            return self.services.get(id).await;
        }
        match reference.split_once('/') {
            Some((site, name)) => {
                let site = self.sites.resolve(site).await?;
                self.services.find_by_name(site.id, name).await
            }
            None => Err(HostplaneError::ServiceNotFound(reference.to_string())),
        }
    }

    async fn site_id(&self, reference: &str) -> Result<SiteId> {
        Ok(self.site(reference).await?.id)
    }

    async fn service_id(&self, reference: &str) -> Result<ServiceId> {
        Ok(self.service(reference).await?.id)
    }

    /// Run one command and wrap the outcome in an envelope
    pub async fn execute(&self, command: Command) -> Envelope {
        debug!("Executing {:?}", command);
        match self.dispatch(command).await {
            Ok(envelope) => envelope,
            Err(e) => {
                match e.code() {
                    ErrorCode::SupervisorError | ErrorCode::Internal => error!("{}", e),
                    _ => debug!("Command rejected: {}", e),
                }
                Envelope::from_error(&e)
            }
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Envelope> {
        let envelope = match command {
            // Sites
            Command::CreateSite(def) => {
                Envelope::ok(&self.sites.create(def).await?).with_message("Site created")
            }
            Command::GetSite { site } => Envelope::ok(&self.site(&site).await?),
            Command::ListSites { include_deleted } => {
                Envelope::ok(&self.sites.list(include_deleted).await)
            }
            Command::UpdateSite { site, update } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.sites.update(id, update).await?).with_message("Site updated")
            }
            Command::DeleteSite { site, force } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.sites.delete(id, force).await?).with_message("Site deleted")
            }
            Command::StartSite { site } => {
                let id = self.site_id(&site).await?;
                fan_out_envelope(self.sites.start(id).await?, "started")
            }
            Command::StopSite { site } => {
                let id = self.site_id(&site).await?;
                fan_out_envelope(self.sites.stop(id).await?, "stopped")
            }
            Command::RestartSite { site } => {
                let id = self.site_id(&site).await?;
                fan_out_envelope(self.sites.restart(id).await?, "restarted")
            }
            Command::AddDomain { site, domain } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.sites.add_domain(id, &domain).await?).with_message("Domain added")
            }
            Command::RemoveDomain { site, domain } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.sites.remove_domain(id, &domain).await?)
                    .with_message("Domain removed")
            }
            Command::SetSiteEnvironment { site, environment } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.sites.set_environment(id, environment).await?)
                    .with_message("Environment updated")
            }

            // Services
            Command::CreateService { site, service } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.services.create(id, service).await?)
                    .with_message("Service created")
            }
            Command::GetService { service } => Envelope::ok(&self.service(&service).await?),
            Command::ListServices { site } => {
                let site_id = match site {
                    Some(site) => Some(self.site_id(&site).await?),
                    None => None,
                };
                Envelope::ok(&self.services.list(site_id).await)
            }
            Command::UpdateService { service, update } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.update(id, update).await?)
                    .with_message("Service updated")
            }
            Command::DeleteService { service, force } => {
                let id = self.service_id(&service).await?;
                self.services.delete(id, force).await?;
                Envelope::ok(&id).with_message("Service deleted")
            }
            Command::StartService { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.start(id).await?).with_message("Service started")
            }
            Command::StopService { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.stop(id).await?).with_message("Service stopped")
            }
            Command::RestartService { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.restart(id).await?).with_message("Service restarted")
            }
            Command::ServiceStatus { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.get_status(id).await?)
            }
            Command::ServiceHealth { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.check_health(id).await?)
            }
            Command::InstallService { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.install(id).await?)
            }
            Command::BuildService { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.build(id).await?)
            }
            Command::SetServiceEnvironment {
                service,
                environment,
            } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.set_environment(id, environment).await?)
                    .with_message("Environment updated")
            }
            Command::ListCommands { service } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.list_commands(id).await?)
            }
            Command::AddCommand { service, command } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.add_command(id, command).await?)
                    .with_message("Command added")
            }
            Command::RemoveCommand { service, name } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.remove_command(id, &name).await?)
                    .with_message("Command removed")
            }
            Command::ExecuteCommand {
                service,
                name,
                role,
            } => {
                let id = self.service_id(&service).await?;
                Envelope::ok(&self.services.execute_command(id, &name, role).await?)
            }

            // Stats and alerts
            Command::ServerStats => Envelope::ok(&self.collector.server_stats().await?),
            Command::ServerHistory { hours, limit } => {
                Envelope::ok(&self.collector.server_history(hours, limit).await?)
            }
            Command::SiteStats { site } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.collector.site_stats(id).await?)
            }
            Command::SiteHistory { site, hours, limit } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.collector.site_history(id, hours, limit).await?)
            }
            Command::SiteServicesStats { site } => {
                let id = self.site_id(&site).await?;
                Envelope::ok(&self.collector.site_services_stats(id).await?)
            }
            Command::ListAlerts { filter } => Envelope::ok(&self.alerts.list(&filter).await),
            Command::AcknowledgeAlert { alert_id, by } => {
                Envelope::ok(&self.alerts.acknowledge(alert_id, by).await?)
                    .with_message("Alert acknowledged")
            }
            Command::ResolveAlert { alert_id } => {
                Envelope::ok(&self.alerts.resolve(alert_id).await?).with_message("Alert resolved")
            }
            Command::GetMonitoringConfig => Envelope::ok(&self.collector.config().await),
            Command::UpdateMonitoringConfig(update) => {
                Envelope::ok(&self.collector.update_config(update).await?)
                    .with_message("Monitoring config updated")
            }
            Command::CollectorMetrics => Envelope::ok(&self.collector.metrics()),
            Command::Ping => Envelope::ok(&"pong"),
        };
        Ok(envelope)
    }
}

/// Site-wide operations report per-service results; mixed outcomes are a
/// partial failure that still carries the full report
fn fan_out_envelope(report: crate::sites::FanOutReport, verb: &str) -> Envelope {
    if report.is_complete() {
        let message = format!("{} service(s) {}", report.succeeded.len(), verb);
        return Envelope::ok(&report).with_message(message);
    }

    let error = HostplaneError::PartialFailure(format!(
        "{} of {} service(s) failed",
        report.failed.len(),
        report.failed.len() + report.succeeded.len()
    ));
    let mut envelope = Envelope::from_error(&error);
    envelope.data = serde_json::to_value(&report).ok();
    envelope
}
