// Sites module - Tenant workspaces and fan-out over their services

pub mod provisioner;

pub use provisioner::{LocalProvisioner, SiteProvisioner};

use crate::allocator;
use crate::config::PlatformConfig;
use crate::error::{HostplaneError, Result};
use crate::events::EventBus;
use crate::model::{
    validate_environment, validate_slug, NewSite, Service, ServiceId, Site, SiteId, SiteStatus,
    SiteUpdate,
};
use crate::services::ServiceManager;
use crate::state::Store;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Service that completed its part of a site-wide operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub service_id: ServiceId,
    pub name: String,
}

/// Service that failed its part of a site-wide operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFailureRef {
    pub service_id: ServiceId,
    pub name: String,
    pub error: String,
}

/// Per-service outcome of a site-wide operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub succeeded: Vec<ServiceRef>,
    pub failed: Vec<ServiceFailureRef>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Manages sites and their host resources
pub struct SiteManager {
    store: Arc<Store>,
    services: Arc<ServiceManager>,
    provisioner: Arc<dyn SiteProvisioner>,
    config: PlatformConfig,
    events: EventBus,
}

impl SiteManager {
    pub fn new(
        store: Arc<Store>,
        services: Arc<ServiceManager>,
        provisioner: Arc<dyn SiteProvisioner>,
        config: PlatformConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            services,
            provisioner,
            config,
            events,
        }
    }

    /// Create a site: reserve its range, provision, then activate
    pub async fn create(&self, def: NewSite) -> Result<Site> {
        validate_slug("site", &def.name)?;
        if def.owner.trim().is_empty() {
            return Err(HostplaneError::Validation(
                "Site owner must not be empty".to_string(),
            ));
        }
        let limits = def.limits.clone().unwrap_or_default();
        allocator::validate_limits(&limits, &self.config.limits)?;
        let width = def
            .port_count
            .unwrap_or(self.config.ports.default_range_width);

        let site = self
            .store
            .write(|t| {
                if t
                    .sites
                    .values()
                    .any(|s| s.name == def.name && s.status.holds_ports())
                {
                    return Err(HostplaneError::AlreadyExists(format!("site {}", def.name)));
                }

                let port_range = allocator::allocate_range(t.sites.values(), &self.config.ports, width)?;
                let now = Utc::now();
                let site = Site {
                    id: SiteId::new(),
                    display_name: def.display_name.clone().unwrap_or_else(|| def.name.clone()),
                    name: def.name.clone(),
                    description: def.description.clone(),
                    status: SiteStatus::Creating,
                    owner: def.owner.clone(),
                    port_range,
                    domains: Vec::new(),
                    environment: BTreeMap::new(),
                    limits,
                    root: self.config.paths.sites_root.join(&def.name),
                    account: None,
                    created_at: now,
                    updated_at: now,
                };
                t.sites.insert(site.id, site.clone());
                Ok(site)
            })
            .await?;

        info!(
            "Reserved ports {} for site {}",
            site.port_range, site.name
        );
        self.events.site_status(site.id, SiteStatus::Creating);

        let provisioned = async {
            self.provisioner.create_root(&site).await?;
            self.provisioner.create_account(&site).await
        }
        .await;

        match provisioned {
            Ok(account) => {
                let site = self
                    .store
                    .write(|t| {
                        let site = t.site_mut(site.id)?;
                        transition(site, SiteStatus::Active)?;
                        site.account = account;
                        Ok(site.clone())
                    })
                    .await?;
                self.events.site_status(site.id, site.status);
                info!("Created site {}", site.name);
                Ok(site)
            }
            Err(e) => {
                error!("Provisioning of site {} failed: {}", site.name, e);
                self.set_status(site.id, SiteStatus::Error).await?;
                Err(match e {
                    HostplaneError::Provision(_) => e,
                    other => HostplaneError::Provision(other.to_string()),
                })
            }
        }
    }

    pub async fn get(&self, id: SiteId) -> Result<Site> {
        self.store.site(id).await
    }

    /// Look a site up by id or by name
    pub async fn resolve(&self, reference: &str) -> Result<Site> {
        if let Some(id) = SiteId::parse(reference) {
            return self.get(id).await;
        }
        self.store
            .find_site_by_name(reference)
            .await
            .ok_or_else(|| HostplaneError::SiteNotFound(reference.to_string()))
    }

    /// Sites, oldest first; deleted sites only when asked for
    pub async fn list(&self, include_deleted: bool) -> Vec<Site> {
        let mut sites: Vec<Site> = self
            .store
            .sites()
            .await
            .into_iter()
            .filter(|s| include_deleted || s.status != SiteStatus::Deleted)
            .collect();
        sites.sort_by_key(|s| s.created_at);
        sites
    }

    pub async fn update(&self, id: SiteId, update: SiteUpdate) -> Result<Site> {
        if let Some(ref display_name) = update.display_name {
            if display_name.trim().is_empty() {
                return Err(HostplaneError::Validation(
                    "Display name must not be empty".to_string(),
                ));
            }
        }

        self.store
            .write(|t| {
                let site = t.site_mut(id)?;
                if site.status == SiteStatus::Deleted {
                    return Err(deleted(site));
                }
                if let Some(display_name) = update.display_name {
                    site.display_name = display_name;
                }
                if let Some(description) = update.description {
                    site.description = description;
                }
                site.touch();
                Ok(site.clone())
            })
            .await
    }

    async fn set_status(&self, id: SiteId, status: SiteStatus) -> Result<Site> {
        let site = self
            .store
            .write(|t| {
                let site = t.site_mut(id)?;
                transition(site, status)?;
                Ok(site.clone())
            })
            .await?;
        self.events.site_status(id, status);
        Ok(site)
    }

    async fn fan_out<F, Fut>(&self, site: &Site, op: F) -> FanOutReport
    where
        F: Fn(ServiceId) -> Fut,
        Fut: Future<Output = Result<Service>>,
    {
        let mut report = FanOutReport::default();
        for service in self.store.services_for_site(site.id).await {
            match op(service.id).await {
                Ok(_) => report.succeeded.push(ServiceRef {
                    service_id: service.id,
                    name: service.name,
                }),
                Err(e) => {
                    warn!("Service {} in site {}: {}", service.name, site.name, e);
                    report.failed.push(ServiceFailureRef {
                        service_id: service.id,
                        name: service.name,
                        error: e.public_message(),
                    });
                }
            }
        }
        report
    }

    fn ensure_operable(site: &Site) -> Result<()> {
        if site.status.accepts_services() {
            Ok(())
        } else {
            Err(HostplaneError::InvalidState(
                format!("site {}", site.name),
                format!("cannot operate services while {}", site.status),
            ))
        }
    }

    /// Start every service; the site becomes active
    pub async fn start(&self, id: SiteId) -> Result<FanOutReport> {
        let site = self.get(id).await?;
        Self::ensure_operable(&site)?;

        let report = self.fan_out(&site, |sid| self.services.start(sid)).await;
        self.set_status(id, SiteStatus::Active).await?;
        info!(
            "Started site {}: {} ok, {} failed",
            site.name,
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Stop every service; the site becomes stopped only if all of them did
    pub async fn stop(&self, id: SiteId) -> Result<FanOutReport> {
        let site = self.get(id).await?;
        Self::ensure_operable(&site)?;

        let report = self.fan_out(&site, |sid| self.services.stop(sid)).await;
        if report.is_complete() {
            self.set_status(id, SiteStatus::Stopped).await?;
        }
        info!(
            "Stopped site {}: {} ok, {} failed",
            site.name,
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub async fn restart(&self, id: SiteId) -> Result<FanOutReport> {
        let site = self.get(id).await?;
        Self::ensure_operable(&site)?;

        let report = self.fan_out(&site, |sid| self.services.restart(sid)).await;
        self.set_status(id, SiteStatus::Active).await?;
        Ok(report)
    }

    /// Delete the site and everything it owns.
    ///
    /// Without `force`, any nested failure leaves the site in `error` and
    /// returns `PartialFailure`; services already deleted stay deleted.
    pub async fn delete(&self, id: SiteId, force: bool) -> Result<Site> {
        let site = self.get(id).await?;
        if site.status == SiteStatus::Deleted {
            return Ok(site);
        }
        let site = self.set_status(id, SiteStatus::Deleting).await?;
        info!("Deleting site {} (force: {})", site.name, force);

        let mut failures: Vec<String> = Vec::new();

        for service in self.store.services_for_site(id).await {
            if let Err(e) = self.services.delete(service.id, force).await {
                warn!("Deleting service {} failed: {}", service.name, e);
                failures.push(format!("service {}: {}", service.name, e.public_message()));
            }
        }

        if let Err(e) = self.provisioner.remove_databases(&site).await {
            failures.push(format!("databases: {}", e.public_message()));
        }

        if !failures.is_empty() && !force {
            return self.abort_delete(&site, failures).await;
        }

        if let Err(e) = self.provisioner.remove_account(&site).await {
            failures.push(format!("account: {}", e.public_message()));
        }
        if let Err(e) = self.provisioner.remove_root(&site).await {
            failures.push(format!("root directory: {}", e.public_message()));
        }

        if !failures.is_empty() {
            if !force {
                return self.abort_delete(&site, failures).await;
            }
            warn!(
                "Force deleting site {} despite: {}",
                site.name,
                failures.join("; ")
            );
        }

        let site = self
            .store
            .write(|t| {
                let site = t.site_mut(id)?;
                transition(site, SiteStatus::Deleted)?;
                site.domains.clear();
                Ok(site.clone())
            })
            .await?;
        self.events.site_status(id, SiteStatus::Deleted);
        info!("Deleted site {}, released ports {}", site.name, site.port_range);
        Ok(site)
    }

    async fn abort_delete(&self, site: &Site, failures: Vec<String>) -> Result<Site> {
        error!(
            "Deletion of site {} incomplete: {}",
            site.name,
            failures.join("; ")
        );
        self.set_status(site.id, SiteStatus::Error).await?;
        Err(HostplaneError::PartialFailure(format!(
            "site {} was not fully deleted: {}",
            site.name,
            failures.join("; ")
        )))
    }

    pub async fn add_domain(&self, id: SiteId, domain: &str) -> Result<Site> {
        let domain = normalize_domain(domain)?;

        self.store
            .write(|t| {
                if let Some(owner) = t
                    .sites
                    .values()
                    .find(|s| s.status.holds_ports() && s.domains.contains(&domain))
                {
                    return Err(HostplaneError::AlreadyExists(format!(
                        "domain {} is attached to site {}",
                        domain, owner.name
                    )));
                }

                let site = t.site_mut(id)?;
                if site.status == SiteStatus::Deleted {
                    return Err(deleted(site));
                }
                site.domains.push(domain.clone());
                site.touch();
                Ok(site.clone())
            })
            .await
    }

    pub async fn remove_domain(&self, id: SiteId, domain: &str) -> Result<Site> {
        let domain = domain.trim().to_ascii_lowercase();

        self.store
            .write(|t| {
                let site = t.site_mut(id)?;
                let index = site
                    .domains
                    .iter()
                    .position(|d| *d == domain)
                    .ok_or_else(|| {
                        HostplaneError::Validation(format!(
                            "Domain {} is not attached to site {}",
                            domain, site.name
                        ))
                    })?;
                site.domains.remove(index);
                site.touch();
                Ok(site.clone())
            })
            .await
    }

    /// Replace the site-wide environment and rewrite its services' units
    pub async fn set_environment(
        &self,
        id: SiteId,
        environment: BTreeMap<String, String>,
    ) -> Result<Site> {
        validate_environment(&environment)?;

        let site = self
            .store
            .write(|t| {
                let site = t.site_mut(id)?;
                if site.status == SiteStatus::Deleted {
                    return Err(deleted(site));
                }
                site.environment = environment;
                site.touch();
                Ok(site.clone())
            })
            .await?;

        self.services.refresh_units(id).await?;
        Ok(site)
    }
}

fn transition(site: &mut Site, next: SiteStatus) -> Result<()> {
    if !site.status.can_transition_to(next) {
        return Err(HostplaneError::InvalidState(
            format!("site {}", site.name),
            format!("cannot move from {} to {}", site.status, next),
        ));
    }
    site.status = next;
    site.touch();
    Ok(())
}

fn deleted(site: &Site) -> HostplaneError {
    HostplaneError::InvalidState(format!("site {}", site.name), "site is deleted".to_string())
}

/// Validate a hostname and return its canonical lowercase form
pub fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    });

    if domain.len() > 253 || !domain.contains('.') || !labels_ok {
        return Err(HostplaneError::Validation(format!(
            "Invalid domain name: '{}'",
            domain
        )));
    }

    Ok(domain)
}
