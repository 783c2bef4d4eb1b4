use crate::config::{DedupPolicy, MonitoringConfig, Threshold, Thresholds};
use crate::error::Result;
use crate::events::{EventBus, PlatformEvent};
use crate::model::{
    stats::percent, Alert, AlertFilter, AlertId, AlertSeverity, AlertStatus, AlertType,
    ServerSample, ServiceId, Site, SiteId, SiteSample,
};
use crate::services::ServiceFailure;
use crate::state::Store;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Alert request before deduplication
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub site_id: Option<SiteId>,
    pub service_id: Option<ServiceId>,
    pub data: serde_json::Value,
}

/// What `create_alert` did with a request
#[derive(Debug, Clone, PartialEq)]
pub enum Raised {
    New(Alert),
    /// Absorbed by an open alert with the same key
    Deduplicated(Alert),
}

impl Raised {
    pub fn alert(&self) -> &Alert {
        match self {
            Raised::New(alert) | Raised::Deduplicated(alert) => alert,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Raised::New(_))
    }
}

/// Creates, deduplicates and transitions alerts
pub struct AlertEngine {
    store: Arc<Store>,
    events: EventBus,
    config: Arc<RwLock<MonitoringConfig>>,
}

impl AlertEngine {
    pub fn new(store: Arc<Store>, events: EventBus, config: Arc<RwLock<MonitoringConfig>>) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Record an alert unless an open alert with the same
    /// (type, severity, site, service) falls inside the dedup window
    pub async fn create_alert(&self, new: NewAlert) -> Result<Raised> {
        let (window, policy) = {
            let config = self.config.read().await;
            (config.dedup_window(), config.dedup_policy)
        };

        let raised = self
            .store
            .write(|t| {
                let now = Utc::now();
                let cutoff = now - window;

                let existing = t
                    .alerts
                    .values_mut()
                    .filter(|a| {
                        a.status.is_open()
                            && a.same_key(new.alert_type, new.severity, new.site_id, new.service_id)
                    })
                    .filter(|a| match policy {
                        DedupPolicy::Extend => a.last_seen_at >= cutoff,
                        DedupPolicy::Absorb | DedupPolicy::Count => a.created_at >= cutoff,
                    })
                    .max_by_key(|a| a.created_at);

                if let Some(alert) = existing {
                    if policy != DedupPolicy::Absorb {
                        alert.occurrences += 1;
                        alert.last_seen_at = now;
                    }
                    return Ok(Raised::Deduplicated(alert.clone()));
                }

                let alert = Alert {
                    id: AlertId::new(),
                    alert_type: new.alert_type,
                    severity: new.severity,
                    status: AlertStatus::Active,
                    message: new.message,
                    site_id: new.site_id,
                    service_id: new.service_id,
                    data: new.data,
                    occurrences: 1,
                    created_at: now,
                    last_seen_at: now,
                    acknowledged_at: None,
                    acknowledged_by: None,
                    resolved_at: None,
                };
                t.alerts.insert(alert.id, alert.clone());
                Ok(Raised::New(alert))
            })
            .await?;

        match raised {
            Raised::New(ref alert) => {
                warn!(
                    "Alert {} [{}/{}]: {}",
                    alert.id, alert.alert_type, alert.severity, alert.message
                );
                self.events.publish(PlatformEvent::AlertCreated {
                    alert: alert.clone(),
                });
            }
            Raised::Deduplicated(ref alert) if policy != DedupPolicy::Absorb => {
                self.events.publish(PlatformEvent::AlertUpdated {
                    alert: alert.clone(),
                });
            }
            Raised::Deduplicated(_) => {}
        }

        Ok(raised)
    }

    /// Evaluate host thresholds against a server sample
    pub async fn evaluate_server(
        &self,
        sample: &ServerSample,
        thresholds: &Thresholds,
    ) -> Result<Vec<Raised>> {
        let checks = [
            (AlertType::CpuHigh, "CPU usage", sample.cpu_percent, &thresholds.cpu),
            (
                AlertType::MemoryHigh,
                "Memory usage",
                sample.memory_percent,
                &thresholds.memory,
            ),
            (AlertType::DiskHigh, "Disk usage", sample.disk_percent, &thresholds.disk),
        ];

        let mut raised = Vec::new();
        for (alert_type, label, value, threshold) in checks {
            if let Some(new) = breach(alert_type, label, value, threshold, None) {
                raised.push(self.create_alert(new).await?);
            }
        }
        Ok(raised)
    }

    /// Compare site memory against its limit, if it has one
    pub async fn evaluate_site(
        &self,
        site: &Site,
        sample: &SiteSample,
        thresholds: &Thresholds,
    ) -> Result<Option<Raised>> {
        let Some(limit) = site.limits.memory_bytes() else {
            return Ok(None);
        };

        let value = percent(sample.memory_bytes, limit);
        let label = format!("Site {} memory", site.name);
        match breach(
            AlertType::SiteMemoryHigh,
            &label,
            value,
            &thresholds.memory,
            Some(site.id),
        ) {
            Some(new) => Ok(Some(self.create_alert(new).await?)),
            None => Ok(None),
        }
    }

    /// Raise a critical alert for a service that died on its own
    pub async fn service_failed(&self, failure: &ServiceFailure) -> Result<Raised> {
        let cause = if failure.exit.oom {
            "was killed for exceeding its memory limit".to_string()
        } else if let Some(signal) = failure.exit.signal {
            format!("was killed by signal {}", signal)
        } else {
            format!("exited unexpectedly with code {:?}", failure.exit.code)
        };

        self.create_alert(NewAlert {
            alert_type: AlertType::ServiceFailed,
            severity: AlertSeverity::Critical,
            message: format!("Service {} {}", failure.name, cause),
            site_id: Some(failure.site_id),
            service_id: Some(failure.service_id),
            data: json!({
                "unit": failure.exit.unit,
                "exit_code": failure.exit.code,
                "signal": failure.exit.signal,
                "oom": failure.exit.oom,
            }),
        })
        .await
    }

    pub async fn acknowledge(&self, id: AlertId, by: Option<String>) -> Result<Alert> {
        let alert = self
            .store
            .write(|t| {
                let alert = t.alert_mut(id)?;
                alert.acknowledge(by)?;
                Ok(alert.clone())
            })
            .await?;

        info!("Alert {} acknowledged", id);
        self.events.publish(PlatformEvent::AlertUpdated {
            alert: alert.clone(),
        });
        Ok(alert)
    }

    pub async fn resolve(&self, id: AlertId) -> Result<Alert> {
        let alert = self
            .store
            .write(|t| {
                let alert = t.alert_mut(id)?;
                alert.resolve()?;
                Ok(alert.clone())
            })
            .await?;

        info!("Alert {} resolved", id);
        self.events.publish(PlatformEvent::AlertUpdated {
            alert: alert.clone(),
        });
        Ok(alert)
    }

    pub async fn list(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.store.alerts(filter).await
    }
}

fn breach(
    alert_type: AlertType,
    label: &str,
    value: f64,
    threshold: &Threshold,
    site_id: Option<SiteId>,
) -> Option<NewAlert> {
    let (severity, limit) = threshold.classify(value)?;
    Some(NewAlert {
        alert_type,
        severity,
        message: format!(
            "{} at {:.1}% exceeds {} threshold of {:.0}%",
            label, value, severity, limit
        ),
        site_id,
        service_id: None,
        data: json!({ "value": value, "threshold": limit }),
    })
}
