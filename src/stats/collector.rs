use super::alerts::AlertEngine;
use super::probe::HostProbe;
use crate::config::MonitoringConfig;
use crate::error::{HostplaneError, Result};
use crate::events::{EventBus, PlatformEvent};
use crate::model::{
    stats::percent, EntityCounts, SampleId, ServerSample, ServiceStatus, ServiceUsage, Site,
    SiteId, SiteSample, SiteStatus,
};
use crate::services::ServiceManager;
use crate::state::Store;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Partial update of the runtime monitoring settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringUpdate {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub site_stats_enabled: Option<bool>,
    #[serde(default)]
    pub thresholds: Option<crate::config::Thresholds>,
    #[serde(default)]
    pub alert_dedup_window_secs: Option<u64>,
    #[serde(default)]
    pub dedup_policy: Option<crate::config::DedupPolicy>,
    #[serde(default)]
    pub retention_hours: Option<u64>,
}

/// What one collection cycle did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub server_sample: SampleId,
    pub site_samples: usize,
    pub alerts_raised: usize,
    pub samples_rotated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another cycle was still running
    Skipped,
    Completed(TickSummary),
    Failed(String),
}

/// Counters describing the autonomous loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorMetrics {
    pub ticks_completed: u64,
    pub ticks_skipped: u64,
    pub ticks_failed: u64,
    pub site_samples_failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    site_failed: AtomicU64,
}

/// Clears the in-flight flag when a tick ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodic host/site sampler and threshold evaluator
pub struct StatsCollector {
    store: Arc<Store>,
    services: Arc<ServiceManager>,
    probe: Arc<dyn HostProbe>,
    alerts: Arc<AlertEngine>,
    events: EventBus,
    config: Arc<RwLock<MonitoringConfig>>,
    in_flight: AtomicBool,
    server_cache: Mutex<Option<(Instant, ServerSample)>>,
    site_cache: Mutex<HashMap<SiteId, (Instant, SiteSample)>>,
    /// Held while a server sample is being taken
    server_refresh: Mutex<()>,
    /// Per-site counterpart of `server_refresh`
    site_refresh: Mutex<HashMap<SiteId, Arc<Mutex<()>>>>,
    counters: Counters,
    reconfigured: Notify,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatsCollector {
    pub fn new(
        store: Arc<Store>,
        services: Arc<ServiceManager>,
        probe: Arc<dyn HostProbe>,
        alerts: Arc<AlertEngine>,
        events: EventBus,
        config: Arc<RwLock<MonitoringConfig>>,
    ) -> Self {
        Self {
            store,
            services,
            probe,
            alerts,
            events,
            config,
            in_flight: AtomicBool::new(false),
            server_cache: Mutex::new(None),
            site_cache: Mutex::new(HashMap::new()),
            server_refresh: Mutex::new(()),
            site_refresh: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            reconfigured: Notify::new(),
            shutdown: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the collection loop
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { this.run_loop().await }));
        info!("Stats collector started");
    }

    /// Stop the loop; a tick already running finishes in the background
    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            self.shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!("Collector loop ended abnormally: {}", e);
            }
            info!("Stats collector stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let period = self.config.read().await.interval();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!("Collection interval set to {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            this.tick().await;
                        });
                    }
                    _ = self.reconfigured.notified() => {
                        info!("Monitoring config changed, restarting timer");
                        break;
                    }
                    _ = self.shutdown.notified() => return,
                }
            }
        }
    }

    /// Run one collection cycle unless one is already in flight
    pub async fn tick(&self) -> TickOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous collection still running, skipping tick");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return TickOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        let started = Instant::now();
        match self.collect_cycle().await {
            Ok(summary) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Collection cycle finished in {:?}: {} site samples, {} alerts",
                    started.elapsed(),
                    summary.site_samples,
                    summary.alerts_raised
                );
                TickOutcome::Completed(summary)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Collection cycle failed: {}", e);
                TickOutcome::Failed(e.to_string())
            }
        }
    }

    async fn collect_cycle(&self) -> Result<TickSummary> {
        let config = self.config.read().await.clone();

        let sample = self.collect_server().await?;
        let mut alerts_raised = match self.alerts.evaluate_server(&sample, &config.thresholds).await {
            Ok(raised) => raised.iter().filter(|r| r.is_new()).count(),
            Err(e) => {
                error!("Server threshold evaluation failed: {}", e);
                0
            }
        };

        let mut site_samples = 0;
        if config.site_stats_enabled {
            let active: Vec<Site> = self
                .store
                .read(|t| {
                    t.sites
                        .values()
                        .filter(|s| s.status == SiteStatus::Active)
                        .cloned()
                        .collect()
                })
                .await;

            for site in active {
                match self.collect_site(&site).await {
                    Ok(sample) => {
                        site_samples += 1;
                        match self
                            .alerts
                            .evaluate_site(&site, &sample, &config.thresholds)
                            .await
                        {
                            Ok(Some(raised)) if raised.is_new() => alerts_raised += 1,
                            Ok(_) => {}
                            Err(e) => error!("Site {} threshold evaluation failed: {}", site.name, e),
                        }
                    }
                    Err(e) => {
                        self.counters.site_failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Sampling site {} failed: {}", site.name, e);
                    }
                }
            }
        }

        let cutoff = Utc::now() - ChronoDuration::hours(config.retention_hours as i64);
        let samples_rotated = self.store.rotate_samples(cutoff).await?;
        if samples_rotated > 0 {
            debug!("Rotated {} samples older than {}", samples_rotated, cutoff);
        }

        Ok(TickSummary {
            server_sample: sample.id,
            site_samples,
            alerts_raised,
            samples_rotated,
        })
    }

    async fn collect_server(&self) -> Result<ServerSample> {
        let _refresh = self.server_refresh.lock().await;
        self.sample_server().await
    }

    async fn sample_server(&self) -> Result<ServerSample> {
        let probe = Arc::clone(&self.probe);
        let snapshot = tokio::task::spawn_blocking(move || probe.sample())
            .await
            .map_err(|e| HostplaneError::Internal(format!("probe task failed: {}", e)))??;

        let counts = self
            .store
            .read(|t| {
                let live: Vec<&Site> = t.sites.values().filter(|s| s.status.holds_ports()).collect();
                EntityCounts {
                    sites: live.len(),
                    active_sites: live.iter().filter(|s| s.status == SiteStatus::Active).count(),
                    services: t.services.len(),
                    running_services: t
                        .services
                        .values()
                        .filter(|s| s.status == ServiceStatus::Running)
                        .count(),
                    users: live.iter().map(|s| s.owner.as_str()).collect::<HashSet<_>>().len(),
                }
            })
            .await;

        let sample = ServerSample {
            id: SampleId::new(),
            timestamp: Utc::now(),
            cpu_percent: snapshot.cpu_percent,
            load_average: snapshot.load_average,
            memory_total: snapshot.memory_total,
            memory_used: snapshot.memory_used,
            memory_percent: percent(snapshot.memory_used, snapshot.memory_total),
            disk_total: snapshot.disk_total,
            disk_used: snapshot.disk_used,
            disk_percent: percent(snapshot.disk_used, snapshot.disk_total),
            network_rx_bytes: snapshot.network_rx_bytes,
            network_tx_bytes: snapshot.network_tx_bytes,
            uptime_secs: snapshot.uptime_secs,
            counts,
        };

        self.store.append_server_sample(sample.clone()).await?;
        *self.server_cache.lock().await = Some((Instant::now(), sample.clone()));
        self.events.publish(PlatformEvent::ServerSampleCollected {
            sample: sample.clone(),
        });

        Ok(sample)
    }

    async fn site_refresh_lock(&self, site_id: SiteId) -> Arc<Mutex<()>> {
        let mut locks = self.site_refresh.lock().await;
        Arc::clone(locks.entry(site_id).or_default())
    }

    async fn collect_site(&self, site: &Site) -> Result<SiteSample> {
        let lock = self.site_refresh_lock(site.id).await;
        let _refresh = lock.lock().await;
        self.sample_site(site).await
    }

    async fn sample_site(&self, site: &Site) -> Result<SiteSample> {
        let usage = self.services.service_usage(site.id).await?;

        let probe = Arc::clone(&self.probe);
        let root = site.root.clone();
        let disk_bytes = tokio::task::spawn_blocking(move || probe.path_usage(&root))
            .await
            .map_err(|e| HostplaneError::Internal(format!("probe task failed: {}", e)))??;

        let sample = SiteSample {
            id: SampleId::new(),
            site_id: site.id,
            timestamp: Utc::now(),
            cpu_percent: usage.iter().map(|u| u.cpu_percent).sum(),
            memory_bytes: usage.iter().map(|u| u.memory_bytes).sum(),
            disk_bytes,
            services_total: usage.len(),
            services_running: usage.iter().filter(|u| u.active).count(),
        };

        self.store.append_site_sample(sample.clone()).await?;
        self.site_cache
            .lock()
            .await
            .insert(site.id, (Instant::now(), sample.clone()));
        self.events.publish(PlatformEvent::SiteSampleCollected {
            sample: sample.clone(),
        });

        Ok(sample)
    }

    async fn cached_server(&self, ttl: std::time::Duration) -> Option<ServerSample> {
        match *self.server_cache.lock().await {
            Some((at, ref sample)) if at.elapsed() < ttl => Some(sample.clone()),
            _ => None,
        }
    }

    async fn cached_site(&self, site_id: SiteId, ttl: std::time::Duration) -> Option<SiteSample> {
        match self.site_cache.lock().await.get(&site_id) {
            Some((at, sample)) if at.elapsed() < ttl => Some(sample.clone()),
            _ => None,
        }
    }

    /// Latest server sample, collected now if the cache is stale.
    /// Concurrent callers share one collection.
    pub async fn server_stats(&self) -> Result<ServerSample> {
        let ttl = self.config.read().await.server_cache_ttl();
        if let Some(sample) = self.cached_server(ttl).await {
            return Ok(sample);
        }

        let _refresh = self.server_refresh.lock().await;
        if let Some(sample) = self.cached_server(ttl).await {
            return Ok(sample);
        }
        self.sample_server().await
    }

    /// Latest sample of one site, collected now if the cache is stale
    pub async fn site_stats(&self, site_id: SiteId) -> Result<SiteSample> {
        let site = self.store.site(site_id).await?;
        let ttl = self.config.read().await.site_cache_ttl();
        if let Some(sample) = self.cached_site(site_id, ttl).await {
            return Ok(sample);
        }

        let lock = self.site_refresh_lock(site_id).await;
        let _refresh = lock.lock().await;
        if let Some(sample) = self.cached_site(site_id, ttl).await {
            return Ok(sample);
        }
        self.sample_site(&site).await
    }

    /// Server samples of the last `hours`, oldest first
    pub async fn server_history(&self, hours: u32, limit: Option<usize>) -> Result<Vec<ServerSample>> {
        let since = window_start(hours)?;
        Ok(self.store.server_samples_since(since, limit).await)
    }

    /// Site samples of the last `hours`, oldest first
    pub async fn site_history(
        &self,
        site_id: SiteId,
        hours: u32,
        limit: Option<usize>,
    ) -> Result<Vec<SiteSample>> {
        self.store.site(site_id).await?;
        let since = window_start(hours)?;
        Ok(self.store.site_samples_since(site_id, since, limit).await)
    }

    pub async fn site_services_stats(&self, site_id: SiteId) -> Result<Vec<ServiceUsage>> {
        self.services.service_usage(site_id).await
    }

    pub async fn config(&self) -> MonitoringConfig {
        self.config.read().await.clone()
    }

    /// Apply a config change; it takes effect from the next cycle
    pub async fn update_config(&self, update: MonitoringUpdate) -> Result<MonitoringConfig> {
        let mut config = self.config.write().await;
        let mut next = config.clone();

        if let Some(interval) = update.interval_secs {
            next.interval_secs = interval;
        }
        if let Some(enabled) = update.site_stats_enabled {
            next.site_stats_enabled = enabled;
        }
        if let Some(thresholds) = update.thresholds {
            next.thresholds = thresholds;
        }
        if let Some(window) = update.alert_dedup_window_secs {
            next.alert_dedup_window_secs = window;
        }
        if let Some(policy) = update.dedup_policy {
            next.dedup_policy = policy;
        }
        if let Some(retention) = update.retention_hours {
            next.retention_hours = retention;
        }

        next.validate().map_err(|e| match e {
            HostplaneError::ConfigValidationError(msg) => HostplaneError::Validation(msg),
            other => other,
        })?;

        let interval_changed = next.interval_secs != config.interval_secs;
        *config = next.clone();
        drop(config);

        if interval_changed {
            self.reconfigured.notify_one();
        }
        info!("Monitoring config updated");
        Ok(next)
    }

    pub fn metrics(&self) -> CollectorMetrics {
        CollectorMetrics {
            ticks_completed: self.counters.completed.load(Ordering::Relaxed),
            ticks_skipped: self.counters.skipped.load(Ordering::Relaxed),
            ticks_failed: self.counters.failed.load(Ordering::Relaxed),
            site_samples_failed: self.counters.site_failed.load(Ordering::Relaxed),
        }
    }
}

fn window_start(hours: u32) -> Result<chrono::DateTime<Utc>> {
    if hours == 0 {
        return Err(HostplaneError::Validation(
            "History window must be at least one hour".to_string(),
        ));
    }
    Ok(Utc::now() - ChronoDuration::hours(hours as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::mock::{MockProbe, MockRunner, MockSupervisor};
    use std::time::Duration;

    fn collector(probe: Arc<MockProbe>, config: MonitoringConfig) -> Arc<StatsCollector> {
        let store = Arc::new(Store::in_memory());
        let events = EventBus::new();
        let config = Arc::new(RwLock::new(config));
        let services = Arc::new(ServiceManager::new(
            store.clone(),
            Arc::new(MockSupervisor::new()),
            Arc::new(MockRunner::new()),
            PlatformConfig::default(),
            events.clone(),
        ));
        let alerts = Arc::new(AlertEngine::new(store.clone(), events.clone(), config.clone()));
        Arc::new(StatsCollector::new(
            store, services, probe, alerts, events, config,
        ))
    }

    #[tokio::test]
    async fn test_tick_records_sample() {
        let probe = Arc::new(MockProbe::new());
        let collector = collector(probe.clone(), MonitoringConfig::default());

        match collector.tick().await {
            TickOutcome::Completed(summary) => assert_eq!(summary.site_samples, 0),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(probe.sample_count(), 1);
        assert_eq!(collector.server_history(1, None).await.unwrap().len(), 1);
        assert_eq!(collector.metrics().ticks_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_probe_is_counted_not_raised() {
        let probe = Arc::new(MockProbe::new());
        probe.set_failing(true);
        let collector = collector(probe.clone(), MonitoringConfig::default());

        assert!(matches!(collector.tick().await, TickOutcome::Failed(_)));
        assert_eq!(collector.metrics().ticks_failed, 1);

        // The guard was released
        probe.set_failing(false);
        assert!(matches!(collector.tick().await, TickOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let probe = Arc::new(MockProbe::new());
        probe.set_delay(Duration::from_millis(200));
        let collector = collector(probe.clone(), MonitoringConfig::default());

        let (first, second) = tokio::join!(collector.tick(), collector.tick());
        let skipped = [&first, &second]
            .iter()
            .filter(|o| matches!(o, TickOutcome::Skipped))
            .count();
        assert_eq!(skipped, 1);
        assert_eq!(probe.sample_count(), 1);
        assert_eq!(collector.metrics().ticks_skipped, 1);
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let collector = collector(Arc::new(MockProbe::new()), MonitoringConfig::default());

        let updated = collector
            .update_config(MonitoringUpdate {
                interval_secs: Some(60),
                site_stats_enabled: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.interval_secs, 60);
        assert!(!collector.config().await.site_stats_enabled);

        let result = collector
            .update_config(MonitoringUpdate {
                interval_secs: Some(0),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(HostplaneError::Validation(_))));
        assert_eq!(collector.config().await.interval_secs, 60);
    }

    #[tokio::test]
    async fn test_history_rejects_empty_window() {
        let collector = collector(Arc::new(MockProbe::new()), MonitoringConfig::default());
        assert!(collector.server_history(0, None).await.is_err());
    }

    #[tokio::test]
    async fn test_loop_start_stop() {
        let probe = Arc::new(MockProbe::new());
        let collector = collector(probe.clone(), MonitoringConfig::default());

        collector.start().await;
        assert!(collector.is_running().await);
        // The first tick fires immediately
        for _ in 0..50 {
            if probe.sample_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        collector.stop().await;
        assert!(!collector.is_running().await);
        assert!(probe.sample_count() >= 1);
    }
}
