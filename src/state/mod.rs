// State module - Persistent storage for sites, services, samples and alerts

use crate::error::{HostplaneError, Result};
use crate::model::{
    Alert, AlertFilter, AlertId, ServerSample, Service, ServiceId, Site, SiteId, SiteSample,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Version of the state file format
const STATE_VERSION: &str = "1.0.0";

const SERVER_SERIES: &str = "server";
const SITE_SERIES: &str = "site";

/// In-memory entity tables, the working copy of the persisted snapshot
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub sites: BTreeMap<SiteId, Site>,
    pub services: BTreeMap<ServiceId, Service>,
    pub alerts: BTreeMap<AlertId, Alert>,
}

/// Sample series, time-ordered oldest first
#[derive(Debug, Default)]
struct Samples {
    server: Vec<ServerSample>,
    site: Vec<SiteSample>,
}

impl Tables {
    pub fn site(&self, id: SiteId) -> Result<&Site> {
        self.sites
            .get(&id)
            .ok_or_else(|| HostplaneError::SiteNotFound(id.to_string()))
    }

    pub fn site_mut(&mut self, id: SiteId) -> Result<&mut Site> {
        self.sites
            .get_mut(&id)
            .ok_or_else(|| HostplaneError::SiteNotFound(id.to_string()))
    }

    pub fn service(&self, id: ServiceId) -> Result<&Service> {
        self.services
            .get(&id)
            .ok_or_else(|| HostplaneError::ServiceNotFound(id.to_string()))
    }

    pub fn service_mut(&mut self, id: ServiceId) -> Result<&mut Service> {
        self.services
            .get_mut(&id)
            .ok_or_else(|| HostplaneError::ServiceNotFound(id.to_string()))
    }

    pub fn alert_mut(&mut self, id: AlertId) -> Result<&mut Alert> {
        self.alerts
            .get_mut(&id)
            .ok_or_else(|| HostplaneError::AlertNotFound(id.to_string()))
    }

    pub fn services_of(&self, site_id: SiteId) -> impl Iterator<Item = &Service> {
        self.services.values().filter(move |s| s.site_id == site_id)
    }
}

/// Complete state that gets persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: String,
    pub sites: Vec<Site>,
    pub services: Vec<Service>,
    pub alerts: Vec<Alert>,
    pub last_updated: DateTime<Utc>,
}

impl PersistedState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            sites: Vec::new(),
            services: Vec::new(),
            alerts: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    fn from_tables(tables: &Tables) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            sites: tables.sites.values().cloned().collect(),
            services: tables.services.values().cloned().collect(),
            alerts: tables.alerts.values().cloned().collect(),
            last_updated: Utc::now(),
        }
    }

    fn into_tables(self) -> Tables {
        Tables {
            sites: self.sites.into_iter().map(|s| (s.id, s)).collect(),
            services: self.services.into_iter().map(|s| (s.id, s)).collect(),
            alerts: self.alerts.into_iter().map(|a| (a.id, a)).collect(),
        }
    }

    /// Validate the state structure
    pub fn validate(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(HostplaneError::StateCorruption(format!(
                "Incompatible state version: expected {}, found {}",
                STATE_VERSION, self.version
            )));
        }

        let mut seen_sites = HashSet::new();
        for site in &self.sites {
            if !seen_sites.insert(site.id) {
                return Err(HostplaneError::StateCorruption(format!(
                    "Duplicate site ID found: {}",
                    site.id
                )));
            }
        }

        let holding: Vec<&Site> = self
            .sites
            .iter()
            .filter(|s| s.status.holds_ports())
            .collect();
        for (i, a) in holding.iter().enumerate() {
            for b in &holding[i + 1..] {
                if a.port_range.overlaps(&b.port_range) {
                    return Err(HostplaneError::StateCorruption(format!(
                        "Sites {} and {} have overlapping port ranges",
                        a.name, b.name
                    )));
                }
            }
        }

        let mut seen_services = HashSet::new();
        let mut seen_ports = HashSet::new();
        for service in &self.services {
            if !seen_services.insert(service.id) {
                return Err(HostplaneError::StateCorruption(format!(
                    "Duplicate service ID found: {}",
                    service.id
                )));
            }

            let site = self
                .sites
                .iter()
                .find(|s| s.id == service.site_id)
                .ok_or_else(|| {
                    HostplaneError::StateCorruption(format!(
                        "Service {} references unknown site {}",
                        service.name, service.site_id
                    ))
                })?;

            if !site.port_range.contains(service.port) {
                return Err(HostplaneError::StateCorruption(format!(
                    "Service {} port {} is outside site {} range {}",
                    service.name, service.port, site.name, site.port_range
                )));
            }

            if !seen_ports.insert((service.site_id, service.port)) {
                return Err(HostplaneError::StateCorruption(format!(
                    "Port {} is assigned twice in site {}",
                    service.port, site.name
                )));
            }
        }

        Ok(())
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles persistence of the state file with atomic writes
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load state from disk
    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::new());
        }

        let file = File::open(&self.path).map_err(|e| {
            HostplaneError::StateLoadError(format!("Failed to open state file: {}", e))
        })?;

        let reader = BufReader::new(file);

        let state: PersistedState = serde_json::from_reader(reader).map_err(|e| {
            HostplaneError::StateLoadError(format!("Failed to parse state file: {}", e))
        })?;

        state.validate()?;

        Ok(state)
    }

    /// Save state to disk with atomic writes
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HostplaneError::StateSaveError(format!("Failed to create state directory: {}", e))
            })?;
        }

        let temp_path = self.path.with_extension("tmp");

        {
            let file = File::create(&temp_path).map_err(|e| {
                HostplaneError::StateSaveError(format!("Failed to create temp state file: {}", e))
            })?;

            let mut writer = BufWriter::new(file);

            serde_json::to_writer(&mut writer, state).map_err(|e| {
                HostplaneError::StateSaveError(format!("Failed to serialize state: {}", e))
            })?;

            writer.flush().map_err(|e| {
                HostplaneError::StateSaveError(format!("Failed to flush state file: {}", e))
            })?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            HostplaneError::StateSaveError(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only sample logs, one JSON line per sample, one file per series and day
#[derive(Debug, Clone)]
pub struct SampleLog {
    dir: PathBuf,
}

impl SampleLog {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn segment(&self, series: &str, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}-{}.jsonl", series, day.format("%Y-%m-%d")))
    }

    fn segment_day(series: &str, file_name: &str) -> Option<NaiveDate> {
        let day = file_name
            .strip_prefix(series)?
            .strip_prefix('-')?
            .strip_suffix(".jsonl")?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    /// Read every segment of a series, oldest first. Unparseable lines are skipped.
    fn load<T: DeserializeOwned>(
        &self,
        series: &str,
        timestamp: impl Fn(&T) -> DateTime<Utc>,
    ) -> Result<Vec<T>> {
        let mut samples = Vec::new();
        if !self.dir.is_dir() {
            return Ok(samples);
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            HostplaneError::StateLoadError(format!("Failed to read sample directory: {}", e))
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if Self::segment_day(series, &name).is_none() {
                continue;
            }

            let file = File::open(entry.path()).map_err(|e| {
                HostplaneError::StateLoadError(format!("Failed to open {}: {}", name, e))
            })?;
            for (number, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| {
                    HostplaneError::StateLoadError(format!("Failed to read {}: {}", name, e))
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(&line) {
                    Ok(sample) => samples.push(sample),
                    Err(e) => {
                        tracing::warn!("Skipping bad sample at {}:{}: {}", name, number + 1, e)
                    }
                }
            }
        }

        samples.sort_by_key(|s| timestamp(s));
        Ok(samples)
    }

    async fn append<T: Serialize>(
        &self,
        series: &str,
        timestamp: DateTime<Utc>,
        sample: &T,
    ) -> Result<()> {
        let mut line = serde_json::to_vec(sample).map_err(|e| {
            HostplaneError::StateSaveError(format!("Failed to serialize sample: {}", e))
        })?;
        line.push(b'\n');

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            HostplaneError::StateSaveError(format!("Failed to create sample directory: {}", e))
        })?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.segment(series, timestamp.date_naive()))
            .await
            .map_err(|e| {
                HostplaneError::StateSaveError(format!("Failed to open sample log: {}", e))
            })?;

        file.write_all(&line).await.map_err(|e| {
            HostplaneError::StateSaveError(format!("Failed to append sample: {}", e))
        })?;
        file.flush().await.map_err(|e| {
            HostplaneError::StateSaveError(format!("Failed to flush sample log: {}", e))
        })?;

        Ok(())
    }

    /// Delete segments whose whole day lies before `before`
    async fn remove_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let cutoff = before.date_naive();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(HostplaneError::StateSaveError(format!(
                    "Failed to read sample directory: {}",
                    e
                )))
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let day = Self::segment_day(SERVER_SERIES, &name)
                .or_else(|| Self::segment_day(SITE_SERIES, &name));
            if matches!(day, Some(day) if day < cutoff) {
                tokio::fs::remove_file(entry.path()).await.map_err(|e| {
                    HostplaneError::StateSaveError(format!("Failed to remove {}: {}", name, e))
                })?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Shared store: entity tables persisted as one snapshot after every write,
/// samples appended to per-day logs
pub struct Store {
    tables: RwLock<Tables>,
    samples: RwLock<Samples>,
    file: Option<StateFile>,
    log: Option<SampleLog>,
}

impl Store {
    /// Store without a backing file
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            samples: RwLock::new(Samples::default()),
            file: None,
            log: None,
        }
    }

    /// Open (or create) a file-backed store. Samples live in `samples/` next to the state file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = StateFile::new(path);
        let state = file.load()?;

        let log_dir = file
            .path()
            .parent()
            .map(|p| p.join("samples"))
            .unwrap_or_else(|| PathBuf::from("samples"));
        let log = SampleLog::new(log_dir);
        let samples = Samples {
            server: log.load(SERVER_SERIES, |s: &ServerSample| s.timestamp)?,
            site: log.load(SITE_SERIES, |s: &SiteSample| s.timestamp)?,
        };

        tracing::info!(
            sites = state.sites.len(),
            services = state.services.len(),
            alerts = state.alerts.len(),
            samples = samples.server.len() + samples.site.len(),
            "Loaded state from {}",
            file.path().display()
        );

        Ok(Self {
            tables: RwLock::new(state.into_tables()),
            samples: RwLock::new(samples),
            file: Some(file),
            log: Some(log),
        })
    }

    /// Run a read-only query against the tables
    pub async fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let tables = self.tables.read().await;
        f(&tables)
    }

    /// Run a write transaction against a draft of the tables. The draft
    /// replaces the live tables only once the closure succeeded and the
    /// snapshot is on disk.
    pub async fn write<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut tables = self.tables.write().await;
        let mut draft = tables.clone();
        let result = f(&mut draft)?;
        self.persist(&draft).await?;
        *tables = draft;
        Ok(result)
    }

    async fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(ref file) = self.file else {
            return Ok(());
        };

        let state = PersistedState::from_tables(tables);
        let file = file.clone();
        tokio::task::spawn_blocking(move || file.save(&state))
            .await
            .map_err(|e| HostplaneError::StateSaveError(format!("State writer failed: {}", e)))?
    }

    /// Force the current tables to disk
    pub async fn flush(&self) -> Result<()> {
        let tables = self.tables.read().await;
        self.persist(&tables).await
    }

    pub async fn site(&self, id: SiteId) -> Result<Site> {
        self.read(|t| t.site(id).cloned()).await
    }

    pub async fn service(&self, id: ServiceId) -> Result<Service> {
        self.read(|t| t.service(id).cloned()).await
    }

    pub async fn alert(&self, id: AlertId) -> Result<Alert> {
        self.read(|t| {
            t.alerts
                .get(&id)
                .cloned()
                .ok_or_else(|| HostplaneError::AlertNotFound(id.to_string()))
        })
        .await
    }

    pub async fn find_site_by_name(&self, name: &str) -> Option<Site> {
        self.read(|t| {
            t.sites
                .values()
                .find(|s| s.name == name && s.status.holds_ports())
                .cloned()
        })
        .await
    }

    pub async fn sites(&self) -> Vec<Site> {
        self.read(|t| t.sites.values().cloned().collect()).await
    }

    pub async fn services(&self) -> Vec<Service> {
        self.read(|t| t.services.values().cloned().collect()).await
    }

    pub async fn services_for_site(&self, site_id: SiteId) -> Vec<Service> {
        self.read(|t| t.services_of(site_id).cloned().collect()).await
    }

    /// Alerts matching `filter`, newest first
    pub async fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.read(|t| {
            let mut alerts: Vec<Alert> = t
                .alerts
                .values()
                .filter(|a| filter.matches(a))
                .cloned()
                .collect();
            alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                alerts.truncate(limit);
            }
            alerts
        })
        .await
    }

    pub async fn append_server_sample(&self, sample: ServerSample) -> Result<()> {
        let mut samples = self.samples.write().await;
        if let Some(ref log) = self.log {
            log.append(SERVER_SERIES, sample.timestamp, &sample).await?;
        }
        insert_ordered(&mut samples.server, sample, |s| s.timestamp);
        Ok(())
    }

    pub async fn append_site_sample(&self, sample: SiteSample) -> Result<()> {
        let mut samples = self.samples.write().await;
        if let Some(ref log) = self.log {
            log.append(SITE_SERIES, sample.timestamp, &sample).await?;
        }
        insert_ordered(&mut samples.site, sample, |s| s.timestamp);
        Ok(())
    }

    /// Server samples at or after `since`, oldest first, keeping the newest `limit`
    pub async fn server_samples_since(
        &self,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Vec<ServerSample> {
        let samples = self.samples.read().await;
        window(&samples.server, since, limit, |s| s.timestamp, |_| true)
    }

    /// Site samples at or after `since`, oldest first, keeping the newest `limit`
    pub async fn site_samples_since(
        &self,
        site_id: SiteId,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Vec<SiteSample> {
        let samples = self.samples.read().await;
        window(
            &samples.site,
            since,
            limit,
            |s| s.timestamp,
            |s| s.site_id == site_id,
        )
    }

    /// Drop samples older than `before`; returns how many were removed
    pub async fn rotate_samples(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut samples = self.samples.write().await;
        if let Some(ref log) = self.log {
            let segments = log.remove_before(before).await?;
            if segments > 0 {
                tracing::debug!("Removed {} sample segments", segments);
            }
        }

        let total = samples.server.len() + samples.site.len();
        samples.server.retain(|s| s.timestamp >= before);
        samples.site.retain(|s| s.timestamp >= before);
        Ok(total - samples.server.len() - samples.site.len())
    }
}

fn insert_ordered<T>(samples: &mut Vec<T>, sample: T, key: impl Fn(&T) -> DateTime<Utc>) {
    let ts = key(&sample);
    let pos = samples.partition_point(|s| key(s) <= ts);
    samples.insert(pos, sample);
}

fn window<T: Clone>(
    samples: &[T],
    since: DateTime<Utc>,
    limit: Option<usize>,
    key: impl Fn(&T) -> DateTime<Utc>,
    keep: impl Fn(&T) -> bool,
) -> Vec<T> {
    let start = samples.partition_point(|s| key(s) < since);
    let mut matched: Vec<T> = samples[start..]
        .iter()
        .filter(|s| keep(s))
        .cloned()
        .collect();
    if let Some(limit) = limit {
        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityCounts, PortRange, ResourceLimits, SampleId, SiteStatus};
    use chrono::Duration;
    use tempfile::TempDir;

    fn create_test_site(name: &str, start: u16, end: u16) -> Site {
        Site {
            id: SiteId::new(),
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            status: SiteStatus::Active,
            owner: "alice".to_string(),
            port_range: PortRange::new(start, end),
            domains: vec![],
            environment: BTreeMap::new(),
            limits: ResourceLimits::default(),
            root: PathBuf::from("/srv/sites").join(name),
            account: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_at(timestamp: DateTime<Utc>) -> ServerSample {
        ServerSample {
            id: SampleId::new(),
            timestamp,
            cpu_percent: 10.0,
            load_average: [0.1, 0.1, 0.1],
            memory_total: 100,
            memory_used: 50,
            memory_percent: 50.0,
            disk_total: 100,
            disk_used: 10,
            disk_percent: 10.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            uptime_secs: 1,
            counts: EntityCounts::default(),
        }
    }

    #[test]
    fn test_validate_wrong_version() {
        let mut state = PersistedState::new();
        state.version = "0.0.0".to_string();
        assert!(matches!(
            state.validate(),
            Err(HostplaneError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_validate_overlapping_ranges() {
        let mut state = PersistedState::new();
        state.sites.push(create_test_site("a", 4000, 4010));
        state.sites.push(create_test_site("b", 4005, 4015));
        assert!(matches!(
            state.validate(),
            Err(HostplaneError::StateCorruption(_))
        ));

        // Deleted sites no longer hold their range
        state.sites[1].status = SiteStatus::Deleted;
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_state_file_load_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let file = StateFile::new(temp_dir.path().join("state.json"));
        let state = file.load().unwrap();
        assert!(state.sites.is_empty());
    }

    #[test]
    fn test_state_file_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.json");
        let file = StateFile::new(&path);
        file.save(&PersistedState::new()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_store_persists_writes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");

        let site = create_test_site("demo", 4001, 4011);
        let site_id = site.id;
        {
            let store = Store::open(&path).unwrap();
            store
                .write(|t| {
                    t.sites.insert(site.id, site);
                    Ok(())
                })
                .await
                .unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        let loaded = reopened.site(site_id).await.unwrap();
        assert_eq!(loaded.name, "demo");
        assert_eq!(
            reopened.find_site_by_name("demo").await.map(|s| s.id),
            Some(site_id)
        );
    }

    #[tokio::test]
    async fn test_failed_write_is_not_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        let store = Store::open(&path).unwrap();

        let result: Result<()> = store
            .write(|_| Err(HostplaneError::Validation("nope".to_string())))
            .await;
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_tables_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let store = Store::open(blocker.join("state.json")).unwrap();

        let site = create_test_site("demo", 4000, 4010);
        let result = store
            .write(|t| {
                t.sites.insert(site.id, site);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(HostplaneError::StateSaveError(_))));
        assert!(store.sites().await.is_empty());
        assert!(store.find_site_by_name("demo").await.is_none());
    }

    #[tokio::test]
    async fn test_samples_are_appended_to_day_logs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        let now = Utc::now();

        {
            let store = Store::open(&path).unwrap();
            store.append_server_sample(sample_at(now)).await.unwrap();
            store.append_server_sample(sample_at(now)).await.unwrap();
        }

        // Samples never go through the entity snapshot
        assert!(!path.exists());
        let segment = temp_dir
            .path()
            .join("samples")
            .join(format!("server-{}.jsonl", now.format("%Y-%m-%d")));
        let content = fs::read_to_string(&segment).unwrap();
        assert_eq!(content.lines().count(), 2);

        // A torn trailing line is skipped on load
        let mut file = fs::OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(b"{\"id\":").unwrap();

        let reopened = Store::open(&path).unwrap();
        let samples = reopened
            .server_samples_since(now - Duration::hours(1), None)
            .await;
        assert_eq!(samples.len(), 2);
    }

    #[tokio::test]
    async fn test_rotation_removes_old_segments() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        let now = Utc::now();
        let old = now - Duration::days(10);

        let store = Store::open(&path).unwrap();
        store.append_server_sample(sample_at(old)).await.unwrap();
        store.append_server_sample(sample_at(now)).await.unwrap();

        let samples_dir = temp_dir.path().join("samples");
        let old_segment = samples_dir.join(format!("server-{}.jsonl", old.format("%Y-%m-%d")));
        assert!(old_segment.exists());

        let removed = store.rotate_samples(now - Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old_segment.exists());

        let reopened = Store::open(&path).unwrap();
        let samples = reopened
            .server_samples_since(now - Duration::days(30), None)
            .await;
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn test_history_window_is_oldest_first_and_bounded() {
        let store = Store::in_memory();
        let now = Utc::now();

        // Appended out of order on purpose
        for minutes in [30, 90, 10, 200, 50] {
            store
                .append_server_sample(sample_at(now - Duration::minutes(minutes)))
                .await
                .unwrap();
        }

        let since = now - Duration::hours(1);
        let samples = store.server_samples_since(since, None).await;
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.timestamp >= since));
        assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let limited = store.server_samples_since(since, Some(2)).await;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].timestamp, now - Duration::minutes(10));
        assert_eq!(limited[0].timestamp, now - Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_rotate_samples() {
        let store = Store::in_memory();
        let now = Utc::now();
        store
            .append_server_sample(sample_at(now - Duration::days(10)))
            .await
            .unwrap();
        store.append_server_sample(sample_at(now)).await.unwrap();

        let removed = store.rotate_samples(now - Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store
                .server_samples_since(now - Duration::days(30), None)
                .await
                .len(),
            1
        );
        assert_eq!(store.rotate_samples(now - Duration::days(7)).await.unwrap(), 0);
    }
}
