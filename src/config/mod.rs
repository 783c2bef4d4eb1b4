use crate::error::{HostplaneError, Result};
use crate::model::AlertSeverity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub ports: PortPoolConfig,

    #[serde(default)]
    pub limits: LimitPolicy,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub commands: CommandConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Persisted entities and samples
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Parent directory of every site root
    #[serde(default = "default_sites_root")]
    pub sites_root: PathBuf,

    /// Unit descriptors and service output logs
    #[serde(default = "default_units_dir")]
    pub units_dir: PathBuf,

    /// Control socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

/// Global port pool `[pool_start, pool_end)` carved into per-site ranges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPoolConfig {
    #[serde(default = "default_pool_start")]
    pub pool_start: u16,

    #[serde(default = "default_pool_end")]
    pub pool_end: u16,

    /// Ports reserved per site unless the request says otherwise
    #[serde(default = "default_range_width")]
    pub default_range_width: u16,

    #[serde(default = "default_max_range_width")]
    pub max_range_width: u16,
}

/// Bounds accepted for resource limit requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitPolicy {
    #[serde(default = "default_min_memory_mb")]
    pub min_memory_mb: u64,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: u32,

    #[serde(default = "default_max_processes")]
    pub max_processes: u32,
}

/// Supervisor interaction bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a start may take to be confirmed
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Grace period between the stop signal and SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Signal sent on graceful stop
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Poll interval while waiting for confirmation
    #[serde(default = "default_confirm_poll")]
    pub confirm_poll_ms: u64,

    /// How often the daemon sweeps for crashed units
    #[serde(default = "default_exit_sweep")]
    pub exit_sweep_ms: u64,
}

/// Install, build and custom command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    #[serde(default = "default_custom_timeout")]
    pub custom_timeout_secs: u64,

    #[serde(default = "default_max_custom_timeout")]
    pub max_custom_timeout_secs: u64,

    /// Captured output beyond this is truncated from the front
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Warning/critical levels for one metric, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    /// Severity reached by `value`, if any
    pub fn classify(&self, value: f64) -> Option<(AlertSeverity, f64)> {
        if value >= self.critical {
            Some((AlertSeverity::Critical, self.critical))
        } else if value >= self.warning {
            Some((AlertSeverity::Warning, self.warning))
        } else {
            None
        }
    }

    fn validate(&self, metric: &str) -> Result<()> {
        let in_bounds = |v: f64| (0.0..=100.0).contains(&v);
        if !in_bounds(self.warning) || !in_bounds(self.critical) {
            return Err(HostplaneError::ConfigValidationError(format!(
                "{} thresholds must be between 0 and 100",
                metric
            )));
        }
        if self.warning >= self.critical {
            return Err(HostplaneError::ConfigValidationError(format!(
                "{} warning threshold must be below critical",
                metric
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_cpu_threshold")]
    pub cpu: Threshold,

    #[serde(default = "default_memory_threshold")]
    pub memory: Threshold,

    #[serde(default = "default_disk_threshold")]
    pub disk: Threshold,
}

/// How a repeated trigger affects the open alert that absorbs it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Leave the open alert untouched
    #[default]
    Absorb,
    /// Count occurrences only
    Count,
    /// Count occurrences and slide the dedup window to the latest trigger
    Extend,
}

/// Runtime-mutable collection and alerting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_true")]
    pub site_stats_enabled: bool,

    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default = "default_server_cache_ttl")]
    pub server_cache_ttl_ms: u64,

    #[serde(default = "default_site_cache_ttl")]
    pub site_cache_ttl_ms: u64,

    #[serde(default = "default_dedup_window")]
    pub alert_dedup_window_secs: u64,

    #[serde(default)]
    pub dedup_policy: DedupPolicy,

    /// Samples older than this are rotated out
    #[serde(default = "default_retention")]
    pub retention_hours: u64,
}

/// Site root and OS account provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Create a dedicated system account per site
    #[serde(default)]
    pub create_accounts: bool,

    #[serde(default = "default_account_prefix")]
    pub account_prefix: String,

    /// Hook run on site delete to drop tenant databases; SITE_NAME is exported
    #[serde(default)]
    pub database_cleanup_command: Option<String>,
}

// Default value functions for serde
fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/hostplane/state.json")
}

fn default_sites_root() -> PathBuf {
    PathBuf::from("/srv/sites")
}

fn default_units_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostplane/units")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/hostplane.sock")
}

fn default_pool_start() -> u16 {
    4000
}

fn default_pool_end() -> u16 {
    60000
}

fn default_range_width() -> u16 {
    10
}

fn default_max_range_width() -> u16 {
    1000
}

fn default_min_memory_mb() -> u64 {
    32
}

fn default_max_memory_mb() -> u64 {
    16 * 1024
}

fn default_max_cpu_percent() -> u32 {
    400
}

fn default_max_processes() -> u32 {
    512
}

fn default_start_timeout() -> u64 {
    10
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_confirm_poll() -> u64 {
    100
}

fn default_exit_sweep() -> u64 {
    1000
}

fn default_install_timeout() -> u64 {
    600
}

fn default_build_timeout() -> u64 {
    900
}

fn default_custom_timeout() -> u64 {
    300
}

fn default_max_custom_timeout() -> u64 {
    3600
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_cpu_threshold() -> Threshold {
    Threshold::new(80.0, 95.0)
}

fn default_memory_threshold() -> Threshold {
    Threshold::new(85.0, 95.0)
}

fn default_disk_threshold() -> Threshold {
    Threshold::new(85.0, 95.0)
}

fn default_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_server_cache_ttl() -> u64 {
    5_000
}

fn default_site_cache_ttl() -> u64 {
    10_000
}

fn default_dedup_window() -> u64 {
    300
}

fn default_retention() -> u64 {
    24 * 7
}

fn default_account_prefix() -> String {
    "site-".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            ports: PortPoolConfig::default(),
            limits: LimitPolicy::default(),
            supervisor: SupervisorConfig::default(),
            commands: CommandConfig::default(),
            monitoring: MonitoringConfig::default(),
            provisioning: ProvisioningConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            sites_root: default_sites_root(),
            units_dir: default_units_dir(),
            socket_path: default_socket_path(),
        }
    }
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            pool_start: default_pool_start(),
            pool_end: default_pool_end(),
            default_range_width: default_range_width(),
            max_range_width: default_max_range_width(),
        }
    }
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            min_memory_mb: default_min_memory_mb(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_processes: default_max_processes(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            stop_signal: default_stop_signal(),
            confirm_poll_ms: default_confirm_poll(),
            exit_sweep_ms: default_exit_sweep(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            install_timeout_secs: default_install_timeout(),
            build_timeout_secs: default_build_timeout(),
            custom_timeout_secs: default_custom_timeout(),
            max_custom_timeout_secs: default_max_custom_timeout(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: default_cpu_threshold(),
            memory: default_memory_threshold(),
            disk: default_disk_threshold(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            site_stats_enabled: true,
            thresholds: Thresholds::default(),
            server_cache_ttl_ms: default_server_cache_ttl(),
            site_cache_ttl_ms: default_site_cache_ttl(),
            alert_dedup_window_secs: default_dedup_window(),
            dedup_policy: DedupPolicy::default(),
            retention_hours: default_retention(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            create_accounts: false,
            account_prefix: default_account_prefix(),
            database_cleanup_command: None,
        }
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn server_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.server_cache_ttl_ms)
    }

    pub fn site_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.site_cache_ttl_ms)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.alert_dedup_window_secs as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(HostplaneError::ConfigValidationError(
                "monitoring interval must be at least 1 second".to_string(),
            ));
        }
        if self.retention_hours == 0 {
            return Err(HostplaneError::ConfigValidationError(
                "retention_hours must be at least 1".to_string(),
            ));
        }
        self.thresholds.cpu.validate("cpu")?;
        self.thresholds.memory.validate("memory")?;
        self.thresholds.disk.validate("disk")?;
        Ok(())
    }
}

impl SupervisorConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_ms.max(1))
    }
}

impl PlatformConfig {
    /// Load configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<PlatformConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HostplaneError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config: PlatformConfig = match extension {
            "toml" => toml::from_str(&contents).map_err(|e| {
                HostplaneError::InvalidConfig(format!("Failed to parse TOML: {}", e))
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| {
                HostplaneError::InvalidConfig(format!("Failed to parse JSON: {}", e))
            })?,
            _ => {
                return Err(HostplaneError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let ports = &self.ports;
        if ports.pool_start == 0 || ports.pool_start >= ports.pool_end {
            return Err(HostplaneError::ConfigValidationError(format!(
                "Invalid port pool {}-{}",
                ports.pool_start, ports.pool_end
            )));
        }
        if ports.default_range_width == 0 || ports.default_range_width > ports.max_range_width {
            return Err(HostplaneError::ConfigValidationError(
                "default_range_width must be between 1 and max_range_width".to_string(),
            ));
        }

        if self.limits.min_memory_mb > self.limits.max_memory_mb {
            return Err(HostplaneError::ConfigValidationError(
                "min_memory_mb cannot exceed max_memory_mb".to_string(),
            ));
        }

        let valid_signals = ["SIGTERM", "SIGINT", "SIGQUIT", "SIGHUP"];
        if !valid_signals.contains(&self.supervisor.stop_signal.as_str()) {
            return Err(HostplaneError::ConfigValidationError(format!(
                "Invalid stop_signal: {}. Must be one of: {}",
                self.supervisor.stop_signal,
                valid_signals.join(", ")
            )));
        }

        if self.commands.custom_timeout_secs > self.commands.max_custom_timeout_secs {
            return Err(HostplaneError::ConfigValidationError(
                "custom_timeout_secs cannot exceed max_custom_timeout_secs".to_string(),
            ));
        }

        self.monitoring.validate()
    }

    /// Expand environment variables in path fields
    fn expand_env_vars(&mut self) {
        self.paths.state_file = expand_env_in_path(&self.paths.state_file);
        self.paths.sites_root = expand_env_in_path(&self.paths.sites_root);
        self.paths.units_dir = expand_env_in_path(&self.paths.units_dir);
        self.paths.socket_path = expand_env_in_path(&self.paths.socket_path);
    }
}

/// Expand `$VAR` and `${VAR}` in a string
fn expand_env_in_string(s: &str) -> String {
    let mut result = s.to_string();
    for (key, value) in std::env::vars() {
        result = result.replace(&format!("${{{}}}", key), &value);
        result = result.replace(&format!("${}", key), &value);
    }
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PlatformConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitoring.interval_secs, 30);
        assert_eq!(config.monitoring.server_cache_ttl_ms, 5_000);
        assert_eq!(config.monitoring.site_cache_ttl_ms, 10_000);
        assert_eq!(config.monitoring.alert_dedup_window_secs, 300);
        assert_eq!(config.monitoring.dedup_policy, DedupPolicy::Absorb);
    }

    #[test]
    fn test_threshold_classify() {
        let t = Threshold::new(80.0, 95.0);
        assert_eq!(t.classify(50.0), None);
        assert_eq!(t.classify(80.0), Some((AlertSeverity::Warning, 80.0)));
        assert_eq!(t.classify(99.0), Some((AlertSeverity::Critical, 95.0)));
    }

    #[test]
    fn test_validate_inverted_thresholds() {
        let mut config = PlatformConfig::default();
        config.monitoring.thresholds.cpu = Threshold::new(95.0, 80.0);
        assert!(matches!(
            config.validate(),
            Err(HostplaneError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_validate_bad_port_pool() {
        let mut config = PlatformConfig::default();
        config.ports.pool_start = 5000;
        config.ports.pool_end = 4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_signal() {
        let mut config = PlatformConfig::default();
        config.supervisor.stop_signal = "SIGFOO".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("HOSTPLANE_TEST_ROOT", "/tmp/hp");

        let mut config = PlatformConfig::default();
        config.paths.sites_root = PathBuf::from("${HOSTPLANE_TEST_ROOT}/sites");
        config.paths.state_file = PathBuf::from("$HOSTPLANE_TEST_ROOT/state.json");
        config.expand_env_vars();

        assert_eq!(config.paths.sites_root, PathBuf::from("/tmp/hp/sites"));
        assert_eq!(config.paths.state_file, PathBuf::from("/tmp/hp/state.json"));
    }

    #[test]
    fn test_from_file_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hostplane.toml");

        let contents = r#"
            log_level = "debug"

            [ports]
            pool_start = 4001
            pool_end = 4101
            default_range_width = 10

            [monitoring]
            interval_secs = 15
            dedup_policy = "extend"

            [monitoring.thresholds.cpu]
            warning = 70.0
            critical = 90.0
        "#;
        fs::write(&path, contents).unwrap();

        let config = PlatformConfig::from_file(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.ports.pool_start, 4001);
        assert_eq!(config.monitoring.interval_secs, 15);
        assert_eq!(config.monitoring.dedup_policy, DedupPolicy::Extend);
        assert_eq!(config.monitoring.thresholds.cpu.critical, 90.0);
        assert_eq!(config.monitoring.thresholds.memory.critical, 95.0);
    }

    #[test]
    fn test_from_file_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hostplane.json");
        fs::write(&path, r#"{ "monitoring": { "site_stats_enabled": false } }"#).unwrap();

        let config = PlatformConfig::from_file(&path).unwrap();
        assert!(!config.monitoring.site_stats_enabled);
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hostplane.yaml");
        fs::write(&path, "log_level: info").unwrap();

        let result = PlatformConfig::from_file(&path);
        assert!(matches!(result, Err(HostplaneError::InvalidConfig(_))));
    }
}
