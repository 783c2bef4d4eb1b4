// Integration test for platform configuration files

use hostplane::config::{DedupPolicy, PlatformConfig};
use hostplane::error::HostplaneError;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_load_full_toml_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");

    let toml_content = r#"
        log_level = "hostplane=debug"

        [paths]
        state_file = "/srv/hostplane/state.json"
        sites_root = "/srv/sites"
        units_dir = "/srv/hostplane/units"
        socket_path = "/run/hostplane.sock"

        [ports]
        pool_start = 20000
        pool_end = 30000
        default_range_width = 20
        max_range_width = 100

        [limits]
        min_memory_mb = 64
        max_memory_mb = 4096
        max_cpu_percent = 200
        max_processes = 128

        [supervisor]
        start_timeout_secs = 5
        stop_timeout_secs = 20
        stop_signal = "SIGINT"
        confirm_poll_ms = 50

        [commands]
        install_timeout_secs = 120
        custom_timeout_secs = 60
        max_custom_timeout_secs = 600

        [monitoring]
        interval_secs = 10
        site_stats_enabled = false
        server_cache_ttl_ms = 1000
        alert_dedup_window_secs = 60
        dedup_policy = "count"
        retention_hours = 24

        [monitoring.thresholds.disk]
        warning = 70.0
        critical = 90.0

        [provisioning]
        create_accounts = true
        account_prefix = "web-"
        database_cleanup_command = "/usr/local/bin/drop-site-dbs"
    "#;

    fs::write(&config_path, toml_content).unwrap();

    let config = PlatformConfig::from_file(&config_path).unwrap();
    assert_eq!(config.log_level, "hostplane=debug");
    assert_eq!(config.paths.sites_root, PathBuf::from("/srv/sites"));
    assert_eq!(config.paths.socket_path, PathBuf::from("/run/hostplane.sock"));
    assert_eq!(config.ports.pool_start, 20000);
    assert_eq!(config.ports.default_range_width, 20);
    assert_eq!(config.limits.max_cpu_percent, 200);
    assert_eq!(config.supervisor.stop_signal, "SIGINT");
    assert_eq!(config.supervisor.exit_sweep_ms, 1000);
    assert_eq!(config.commands.install_timeout_secs, 120);
    assert_eq!(config.commands.build_timeout_secs, 900);
    assert!(!config.monitoring.site_stats_enabled);
    assert_eq!(config.monitoring.dedup_policy, DedupPolicy::Count);
    assert_eq!(config.monitoring.site_cache_ttl_ms, 10_000);
    assert_eq!(config.monitoring.thresholds.disk.warning, 70.0);
    assert_eq!(config.monitoring.thresholds.cpu.critical, 95.0);
    assert!(config.provisioning.create_accounts);
    assert_eq!(config.provisioning.account_prefix, "web-");
}

#[test]
fn test_load_json_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.json");

    let json_content = r#"
        {
            "ports": { "pool_start": 9000, "pool_end": 9500 },
            "monitoring": {
                "interval_secs": 60,
                "thresholds": {
                    "cpu": { "warning": 60.0, "critical": 80.0 }
                }
            }
        }
    "#;

    fs::write(&config_path, json_content).unwrap();

    let config = PlatformConfig::from_file(&config_path).unwrap();
    assert_eq!(config.ports.pool_start, 9000);
    assert_eq!(config.ports.pool_end, 9500);
    assert_eq!(config.ports.default_range_width, 10);
    assert_eq!(config.monitoring.interval_secs, 60);
    assert_eq!(config.monitoring.thresholds.cpu.warning, 60.0);
    assert_eq!(config.monitoring.thresholds.memory.warning, 85.0);
}

#[test]
fn test_empty_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");
    fs::write(&config_path, "").unwrap();

    let config = PlatformConfig::from_file(&config_path).unwrap();
    assert_eq!(config.log_level, "info");
    assert_eq!(config.ports.pool_start, 4000);
    assert_eq!(config.ports.pool_end, 60000);
    assert_eq!(config.supervisor.start_timeout_secs, 10);
    assert_eq!(config.monitoring.interval_secs, 30);
    assert_eq!(config.monitoring.retention_hours, 168);
    assert_eq!(config.monitoring.dedup_policy, DedupPolicy::Absorb);
    assert!(!config.provisioning.create_accounts);
}

#[test]
fn test_config_validation_inverted_thresholds() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");

    let toml_content = r#"
        [monitoring.thresholds.memory]
        warning = 95.0
        critical = 90.0
    "#;
    fs::write(&config_path, toml_content).unwrap();

    let result = PlatformConfig::from_file(&config_path);
    assert!(matches!(
        result,
        Err(HostplaneError::ConfigValidationError(_))
    ));
}

#[test]
fn test_config_validation_zero_interval() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");
    fs::write(&config_path, "[monitoring]\ninterval_secs = 0\n").unwrap();

    assert!(PlatformConfig::from_file(&config_path).is_err());
}

#[test]
fn test_config_validation_invalid_signal() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");
    fs::write(&config_path, "[supervisor]\nstop_signal = \"SIGUSR1\"\n").unwrap();

    let result = PlatformConfig::from_file(&config_path);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("stop_signal"));
}

#[test]
fn test_config_validation_port_pool() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");
    fs::write(&config_path, "[ports]\npool_start = 8000\npool_end = 8000\n").unwrap();

    assert!(PlatformConfig::from_file(&config_path).is_err());
}

#[test]
fn test_malformed_toml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");
    fs::write(&config_path, "[ports\npool_start = 1").unwrap();

    let result = PlatformConfig::from_file(&config_path);
    assert!(matches!(result, Err(HostplaneError::InvalidConfig(_))));
}

#[test]
fn test_missing_file() {
    let result = PlatformConfig::from_file(&PathBuf::from("/nonexistent/hostplane.toml"));
    assert!(matches!(result, Err(HostplaneError::ConfigError(_))));
}

#[test]
fn test_unsupported_file_format() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.yaml");
    fs::write(&config_path, "log_level: info").unwrap();

    let result = PlatformConfig::from_file(&config_path);
    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Unsupported file format"));
}

#[test]
fn test_env_var_expansion() {
    std::env::set_var("HOSTPLANE_IT_DATA", "/data/hp");

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("hostplane.toml");

    let toml_content = r#"
        [paths]
        state_file = "${HOSTPLANE_IT_DATA}/state.json"
        sites_root = "$HOSTPLANE_IT_DATA/sites"
    "#;
    fs::write(&config_path, toml_content).unwrap();

    let config = PlatformConfig::from_file(&config_path).unwrap();
    assert_eq!(config.paths.state_file, PathBuf::from("/data/hp/state.json"));
    assert_eq!(config.paths.sites_root, PathBuf::from("/data/hp/sites"));
}
