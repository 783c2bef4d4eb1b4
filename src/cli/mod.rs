// CLI module - User-facing command-line interface

mod output;

use crate::error::{HostplaneError, Result};
use crate::ipc::{Command, IpcClient};
use crate::model::{
    AlertFilter, AlertId, AlertSeverity, AlertStatus, AlertType, CallerRole, CustomCommand,
    NewService, NewSite, ResourceLimits, ServiceKind, ServiceUpdate, SiteUpdate,
};
use crate::stats::MonitoringUpdate;
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use output::View;

/// hostplane - control plane for multi-tenant site hosting
#[derive(Parser)]
#[command(name = "hostplane")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Daemon socket
    #[arg(long, global = true, env = "HOSTPLANE_SOCKET", default_value = "/tmp/hostplane.sock")]
    socket: PathBuf,

    /// Print raw JSON envelopes
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage sites
    Site {
        #[command(subcommand)]
        command: SiteCommands,
    },
    /// Manage services
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
    /// Resource usage
    Stats {
        #[command(subcommand)]
        command: StatsCommands,
    },
    /// Threshold alerts
    Alert {
        #[command(subcommand)]
        command: AlertCommands,
    },
    /// Runtime monitoring configuration
    Monitoring {
        #[command(subcommand)]
        command: MonitoringCommands,
    },
    /// Check that the daemon answers
    Ping,
}

#[derive(Args, Default)]
struct LimitArgs {
    /// Memory ceiling in MB
    #[arg(long)]
    memory_mb: Option<u64>,
    /// CPU ceiling in percent of one core
    #[arg(long)]
    cpu_percent: Option<u32>,
    /// Process count ceiling
    #[arg(long)]
    max_processes: Option<u32>,
}

impl LimitArgs {
    fn into_limits(self) -> Option<ResourceLimits> {
        let limits = ResourceLimits {
            memory_mb: self.memory_mb,
            cpu_percent: self.cpu_percent,
            max_processes: self.max_processes,
        };
        (!limits.is_empty()).then_some(limits)
    }
}

#[derive(Subcommand)]
enum SiteCommands {
    /// Create a site
    Create {
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Number of ports to reserve
        #[arg(long)]
        ports: Option<u16>,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Show one site
    Get { site: String },
    /// List sites
    List {
        #[arg(long)]
        all: bool,
    },
    /// Edit display name or description
    Update {
        site: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a site and everything it owns
    Delete {
        site: String,
        /// Continue past nested failures
        #[arg(short, long)]
        force: bool,
    },
    /// Start every service of a site
    Start { site: String },
    /// Stop every service of a site
    Stop { site: String },
    /// Restart every service of a site
    Restart { site: String },
    /// Attach a domain
    AddDomain { site: String, domain: String },
    /// Detach a domain
    RemoveDomain { site: String, domain: String },
    /// Replace the site environment (KEY=VALUE)
    SetEnv { site: String, vars: Vec<String> },
}

#[derive(Subcommand)]
enum ServiceCommands {
    /// Create a service in a site
    Create {
        site: String,
        name: String,
        /// Command that runs the service
        #[arg(long)]
        start: String,
        #[arg(long)]
        install: Option<String>,
        #[arg(long)]
        build: Option<String>,
        #[arg(long, value_parser = parse_enum::<ServiceKind>, default_value = "generic")]
        kind: ServiceKind,
        /// Explicit port inside the site range
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        display_name: Option<String>,
        /// KEY=VALUE
        #[arg(short, long)]
        env: Vec<String>,
        #[arg(long)]
        auto_start: bool,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Show one service (id or site/service)
    Get { service: String },
    /// List services, optionally of one site
    List { site: Option<String> },
    /// Edit a service definition
    Update {
        service: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        install: Option<String>,
        #[arg(long)]
        build: Option<String>,
        #[arg(long)]
        auto_start: Option<bool>,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Delete a service
    Delete {
        service: String,
        /// Kill without grace period
        #[arg(short, long)]
        force: bool,
    },
    Start { service: String },
    Stop { service: String },
    Restart { service: String },
    /// Persisted status
    Status { service: String },
    /// Live supervisor state and drift
    Health { service: String },
    /// Run the install command
    Install { service: String },
    /// Run the build command
    Build { service: String },
    /// Replace the service environment (KEY=VALUE)
    SetEnv { service: String, vars: Vec<String> },
    /// Custom commands
    Cmd {
        #[command(subcommand)]
        command: CustomCommands,
    },
}

#[derive(Subcommand)]
enum CustomCommands {
    List {
        service: String,
    },
    Add {
        service: String,
        name: String,
        /// Shell command
        command: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        requires_stop: bool,
        #[arg(long)]
        dangerous: bool,
    },
    Remove {
        service: String,
        name: String,
    },
    Run {
        service: String,
        name: String,
        #[arg(long, value_parser = parse_enum::<CallerRole>, default_value = "owner")]
        role: CallerRole,
    },
}

#[derive(Subcommand)]
enum StatsCommands {
    /// Current host usage
    Server,
    /// Host usage history
    ServerHistory {
        #[arg(long, default_value = "1")]
        hours: u32,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Current site usage
    Site { site: String },
    /// Site usage history
    SiteHistory {
        site: String,
        #[arg(long, default_value = "1")]
        hours: u32,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Live usage of each service in a site
    Services { site: String },
    /// Collector counters
    Collector,
}

#[derive(Subcommand)]
enum AlertCommands {
    List {
        #[arg(long, value_parser = parse_enum::<AlertStatus>)]
        status: Option<AlertStatus>,
        #[arg(long, value_parser = parse_enum::<AlertSeverity>)]
        severity: Option<AlertSeverity>,
        #[arg(long = "type", value_parser = parse_enum::<AlertType>)]
        alert_type: Option<AlertType>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Ack {
        id: String,
        #[arg(long)]
        by: Option<String>,
    },
    Resolve {
        id: String,
    },
}

#[derive(Subcommand)]
enum MonitoringCommands {
    Get,
    Set {
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        site_stats: Option<bool>,
        #[arg(long)]
        dedup_window: Option<u64>,
        #[arg(long)]
        retention_hours: Option<u64>,
    },
}

impl Cli {
    /// Parse arguments, send the command and render the answer.
    /// Returns whether the daemon reported success.
    pub fn run() -> Result<bool> {
        let cli = Cli::parse();
        cli.execute()
    }

    fn execute(self) -> Result<bool> {
        let json = self.json;
        let client = IpcClient::new(&self.socket);
        let (command, view) = build_command(self.command)?;
        let envelope = client.send(command)?;

        if json {
            output::print_json(&envelope);
        } else {
            output::render(&envelope, view);
        }
        Ok(envelope.success)
    }
}

/// Map CLI arguments onto a protocol command and how to render its answer
fn build_command(command: Commands) -> Result<(Command, View)> {
    let built = match command {
        Commands::Site { command } => match command {
            SiteCommands::Create {
                name,
                owner,
                display_name,
                description,
                ports,
                limits,
            } => (
                Command::CreateSite(NewSite {
                    name,
                    display_name,
                    description,
                    owner,
                    limits: limits.into_limits(),
                    port_count: ports,
                }),
                View::Site,
            ),
            SiteCommands::Get { site } => (Command::GetSite { site }, View::Site),
            SiteCommands::List { all } => (
                Command::ListSites {
                    include_deleted: all,
                },
                View::Sites,
            ),
            SiteCommands::Update {
                site,
                display_name,
                description,
            } => (
                Command::UpdateSite {
                    site,
                    update: SiteUpdate {
                        display_name,
                        description,
                    },
                },
                View::Site,
            ),
            SiteCommands::Delete { site, force } => (Command::DeleteSite { site, force }, View::Site),
            SiteCommands::Start { site } => (Command::StartSite { site }, View::FanOut),
            SiteCommands::Stop { site } => (Command::StopSite { site }, View::FanOut),
            SiteCommands::Restart { site } => (Command::RestartSite { site }, View::FanOut),
            SiteCommands::AddDomain { site, domain } => {
                (Command::AddDomain { site, domain }, View::Site)
            }
            SiteCommands::RemoveDomain { site, domain } => {
                (Command::RemoveDomain { site, domain }, View::Site)
            }
            SiteCommands::SetEnv { site, vars } => (
                Command::SetSiteEnvironment {
                    site,
                    environment: parse_env_vars(&vars)?,
                },
                View::Site,
            ),
        },

        Commands::Service { command } => match command {
            ServiceCommands::Create {
                site,
                name,
                start,
                install,
                build,
                kind,
                port,
                display_name,
                env,
                auto_start,
                limits,
            } => {
                let mut service = NewService::new(name, start);
                service.install_command = install;
                service.build_command = build;
                service.kind = kind;
                service.port = port;
                service.display_name = display_name;
                service.environment = parse_env_vars(&env)?;
                service.auto_start = auto_start;
                service.limits = limits.into_limits().unwrap_or_default();
                (Command::CreateService { site, service }, View::Service)
            }
            ServiceCommands::Get { service } => (Command::GetService { service }, View::Service),
            ServiceCommands::List { site } => (Command::ListServices { site }, View::Services),
            ServiceCommands::Update {
                service,
                display_name,
                start,
                install,
                build,
                auto_start,
                limits,
            } => (
                Command::UpdateService {
                    service,
                    update: ServiceUpdate {
                        display_name,
                        start_command: start,
                        install_command: install,
                        build_command: build,
                        limits: limits.into_limits(),
                        auto_start,
                    },
                },
                View::Service,
            ),
            ServiceCommands::Delete { service, force } => {
                (Command::DeleteService { service, force }, View::Message)
            }
            ServiceCommands::Start { service } => (Command::StartService { service }, View::Service),
            ServiceCommands::Stop { service } => (Command::StopService { service }, View::Service),
            ServiceCommands::Restart { service } => {
                (Command::RestartService { service }, View::Service)
            }
            ServiceCommands::Status { service } => (Command::ServiceStatus { service }, View::Json),
            ServiceCommands::Health { service } => (Command::ServiceHealth { service }, View::Health),
            ServiceCommands::Install { service } => {
                (Command::InstallService { service }, View::Outcome)
            }
            ServiceCommands::Build { service } => (Command::BuildService { service }, View::Outcome),
            ServiceCommands::SetEnv { service, vars } => (
                Command::SetServiceEnvironment {
                    service,
                    environment: parse_env_vars(&vars)?,
                },
                View::Service,
            ),
            ServiceCommands::Cmd { command } => match command {
                CustomCommands::List { service } => {
                    (Command::ListCommands { service }, View::CustomCommands)
                }
                CustomCommands::Add {
                    service,
                    name,
                    command,
                    description,
                    timeout,
                    requires_stop,
                    dangerous,
                } => (
                    Command::AddCommand {
                        service,
                        command: CustomCommand {
                            name,
                            command,
                            description,
                            timeout_secs: timeout,
                            requires_stop,
                            dangerous,
                        },
                    },
                    View::Service,
                ),
                CustomCommands::Remove { service, name } => {
                    (Command::RemoveCommand { service, name }, View::Service)
                }
                CustomCommands::Run {
                    service,
                    name,
                    role,
                } => (
                    Command::ExecuteCommand {
                        service,
                        name,
                        role,
                    },
                    View::Outcome,
                ),
            },
        },

        Commands::Stats { command } => match command {
            StatsCommands::Server => (Command::ServerStats, View::ServerSample),
            StatsCommands::ServerHistory { hours, limit } => {
                (Command::ServerHistory { hours, limit }, View::ServerHistory)
            }
            StatsCommands::Site { site } => (Command::SiteStats { site }, View::SiteSample),
            StatsCommands::SiteHistory { site, hours, limit } => {
                (Command::SiteHistory { site, hours, limit }, View::SiteHistory)
            }
            StatsCommands::Services { site } => {
                (Command::SiteServicesStats { site }, View::ServiceUsage)
            }
            StatsCommands::Collector => (Command::CollectorMetrics, View::Json),
        },

        Commands::Alert { command } => match command {
            AlertCommands::List {
                status,
                severity,
                alert_type,
                limit,
            } => (
                Command::ListAlerts {
                    filter: AlertFilter {
                        status,
                        severity,
                        alert_type,
                        site_id: None,
                        limit,
                    },
                },
                View::Alerts,
            ),
            AlertCommands::Ack { id, by } => (
                Command::AcknowledgeAlert {
                    alert_id: parse_alert_id(&id)?,
                    by,
                },
                View::Alert,
            ),
            AlertCommands::Resolve { id } => (
                Command::ResolveAlert {
                    alert_id: parse_alert_id(&id)?,
                },
                View::Alert,
            ),
        },

        Commands::Monitoring { command } => match command {
            MonitoringCommands::Get => (Command::GetMonitoringConfig, View::Json),
            MonitoringCommands::Set {
                interval,
                site_stats,
                dedup_window,
                retention_hours,
            } => (
                Command::UpdateMonitoringConfig(MonitoringUpdate {
                    interval_secs: interval,
                    site_stats_enabled: site_stats,
                    alert_dedup_window_secs: dedup_window,
                    retention_hours,
                    ..Default::default()
                }),
                View::Json,
            ),
        },

        Commands::Ping => (Command::Ping, View::Message),
    };
    Ok(built)
}

fn parse_alert_id(value: &str) -> Result<AlertId> {
    AlertId::parse(value)
        .ok_or_else(|| HostplaneError::Validation(format!("Invalid alert id '{}'", value)))
}

/// Parse a snake_case enum value the way it appears on the wire
fn parse_enum<T: DeserializeOwned>(value: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown value '{}'", value))
}

/// Parse environment variables from KEY=VALUE format
fn parse_env_vars(env_vars: &[String]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();

    for env_str in env_vars {
        if let Some((key, value)) = env_str.split_once('=') {
            map.insert(key.to_string(), value.to_string());
        } else {
            return Err(HostplaneError::Validation(format!(
                "Invalid environment variable format: '{}'. Expected KEY=VALUE",
                env_str
            )));
        }
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_vars() {
        let env_vars = vec!["NODE_ENV=production".to_string(), "API_URL=http://x?a=b".to_string()];
        let result = parse_env_vars(&env_vars).unwrap();
        assert_eq!(result.get("NODE_ENV"), Some(&"production".to_string()));
        assert_eq!(result.get("API_URL"), Some(&"http://x?a=b".to_string()));
    }

    #[test]
    fn test_parse_env_vars_invalid() {
        assert!(parse_env_vars(&["INVALID".to_string()]).is_err());
    }

    #[test]
    fn test_parse_enum() {
        assert_eq!(parse_enum::<ServiceKind>("node").unwrap(), ServiceKind::Node);
        assert_eq!(parse_enum::<AlertStatus>("acknowledged").unwrap(), AlertStatus::Acknowledged);
        assert!(parse_enum::<CallerRole>("root").is_err());
    }

    #[test]
    fn test_site_create_command() {
        let cli = Cli::try_parse_from([
            "hostplane", "site", "create", "demo", "--owner", "alice", "--ports", "10",
            "--memory-mb", "512",
        ])
        .unwrap();
        let (command, view) = build_command(cli.command).unwrap();
        assert_eq!(view, View::Site);
        match command {
            Command::CreateSite(def) => {
                assert_eq!(def.name, "demo");
                assert_eq!(def.port_count, Some(10));
                assert_eq!(def.limits.and_then(|l| l.memory_mb), Some(512));
            }
            _ => panic!("expected CreateSite"),
        }
    }

    #[test]
    fn test_custom_command_run_as_admin() {
        let cli = Cli::try_parse_from([
            "hostplane", "service", "cmd", "run", "demo/web", "migrate", "--role", "admin",
        ])
        .unwrap();
        match build_command(cli.command).unwrap().0 {
            Command::ExecuteCommand { role, name, .. } => {
                assert_eq!(role, CallerRole::Admin);
                assert_eq!(name, "migrate");
            }
            _ => panic!("expected ExecuteCommand"),
        }
    }
}
