// Output formatting and display for CLI

use crate::ipc::Envelope;
use crate::model::{
    Alert, AlertSeverity, AlertStatus, CustomCommand, ServerSample, Service, ServiceStatus,
    ServiceUsage, Site, SiteSample, SiteStatus,
};
use crate::process::CommandOutcome;
use crate::services::HealthReport;
use crate::sites::FanOutReport;
use chrono::{DateTime, Local, Utc};
use colored::*;
use serde::de::DeserializeOwned;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// How to present the payload of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Site,
    Sites,
    Service,
    Services,
    FanOut,
    Health,
    Outcome,
    CustomCommands,
    ServerSample,
    ServerHistory,
    SiteSample,
    SiteHistory,
    ServiceUsage,
    Alert,
    Alerts,
    Json,
    Message,
}

pub fn print_json(envelope: &Envelope) {
    match serde_json::to_string_pretty(envelope) {
        Ok(text) => println!("{}", text),
        Err(e) => print_error(&e.to_string()),
    }
}

/// Render an envelope for a terminal
pub fn render(envelope: &Envelope, view: View) {
    if let Some(message) = &envelope.message {
        println!("{} {}", "✓".green().bold(), message);
    }

    if !envelope.success {
        let code = envelope
            .code
            .and_then(|c| serde_json::to_value(c).ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .map(|c| format!(" [{}]", c))
            .unwrap_or_default();
        print_error(&format!(
            "{}{}",
            envelope.error.as_deref().unwrap_or("request failed"),
            code
        ));
        // Partial failures still carry the per-service report
        if view == View::FanOut {
            if let Some(report) = decode::<FanOutReport>(envelope) {
                print_fan_out(&report);
            }
        }
        return;
    }

    let rendered = match view {
        View::Site => decode::<Site>(envelope).map(|site| print_site(&site)),
        View::Sites => decode::<Vec<Site>>(envelope).map(|sites| print_site_table(&sites)),
        View::Service => decode::<Service>(envelope).map(|service| print_service(&service)),
        View::Services => {
            decode::<Vec<Service>>(envelope).map(|services| print_service_table(&services))
        }
        View::FanOut => decode::<FanOutReport>(envelope).map(|report| print_fan_out(&report)),
        View::Health => decode::<HealthReport>(envelope).map(|report| print_health(&report)),
        View::Outcome => decode::<CommandOutcome>(envelope).map(|outcome| print_outcome(&outcome)),
        View::CustomCommands => {
            decode::<Vec<CustomCommand>>(envelope).map(|commands| print_commands(&commands))
        }
        View::ServerSample => decode::<ServerSample>(envelope).map(|s| print_server_sample(&s)),
        View::ServerHistory => {
            decode::<Vec<ServerSample>>(envelope).map(|samples| print_server_history(&samples))
        }
        View::SiteSample => decode::<SiteSample>(envelope).map(|s| print_site_sample(&s)),
        View::SiteHistory => {
            decode::<Vec<SiteSample>>(envelope).map(|samples| print_site_history(&samples))
        }
        View::ServiceUsage => {
            decode::<Vec<ServiceUsage>>(envelope).map(|usage| print_usage_table(&usage))
        }
        View::Alert => decode::<Alert>(envelope).map(|alert| print_alert_table(&[alert])),
        View::Alerts => decode::<Vec<Alert>>(envelope).map(|alerts| print_alert_table(&alerts)),
        View::Message => Some(()),
        View::Json => None,
    };

    if rendered.is_none() && view != View::Message {
        if let Some(data) = &envelope.data {
            match serde_json::to_string_pretty(data) {
                Ok(text) => println!("{}", text),
                Err(e) => print_error(&e.to_string()),
            }
        }
    }
}

fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    envelope.data_as().ok()
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

fn print_site(site: &Site) {
    println!("\n{}", "Site Details".bold().underline());
    println!();
    println!("  {:<14} {}", "ID:".bold(), site.id);
    println!("  {:<14} {}", "Name:".bold(), site.name.cyan());
    println!("  {:<14} {}", "Display Name:".bold(), site.display_name);
    println!("  {:<14} {}", "Status:".bold(), site_status_colored(site.status));
    println!("  {:<14} {}", "Owner:".bold(), site.owner);
    println!("  {:<14} {}", "Ports:".bold(), site.port_range);
    println!("  {:<14} {}", "Root:".bold(), site.root.display());
    if let Some(account) = &site.account {
        println!("  {:<14} {}", "Account:".bold(), account);
    }
    if !site.domains.is_empty() {
        println!("  {:<14} {}", "Domains:".bold(), site.domains.join(", "));
    }
    if let Some(memory) = site.limits.memory_bytes() {
        println!("  {:<14} {}", "Memory Limit:".bold(), format_memory(memory));
    }
    println!("  {:<14} {}", "Created:".bold(), format_time(&site.created_at));
    println!();
}

fn print_site_table(sites: &[Site]) {
    if sites.is_empty() {
        println!("{}", "No sites".yellow());
        return;
    }

    #[derive(Tabled)]
    struct SiteRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Owner")]
        owner: String,
        #[tabled(rename = "Ports")]
        ports: String,
        #[tabled(rename = "Domains")]
        domains: String,
    }

    let rows: Vec<SiteRow> = sites
        .iter()
        .map(|s| SiteRow {
            name: truncate(&s.name, 24),
            status: site_status_colored(s.status),
            owner: s.owner.clone(),
            ports: s.port_range.to_string(),
            domains: s.domains.len().to_string(),
        })
        .collect();

    print_table(Table::new(rows));
    println!("{}", format!("Total: {} site(s)", sites.len()).dimmed().italic());
}

fn print_service(service: &Service) {
    println!("\n{}", "Service Details".bold().underline());
    println!();
    println!("  {:<14} {}", "ID:".bold(), service.id);
    println!("  {:<14} {}", "Name:".bold(), service.name.cyan());
    println!("  {:<14} {}", "Status:".bold(), service_status_colored(service.status));
    println!("  {:<14} {}", "Desired:".bold(), service.desired);
    println!("  {:<14} {}", "Port:".bold(), service.port);
    println!("  {:<14} {}", "Unit:".bold(), service.unit);
    println!("  {:<14} {}", "Command:".bold(), service.start_command);
    if let Some(pid) = service.pid {
        println!("  {:<14} {}", "PID:".bold(), pid);
    }
    if !service.custom_commands.is_empty() {
        let names: Vec<&str> = service.custom_commands.iter().map(|c| c.name.as_str()).collect();
        println!("  {:<14} {}", "Commands:".bold(), names.join(", "));
    }
    println!();
}

fn print_service_table(services: &[Service]) {
    if services.is_empty() {
        println!("{}", "No services".yellow());
        return;
    }

    #[derive(Tabled)]
    struct ServiceRow {
        #[tabled(rename = "Unit")]
        unit: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Desired")]
        desired: String,
        #[tabled(rename = "Port")]
        port: u16,
        #[tabled(rename = "PID")]
        pid: String,
    }

    let rows: Vec<ServiceRow> = services
        .iter()
        .map(|s| ServiceRow {
            unit: truncate(&s.unit, 32),
            status: service_status_colored(s.status),
            desired: s.desired.to_string(),
            port: s.port,
            pid: s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    print_table(Table::new(rows));
    println!(
        "{}",
        format!("Total: {} service(s)", services.len()).dimmed().italic()
    );
}

fn print_fan_out(report: &FanOutReport) {
    for ok in &report.succeeded {
        println!("  {} {}", "✓".green(), ok.name);
    }
    for failed in &report.failed {
        println!("  {} {}: {}", "✗".red(), failed.name, failed.error.dimmed());
    }
}

fn print_health(report: &HealthReport) {
    let verdict = if report.drift {
        "drift".red().bold().to_string()
    } else {
        "converged".green().to_string()
    };
    println!("\n{} {}", report.name.cyan().bold(), verdict);
    println!("  {:<10} {}", "Desired:".bold(), report.desired);
    println!("  {:<10} {}", "Recorded:".bold(), service_status_colored(report.recorded));
    println!("  {:<10} {}", "Actual:".bold(), service_status_colored(report.actual));
    if let Some(pid) = report.pid {
        println!("  {:<10} {}", "PID:".bold(), pid);
    }
    if let Some(uptime) = report.uptime_secs {
        println!("  {:<10} {}", "Uptime:".bold(), format_duration(uptime));
    }
    if let Some(memory) = report.memory_bytes {
        println!("  {:<10} {}", "Memory:".bold(), format_memory(memory));
    }
    if let Some(cpu) = report.cpu_percent {
        println!("  {:<10} {:.1}%", "CPU:".bold(), cpu);
    }
    println!();
}

fn print_outcome(outcome: &CommandOutcome) {
    let status = if outcome.timed_out {
        "timed out".yellow().bold().to_string()
    } else if outcome.success {
        "succeeded".green().bold().to_string()
    } else {
        format!("failed (exit {})", outcome.exit_code.unwrap_or(-1))
            .red()
            .bold()
            .to_string()
    };
    println!("Command {} in {}ms", status, outcome.duration_ms);
    if !outcome.output.is_empty() {
        println!("\n{}", outcome.output.trim_end());
    }
}

fn print_commands(commands: &[CustomCommand]) {
    if commands.is_empty() {
        println!("{}", "No custom commands".yellow());
        return;
    }

    #[derive(Tabled)]
    struct CommandRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Command")]
        command: String,
        #[tabled(rename = "Flags")]
        flags: String,
    }

    let rows: Vec<CommandRow> = commands
        .iter()
        .map(|c| {
            let mut flags = Vec::new();
            if c.requires_stop {
                flags.push("requires-stop");
            }
            if c.dangerous {
                flags.push("dangerous");
            }
            CommandRow {
                name: c.name.clone(),
                command: truncate(&c.command, 40),
                flags: flags.join(","),
            }
        })
        .collect();

    print_table(Table::new(rows));
}

fn print_server_sample(sample: &ServerSample) {
    println!("\n{}", "Server".bold().underline());
    println!();
    println!("  {:<10} {}", "Sampled:".bold(), format_time(&sample.timestamp));
    println!("  {:<10} {}", "CPU:".bold(), colored_percent(sample.cpu_percent));
    println!(
        "  {:<10} {:.2} {:.2} {:.2}",
        "Load:".bold(),
        sample.load_average[0],
        sample.load_average[1],
        sample.load_average[2]
    );
    println!(
        "  {:<10} {} of {} ({})",
        "Memory:".bold(),
        format_memory(sample.memory_used),
        format_memory(sample.memory_total),
        colored_percent(sample.memory_percent)
    );
    println!(
        "  {:<10} {} of {} ({})",
        "Disk:".bold(),
        format_memory(sample.disk_used),
        format_memory(sample.disk_total),
        colored_percent(sample.disk_percent)
    );
    println!(
        "  {:<10} rx {} / tx {}",
        "Network:".bold(),
        format_memory(sample.network_rx_bytes),
        format_memory(sample.network_tx_bytes)
    );
    println!("  {:<10} {}", "Uptime:".bold(), format_duration(sample.uptime_secs));
    println!(
        "  {:<10} {} sites ({} active), {} services ({} running), {} users",
        "Entities:".bold(),
        sample.counts.sites,
        sample.counts.active_sites,
        sample.counts.services,
        sample.counts.running_services,
        sample.counts.users
    );
    println!();
}

fn print_server_history(samples: &[ServerSample]) {
    if samples.is_empty() {
        println!("{}", "No samples in window".yellow());
        return;
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Disk")]
        disk: String,
    }

    let rows: Vec<Row> = samples
        .iter()
        .map(|s| Row {
            time: format_time(&s.timestamp),
            cpu: format!("{:.1}%", s.cpu_percent),
            memory: format!("{:.1}%", s.memory_percent),
            disk: format!("{:.1}%", s.disk_percent),
        })
        .collect();
    print_table(Table::new(rows));
}

fn print_site_sample(sample: &SiteSample) {
    println!("\n{}", "Site usage".bold().underline());
    println!();
    println!("  {:<10} {}", "Sampled:".bold(), format_time(&sample.timestamp));
    println!("  {:<10} {:.1}%", "CPU:".bold(), sample.cpu_percent);
    println!("  {:<10} {}", "Memory:".bold(), format_memory(sample.memory_bytes));
    println!("  {:<10} {}", "Disk:".bold(), format_memory(sample.disk_bytes));
    println!(
        "  {:<10} {}/{} running",
        "Services:".bold(),
        sample.services_running,
        sample.services_total
    );
    println!();
}

fn print_site_history(samples: &[SiteSample]) {
    if samples.is_empty() {
        println!("{}", "No samples in window".yellow());
        return;
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Running")]
        running: String,
    }

    let rows: Vec<Row> = samples
        .iter()
        .map(|s| Row {
            time: format_time(&s.timestamp),
            cpu: format!("{:.1}%", s.cpu_percent),
            memory: format_memory(s.memory_bytes),
            running: format!("{}/{}", s.services_running, s.services_total),
        })
        .collect();
    print_table(Table::new(rows));
}

fn print_usage_table(usage: &[ServiceUsage]) {
    if usage.is_empty() {
        println!("{}", "No services".yellow());
        return;
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
    }

    let rows: Vec<Row> = usage
        .iter()
        .map(|u| Row {
            name: u.name.clone(),
            status: service_status_colored(u.status),
            pid: u.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            cpu: format!("{:.1}%", u.cpu_percent),
            memory: format_memory(u.memory_bytes),
            uptime: format_duration(u.uptime_secs),
        })
        .collect();
    print_table(Table::new(rows));
}

fn print_alert_table(alerts: &[Alert]) {
    if alerts.is_empty() {
        println!("{}", "No alerts".green());
        return;
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Type")]
        alert_type: String,
        #[tabled(rename = "Severity")]
        severity: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Seen")]
        occurrences: u32,
        #[tabled(rename = "Message")]
        message: String,
        #[tabled(rename = "Created")]
        created: String,
    }

    let rows: Vec<Row> = alerts
        .iter()
        .map(|a| Row {
            id: a.id.to_string(),
            alert_type: a.alert_type.to_string(),
            severity: severity_colored(a.severity),
            status: alert_status_colored(a.status),
            occurrences: a.occurrences,
            message: truncate(&a.message, 48),
            created: format_time(&a.created_at),
        })
        .collect();
    print_table(Table::new(rows));
}

fn print_table(mut table: Table) {
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    println!("\n{}\n", table);
}

fn site_status_colored(status: SiteStatus) -> String {
    let text = status.to_string();
    match status {
        SiteStatus::Active => text.green().to_string(),
        SiteStatus::Pending | SiteStatus::Creating | SiteStatus::Deleting => {
            text.yellow().to_string()
        }
        SiteStatus::Stopped | SiteStatus::Deleted => text.bright_black().to_string(),
        SiteStatus::Error => text.red().bold().to_string(),
    }
}

fn service_status_colored(status: ServiceStatus) -> String {
    let text = status.to_string();
    match status {
        ServiceStatus::Running => text.green().to_string(),
        ServiceStatus::Stopped => text.bright_black().to_string(),
        ServiceStatus::Unknown => text.yellow().to_string(),
        ServiceStatus::Failed => text.red().bold().to_string(),
    }
}

fn severity_colored(severity: AlertSeverity) -> String {
    match severity {
        AlertSeverity::Warning => severity.to_string().yellow().to_string(),
        AlertSeverity::Critical => severity.to_string().red().bold().to_string(),
    }
}

fn alert_status_colored(status: AlertStatus) -> String {
    match status {
        AlertStatus::Active => status.to_string().red().to_string(),
        AlertStatus::Acknowledged => status.to_string().yellow().to_string(),
        AlertStatus::Resolved => status.to_string().bright_black().to_string(),
    }
}

fn colored_percent(value: f64) -> String {
    let text = format!("{:.1}%", value);
    if value >= 90.0 {
        text.red().bold().to_string()
    } else if value >= 75.0 {
        text.yellow().to_string()
    } else {
        text
    }
}

fn format_time(at: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = (*at).into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format a duration in seconds in human-readable format
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format a byte count in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
