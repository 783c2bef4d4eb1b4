// Integration test for the wire format other tools speak to the daemon

use hostplane::config::DedupPolicy;
use hostplane::ipc::{Command, Request, Response};
use hostplane::model::{AlertStatus, CallerRole, ServiceKind};
use serde_json::json;

fn parse(value: serde_json::Value) -> Command {
    serde_json::from_value(value).expect("Failed to deserialize command")
}

#[test]
fn test_create_site_payload_is_flat() {
    let command = parse(json!({
        "op": "create_site",
        "name": "shop",
        "owner": "alice",
        "port_count": 20,
        "limits": { "memory_mb": 512 }
    }));

    match command {
        Command::CreateSite(site) => {
            assert_eq!(site.name, "shop");
            assert_eq!(site.owner, "alice");
            assert_eq!(site.port_count, Some(20));
            assert_eq!(site.limits.unwrap().memory_mb, Some(512));
            assert!(site.display_name.is_none());
        }
        other => panic!("Expected CreateSite, got {:?}", other),
    }
}

#[test]
fn test_create_service_payload() {
    let command = parse(json!({
        "op": "create_service",
        "site": "shop",
        "service": {
            "name": "api",
            "kind": "node",
            "start_command": "node dist/server.js",
            "install_command": "npm ci",
            "environment": { "NODE_ENV": "production" },
            "custom_commands": [
                { "name": "migrate", "command": "npm run migrate", "requires_stop": true }
            ]
        }
    }));

    match command {
        Command::CreateService { site, service } => {
            assert_eq!(site, "shop");
            assert_eq!(service.kind, ServiceKind::Node);
            assert_eq!(service.install_command.as_deref(), Some("npm ci"));
            assert!(!service.auto_start);
            assert_eq!(service.custom_commands.len(), 1);
            assert!(service.custom_commands[0].requires_stop);
            assert!(!service.custom_commands[0].dangerous);
        }
        other => panic!("Expected CreateService, got {:?}", other),
    }
}

#[test]
fn test_execute_command_role_defaults_to_owner() {
    let command = parse(json!({
        "op": "execute_command",
        "service": "shop/api",
        "name": "migrate"
    }));
    assert!(matches!(
        command,
        Command::ExecuteCommand { role: CallerRole::Owner, .. }
    ));

    let command = parse(json!({
        "op": "execute_command",
        "service": "shop/api",
        "name": "migrate",
        "role": "admin"
    }));
    assert!(matches!(
        command,
        Command::ExecuteCommand { role: CallerRole::Admin, .. }
    ));
}

#[test]
fn test_alert_and_monitoring_payloads() {
    let command = parse(json!({
        "op": "list_alerts",
        "filter": { "status": "acknowledged", "limit": 10 }
    }));
    match command {
        Command::ListAlerts { filter } => {
            assert_eq!(filter.status, Some(AlertStatus::Acknowledged));
            assert_eq!(filter.limit, Some(10));
            assert!(filter.site_id.is_none());
        }
        other => panic!("Expected ListAlerts, got {:?}", other),
    }

    let command = parse(json!({
        "op": "update_monitoring_config",
        "interval_secs": 15,
        "dedup_policy": "extend"
    }));
    match command {
        Command::UpdateMonitoringConfig(update) => {
            assert_eq!(update.interval_secs, Some(15));
            assert_eq!(update.dedup_policy, Some(DedupPolicy::Extend));
            assert!(update.thresholds.is_none());
        }
        other => panic!("Expected UpdateMonitoringConfig, got {:?}", other),
    }
}

#[test]
fn test_unknown_op_is_rejected() {
    let result: Result<Command, _> = serde_json::from_value(json!({"op": "reboot_host"}));
    assert!(result.is_err());
}

#[test]
fn test_request_and_response_lines() {
    let line = r#"{"id":42,"command":{"op":"get_site","site":"shop"}}"#;
    let request: Request = serde_json::from_str(line).unwrap();
    assert_eq!(request.id, 42);
    assert!(matches!(request.command, Command::GetSite { ref site } if site == "shop"));

    let line = r#"{"id":42,"envelope":{"success":false,"error":"Site not found: shop","code":"NOT_FOUND"}}"#;
    let response: Response = serde_json::from_str(line).unwrap();
    assert_eq!(response.id, 42);
    assert!(!response.envelope.success);
    assert!(response.envelope.data.is_none());
    assert_eq!(
        serde_json::to_value(&response.envelope.code).unwrap(),
        json!("NOT_FOUND")
    );
}
