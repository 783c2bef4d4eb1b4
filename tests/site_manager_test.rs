// Integration tests for site creation, fan-out operations and deletion

use hostplane::config::PlatformConfig;
use hostplane::error::{ErrorCode, HostplaneError};
use hostplane::events::PlatformEvent;
use hostplane::mock::{
    MockProbe, MockProvisioner, MockRunner, MockSupervisor, ProvisionOp, SupervisorOp,
};
use hostplane::model::{NewService, NewSite, ServiceStatus, SiteStatus};
use hostplane::state::Store;
use hostplane::{Collaborators, ControlPlane};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    supervisor: Arc<MockSupervisor>,
    provisioner: Arc<MockProvisioner>,
    plane: ControlPlane,
}

fn harness_with_pool(pool_start: u16, pool_end: u16) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = PlatformConfig::default();
    config.paths.sites_root = dir.path().join("sites");
    config.ports.pool_start = pool_start;
    config.ports.pool_end = pool_end;
    config.supervisor.start_timeout_secs = 1;
    config.supervisor.confirm_poll_ms = 10;

    let supervisor = Arc::new(MockSupervisor::new());
    let provisioner = Arc::new(MockProvisioner::new());
    let plane = ControlPlane::new(
        config,
        Arc::new(Store::in_memory()),
        Collaborators {
            supervisor: supervisor.clone(),
            runner: Arc::new(MockRunner::new()),
            probe: Arc::new(MockProbe::new()),
            provisioner: provisioner.clone(),
        },
    );

    Harness {
        _dir: dir,
        supervisor,
        provisioner,
        plane,
    }
}

fn harness() -> Harness {
    harness_with_pool(4001, 60000)
}

async fn site_with_services(h: &Harness, names: &[&str]) -> hostplane::model::Site {
    let site = h.plane.sites().create(NewSite::new("demo", "alice")).await.unwrap();
    for name in names {
        h.plane
            .services()
            .create(site.id, NewService::new(*name, format!("./{}", name)))
            .await
            .unwrap();
    }
    site
}

#[tokio::test]
async fn test_sites_get_disjoint_ranges() {
    let h = harness();
    let a = h.plane.sites().create(NewSite::new("alpha", "alice")).await.unwrap();
    let b = h.plane.sites().create(NewSite::new("beta", "bob")).await.unwrap();

    assert_eq!(a.status, SiteStatus::Active);
    assert_eq!((a.port_range.start, a.port_range.end), (4001, 4011));
    assert_eq!((b.port_range.start, b.port_range.end), (4011, 4021));
    assert!(a.root.ends_with("alpha"));

    let calls = h.provisioner.calls().await;
    assert!(calls.contains(&(ProvisionOp::CreateRoot, "alpha".to_string())));
    assert!(calls.contains(&(ProvisionOp::CreateAccount, "beta".to_string())));
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let h = harness_with_pool(5000, 5020);
    h.plane.sites().create(NewSite::new("one", "alice")).await.unwrap();
    h.plane.sites().create(NewSite::new("two", "alice")).await.unwrap();

    let err = h
        .plane
        .sites()
        .create(NewSite::new("three", "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostplaneError::ResourceExhausted(_)));
}

#[tokio::test]
async fn test_deleted_site_releases_range_and_name() {
    let h = harness_with_pool(5000, 5020);
    let one = h.plane.sites().create(NewSite::new("one", "alice")).await.unwrap();
    h.plane.sites().create(NewSite::new("two", "alice")).await.unwrap();

    let deleted = h.plane.sites().delete(one.id, false).await.unwrap();
    assert_eq!(deleted.status, SiteStatus::Deleted);

    let again = h.plane.sites().create(NewSite::new("one", "alice")).await.unwrap();
    assert_eq!(again.port_range.start, 5000);
    assert_ne!(again.id, one.id);

    assert_eq!(h.plane.sites().list(false).await.len(), 2);
    assert_eq!(h.plane.sites().list(true).await.len(), 3);
}

#[tokio::test]
async fn test_duplicate_and_invalid_site_names() {
    let h = harness();
    h.plane.sites().create(NewSite::new("demo", "alice")).await.unwrap();

    let err = h
        .plane
        .sites()
        .create(NewSite::new("demo", "bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostplaneError::AlreadyExists(_)));

    let err = h
        .plane
        .sites()
        .create(NewSite::new("Not A Slug", "bob"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_provisioning_failure_leaves_site_in_error() {
    let h = harness();
    h.provisioner.fail_on(ProvisionOp::CreateRoot).await;

    let err = h
        .plane
        .sites()
        .create(NewSite::new("demo", "alice"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SupervisorError);

    let site = h.plane.sites().resolve("demo").await.unwrap();
    assert_eq!(site.status, SiteStatus::Error);
}

#[tokio::test]
async fn test_service_ports_stay_inside_site_range() {
    let h = harness();
    let site = site_with_services(&h, &["web", "api", "worker"]).await;

    let services = h.plane.services().list(Some(site.id)).await;
    assert_eq!(services.len(), 3);

    let mut seen = HashSet::new();
    for service in &services {
        assert!(site.port_range.contains(service.port), "{}", service.port);
        assert!(seen.insert(service.port), "duplicate port {}", service.port);
    }
}

#[tokio::test]
async fn test_explicit_port_outside_range_is_rejected() {
    let h = harness();
    let site = site_with_services(&h, &[]).await;

    let mut def = NewService::new("web", "./web");
    def.port = Some(site.port_range.end);
    let err = h.plane.services().create(site.id, def).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_range_exhaustion_for_services() {
    let h = harness();
    let mut def = NewSite::new("tiny", "alice");
    def.port_count = Some(2);
    let site = h.plane.sites().create(def).await.unwrap();

    h.plane
        .services()
        .create(site.id, NewService::new("a", "./a"))
        .await
        .unwrap();
    h.plane
        .services()
        .create(site.id, NewService::new("b", "./b"))
        .await
        .unwrap();
    let err = h
        .plane
        .services()
        .create(site.id, NewService::new("c", "./c"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostplaneError::ResourceExhausted(_)));
}

#[tokio::test]
async fn test_start_fan_out_reports_partial_result() {
    let h = harness();
    let site = site_with_services(&h, &["web", "api"]).await;
    h.supervisor.fail_on(SupervisorOp::Start, "demo-api").await;

    let report = h.plane.sites().start(site.id).await.unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].name, "web");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "api");
    assert!(!report.failed[0].error.contains("injected"));

    let web = h.plane.services().find_by_name(site.id, "web").await.unwrap();
    assert_eq!(web.status, ServiceStatus::Running);
}

#[tokio::test]
async fn test_stop_and_restart_site() {
    let h = harness();
    let site = site_with_services(&h, &["web", "api"]).await;
    h.plane.sites().start(site.id).await.unwrap();

    let report = h.plane.sites().stop(site.id).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(
        h.plane.sites().get(site.id).await.unwrap().status,
        SiteStatus::Stopped
    );
    for service in h.plane.services().list(Some(site.id)).await {
        assert_eq!(service.status, ServiceStatus::Stopped);
    }

    let report = h.plane.sites().restart(site.id).await.unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(
        h.plane.sites().get(site.id).await.unwrap().status,
        SiteStatus::Active
    );
    assert!(h.supervisor.is_active("demo-web").await);
    assert!(h.supervisor.is_active("demo-api").await);
}

#[tokio::test]
async fn test_delete_with_failing_service_leaves_site_in_error() {
    let h = harness();
    let site = site_with_services(&h, &["web", "api", "worker"]).await;
    h.supervisor.fail_on(SupervisorOp::Remove, "demo-api").await;

    let err = h.plane.sites().delete(site.id, false).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PartialFailure);

    let site = h.plane.sites().get(site.id).await.unwrap();
    assert_eq!(site.status, SiteStatus::Error);

    let remaining: Vec<String> = h
        .plane
        .services()
        .list(Some(site.id))
        .await
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(remaining, vec!["api".to_string()]);

    // Account and root are kept for the retry
    let calls = h.provisioner.calls().await;
    assert!(!calls.iter().any(|(op, _)| *op == ProvisionOp::RemoveRoot));

    h.supervisor.clear_failures().await;
    let deleted = h.plane.sites().delete(site.id, false).await.unwrap();
    assert_eq!(deleted.status, SiteStatus::Deleted);
    assert!(h.plane.services().list(Some(site.id)).await.is_empty());
    assert_eq!(h.supervisor.unit_count().await, 0);
}

#[tokio::test]
async fn test_force_delete_ignores_failures() {
    let h = harness();
    let site = site_with_services(&h, &["web"]).await;
    h.plane.sites().add_domain(site.id, "demo.example.com").await.unwrap();
    h.supervisor.fail_on(SupervisorOp::Remove, "demo-web").await;
    h.provisioner.fail_on(ProvisionOp::RemoveAccount).await;

    let deleted = h.plane.sites().delete(site.id, true).await.unwrap();
    assert_eq!(deleted.status, SiteStatus::Deleted);
    assert!(deleted.domains.is_empty());
    assert!(h.plane.services().list(Some(site.id)).await.is_empty());

    let calls = h.provisioner.calls().await;
    assert!(calls.contains(&(ProvisionOp::RemoveRoot, "demo".to_string())));
}

#[tokio::test]
async fn test_domains_are_unique_across_sites() {
    let h = harness();
    let a = h.plane.sites().create(NewSite::new("alpha", "alice")).await.unwrap();
    let b = h.plane.sites().create(NewSite::new("beta", "bob")).await.unwrap();

    let site = h.plane.sites().add_domain(a.id, "Shop.Example.com").await.unwrap();
    assert_eq!(site.domains, vec!["shop.example.com".to_string()]);

    let err = h
        .plane
        .sites()
        .add_domain(b.id, "shop.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, HostplaneError::AlreadyExists(_)));

    let err = h.plane.sites().add_domain(b.id, "bad domain").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let site = h.plane.sites().remove_domain(a.id, "shop.example.com").await.unwrap();
    assert!(site.domains.is_empty());
    h.plane.sites().add_domain(b.id, "shop.example.com").await.unwrap();
}

#[tokio::test]
async fn test_site_environment_reaches_units() {
    let h = harness();
    let site = site_with_services(&h, &["web"]).await;

    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), "1".to_string());
    let err = h.plane.sites().set_environment(site.id, env).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let mut env = BTreeMap::new();
    env.insert("NODE_ENV".to_string(), "production".to_string());
    h.plane.sites().set_environment(site.id, env).await.unwrap();

    let descriptor = h.supervisor.descriptor("demo-web").await.unwrap();
    assert_eq!(
        descriptor.env.get("NODE_ENV").map(String::as_str),
        Some("production")
    );
    let web = h.plane.services().find_by_name(site.id, "web").await.unwrap();
    assert_eq!(descriptor.env.get("PORT"), Some(&web.port.to_string()));
}

#[tokio::test]
async fn test_site_status_events() {
    let h = harness();
    let mut events = h.plane.events().subscribe();

    let site = h.plane.sites().create(NewSite::new("demo", "alice")).await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PlatformEvent::SiteStatusChanged { site_id, status, .. } = event {
            assert_eq!(site_id, site.id);
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![SiteStatus::Creating, SiteStatus::Active]);
}
