use crate::config::ProvisioningConfig;
use crate::error::{HostplaneError, Result};
use crate::model::Site;
use crate::process::{CommandSpec, ProcessRunner};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Longest account name useradd accepts
const MAX_ACCOUNT_LEN: usize = 32;

const PROVISION_TIMEOUT: Duration = Duration::from_secs(60);

/// Host-side resources owned by a site
#[async_trait]
pub trait SiteProvisioner: Send + Sync {
    async fn create_root(&self, site: &Site) -> Result<()>;

    /// Create the site's OS account, if accounts are enabled
    async fn create_account(&self, site: &Site) -> Result<Option<String>>;

    /// Hook for tenant database cleanup on delete
    async fn remove_databases(&self, site: &Site) -> Result<()>;

    async fn remove_account(&self, site: &Site) -> Result<()>;

    async fn remove_root(&self, site: &Site) -> Result<()>;
}

/// Provisioner acting on the local host
pub struct LocalProvisioner {
    config: ProvisioningConfig,
    runner: Arc<dyn ProcessRunner>,
}

impl LocalProvisioner {
    pub fn new(config: ProvisioningConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    pub fn account_name(&self, site: &Site) -> String {
        let mut name = format!("{}{}", self.config.account_prefix, site.name);
        name.truncate(MAX_ACCOUNT_LEN);
        name.trim_end_matches('-').to_string()
    }

    async fn run(&self, site: &Site, what: &str, command: String) -> Result<()> {
        let mut env = BTreeMap::new();
        env.insert("SITE_NAME".to_string(), site.name.clone());
        env.insert("SITE_ROOT".to_string(), site.root.display().to_string());

        let spec = CommandSpec {
            command,
            cwd: PathBuf::from("/"),
            env,
            timeout: PROVISION_TIMEOUT,
            user: None,
            max_output_bytes: 8192,
        };

        let outcome = self.runner.run(&spec).await?;
        if !outcome.success {
            tracing::error!(
                "{} for site {} failed (exit {:?}): {}",
                what,
                site.name,
                outcome.exit_code,
                outcome.output
            );
            return Err(HostplaneError::Provision(format!(
                "{} failed for site {}",
                what, site.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SiteProvisioner for LocalProvisioner {
    async fn create_root(&self, site: &Site) -> Result<()> {
        tokio::fs::create_dir_all(&site.root).await.map_err(|e| {
            tracing::error!("Failed to create {}: {}", site.root.display(), e);
            HostplaneError::Provision(format!("could not create root for site {}", site.name))
        })
    }

    async fn create_account(&self, site: &Site) -> Result<Option<String>> {
        if !self.config.create_accounts {
            return Ok(None);
        }

        let account = self.account_name(site);
        self.run(
            site,
            "account creation",
            format!(
                "useradd --system --no-create-home --home-dir '{}' --shell /usr/sbin/nologin '{}' && chown -R '{}': '{}'",
                site.root.display(),
                account,
                account,
                site.root.display()
            ),
        )
        .await?;

        tracing::info!("Created account {} for site {}", account, site.name);
        Ok(Some(account))
    }

    async fn remove_databases(&self, site: &Site) -> Result<()> {
        match self.config.database_cleanup_command {
            Some(ref command) => self.run(site, "database cleanup", command.clone()).await,
            None => Ok(()),
        }
    }

    async fn remove_account(&self, site: &Site) -> Result<()> {
        match site.account {
            Some(ref account) => {
                self.run(site, "account removal", format!("userdel '{}'", account))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn remove_root(&self, site: &Site) -> Result<()> {
        match tokio::fs::remove_dir_all(&site.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::error!("Failed to remove {}: {}", site.root.display(), e);
                Err(HostplaneError::Provision(format!(
                    "could not remove root for site {}",
                    site.name
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRunner;
    use crate::model::{PortRange, ResourceLimits, SiteId, SiteStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn site(root: PathBuf, account: Option<&str>) -> Site {
        Site {
            id: SiteId::new(),
            name: "demo".to_string(),
            display_name: "demo".to_string(),
            description: String::new(),
            status: SiteStatus::Creating,
            owner: "alice".to_string(),
            port_range: PortRange::new(4000, 4010),
            domains: Vec::new(),
            environment: BTreeMap::new(),
            limits: ResourceLimits::default(),
            root,
            account: account.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn provisioner(config: ProvisioningConfig) -> (LocalProvisioner, Arc<MockRunner>) {
        let runner = Arc::new(MockRunner::new());
        (LocalProvisioner::new(config, runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_root_is_created_and_removed() {
        let dir = TempDir::new().unwrap();
        let (provisioner, _) = provisioner(ProvisioningConfig::default());
        let site = site(dir.path().join("demo"), None);

        provisioner.create_root(&site).await.unwrap();
        assert!(site.root.is_dir());

        provisioner.remove_root(&site).await.unwrap();
        assert!(!site.root.exists());
        // Already gone is fine
        provisioner.remove_root(&site).await.unwrap();
    }

    #[tokio::test]
    async fn test_accounts_disabled_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let (provisioner, runner) = provisioner(ProvisioningConfig::default());
        let site = site(dir.path().join("demo"), None);

        assert_eq!(provisioner.create_account(&site).await.unwrap(), None);
        provisioner.remove_account(&site).await.unwrap();
        provisioner.remove_databases(&site).await.unwrap();
        assert!(runner.invocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_account_creation() {
        let dir = TempDir::new().unwrap();
        let config = ProvisioningConfig {
            create_accounts: true,
            ..ProvisioningConfig::default()
        };
        let (provisioner, runner) = provisioner(config);
        let site = site(dir.path().join("demo"), None);

        let account = provisioner.create_account(&site).await.unwrap().unwrap();
        assert_eq!(account, provisioner.account_name(&site));

        let invocations = runner.invocations().await;
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].command.starts_with("useradd"));
        assert_eq!(
            invocations[0].env.get("SITE_NAME").map(String::as_str),
            Some("demo")
        );
    }

    #[tokio::test]
    async fn test_failed_hook_is_a_provision_error() {
        let dir = TempDir::new().unwrap();
        let config = ProvisioningConfig {
            database_cleanup_command: Some("drop-dbs".to_string()),
            ..ProvisioningConfig::default()
        };
        let (provisioner, runner) = provisioner(config);
        runner.respond("drop-dbs", MockRunner::failure(2, "no such db")).await;
        let site = site(dir.path().join("demo"), Some("site-demo"));

        let err = provisioner.remove_databases(&site).await.unwrap_err();
        assert!(matches!(err, HostplaneError::Provision(_)));
        assert!(!err.public_message().contains("no such db"));
    }

    #[test]
    fn test_account_name_is_bounded() {
        let (provisioner, _) = provisioner(ProvisioningConfig::default());
        let mut long = site(PathBuf::from("/tmp/x"), None);
        long.name = "a".repeat(60);
        assert!(provisioner.account_name(&long).len() <= MAX_ACCOUNT_LEN);
    }
}
