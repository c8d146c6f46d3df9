// agent/src/sys/users.rs

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Compensation, Result};
use crate::registry::{NewSystemUser, Registry, SystemUserRecord, SystemUserUpdate};
use crate::sys::exec::CommandExecutor;
use crate::sys::vhost::VirtualHostProvisioner;

/// userdel's exit status when the account does not exist; removal is
/// idempotent from the inventory's point of view.
const USERDEL_NO_SUCH_USER: i32 = 6;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub ssh_enabled: bool,
    #[serde(default)]
    pub ftp_enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ssh_enabled: Option<bool>,
    #[serde(default)]
    pub ftp_enabled: Option<bool>,
}

/// 🛡️ Zero-Trust: the username becomes an OS account name and a chown
/// target, so only the strict grammar gets through.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 32 {
        return Err(AgentError::Validation(
            "username must be 1-32 characters".into(),
        ));
    }
    let re = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
    if !re.is_match(username) {
        return Err(AgentError::Validation(format!(
            "'{}' is not a valid username",
            username
        )));
    }
    Ok(())
}

pub struct SystemUserProvisioner {
    config: AgentConfig,
    executor: Arc<dyn CommandExecutor>,
    registry: Arc<dyn Registry>,
    vhosts: Arc<VirtualHostProvisioner>,
}

impl SystemUserProvisioner {
    pub fn new(
        config: AgentConfig,
        executor: Arc<dyn CommandExecutor>,
        registry: Arc<dyn Registry>,
        vhosts: Arc<VirtualHostProvisioner>,
    ) -> Self {
        Self { config, executor, registry, vhosts }
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    // ==========================================================================
    // 1. Create: OS account first, registry commit last
    // ==========================================================================

    pub async fn create(&self, req: CreateUserRequest) -> Result<SystemUserRecord> {
        validate_username(&req.username)?;

        let shell = req.shell.unwrap_or_else(|| self.config.default_shell.clone());
        if !shell.starts_with('/') {
            return Err(AgentError::Validation(
                "login shell must be an absolute path".into(),
            ));
        }

        if self.registry.username_exists(&req.username).await? {
            return Err(AgentError::Validation(format!(
                "username '{}' already registered",
                req.username
            )));
        }

        // Home directory is derived, never chosen.
        let home = self.config.home_root.join(&req.username);
        let home_str = home.to_string_lossy().into_owned();

        self.executor
            .run(
                "useradd",
                &["-m", "-d", &home_str, "-s", &shell, &req.username],
                self.deadline(),
            )
            .await?;

        let ownership = format!("{}:{}", req.username, req.username);
        let fixup = async {
            self.executor
                .run("chown", &[&ownership, &home_str], self.deadline())
                .await?;
            self.executor
                .run("chmod", &["755", &home_str], self.deadline())
                .await
        }
        .await;

        if let Err(err) = fixup {
            // The account exists but its home is wrong: take it back out
            // rather than hand over a half-provisioned tenant.
            warn!(username = %req.username, error = %err, "home fixup failed, removing account");
            self.compensating_removal(&req.username).await;
            return Err(err);
        }

        match self
            .registry
            .create_user(NewSystemUser {
                username: req.username.clone(),
                home_directory: home,
                shell,
                ssh_enabled: req.ssh_enabled,
                ftp_enabled: req.ftp_enabled,
                description: req.description,
                created_by: req.created_by,
            })
            .await
        {
            Ok(record) => {
                info!(username = %record.username, id = record.id, "system user provisioned");
                Ok(record)
            }
            Err(err) => {
                // OS account exists, inventory does not: the orphan case.
                // Attempt the compensating removal and report its outcome
                // inside the error payload instead of guessing.
                let compensation = self.compensating_removal(&req.username).await;
                Err(AgentError::Persistence {
                    message: format!("registry commit failed after account creation: {}", err),
                    compensation: Some(compensation),
                })
            }
        }
    }

    async fn compensating_removal(&self, username: &str) -> Compensation {
        let attempted = format!("userdel -r {}", username);
        match self
            .executor
            .run("userdel", &["-r", username], self.deadline())
            .await
        {
            Ok(_) => Compensation {
                attempted,
                succeeded: true,
                detail: "account removed".to_string(),
            },
            Err(e) => {
                warn!(username = %username, error = %e, "compensating removal failed; account is orphaned");
                Compensation { attempted, succeeded: false, detail: e.to_string() }
            }
        }
    }

    // ==========================================================================
    // 2. Update: non-identity fields only, no OS-level action
    // ==========================================================================

    pub async fn update(&self, id: u64, req: UpdateUserRequest) -> Result<SystemUserRecord> {
        self.registry
            .update_user(
                id,
                SystemUserUpdate {
                    description: req.description.map(Some),
                    ssh_enabled: req.ssh_enabled,
                    ftp_enabled: req.ftp_enabled,
                },
            )
            .await
    }

    // ==========================================================================
    // 3. Delete: owned vhosts first, then the account, then the record
    // ==========================================================================

    pub async fn delete(&self, id: u64) -> Result<()> {
        let user = self
            .registry
            .find_user(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("system user {}", id)))?;

        // No site definition may outlive its account: deprovision each owned
        // vhost through the full transactional path before touching the user.
        for vhost in self.registry.vhosts_owned_by(id).await? {
            self.vhosts.delete(vhost.id).await?;
        }

        match self
            .executor
            .run("userdel", &["-r", &user.username], self.deadline())
            .await
        {
            Ok(_) => {}
            Err(AgentError::ExternalCommand { exit_code: USERDEL_NO_SUCH_USER, .. }) => {
                // Already gone at the OS level; still deregister.
            }
            Err(e) => return Err(e),
        }

        self.registry.delete_user(id).await?;
        info!(username = %user.username, id, "system user deprovisioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::locks::ReloadGate;
    use crate::sys::vhost::CreateVhostRequest;
    use crate::testutil::{exists, FailingRegistry, Sandbox};

    fn provisioners(sb: &Sandbox) -> (SystemUserProvisioner, Arc<VirtualHostProvisioner>) {
        let vhosts = Arc::new(VirtualHostProvisioner::new(
            sb.config.clone(),
            sb.host.clone(),
            sb.registry.clone(),
            ReloadGate::new(),
        ));
        let users = SystemUserProvisioner::new(
            sb.config.clone(),
            sb.host.clone(),
            sb.registry.clone(),
            vhosts.clone(),
        );
        (users, vhosts)
    }

    fn create_req(name: &str) -> CreateUserRequest {
        CreateUserRequest {
            username: name.to_string(),
            shell: None,
            ssh_enabled: false,
            ftp_enabled: false,
            description: None,
            created_by: Some("admin".to_string()),
        }
    }

    #[tokio::test]
    async fn create_runs_useradd_then_fixup_then_registers() {
        let sb = Sandbox::new().await;
        let (users, _) = provisioners(&sb);

        let record = users.create(create_req("alice")).await.unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.home_directory, sb.config.home_root.join("alice"));
        assert_eq!(record.shell, "/bin/bash");

        let calls = sb.host.calls();
        let home = sb.config.home_root.join("alice");
        assert_eq!(
            calls[0],
            format!("useradd -m -d {} -s /bin/bash alice", home.display())
        );
        assert_eq!(calls[1], format!("chown alice:alice {}", home.display()));
        assert_eq!(calls[2], format!("chmod 755 {}", home.display()));
    }

    #[tokio::test]
    async fn malformed_usernames_never_reach_the_os() {
        let sb = Sandbox::new().await;
        let (users, _) = provisioners(&sb);

        for bad in ["", "has space", "dot.dot", "semi;colon", "a/b", &"x".repeat(33)] {
            let err = users.create(create_req(bad)).await.unwrap_err();
            assert!(matches!(err, AgentError::Validation(_)), "{:?} accepted", bad);
        }
        assert!(sb.host.calls().is_empty());
    }

    #[tokio::test]
    async fn duplicate_username_rejected_without_os_calls() {
        let sb = Sandbox::new().await;
        let (users, _) = provisioners(&sb);
        users.create(create_req("alice")).await.unwrap();
        let calls_before = sb.host.calls().len();

        let err = users.create(create_req("alice")).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
        assert_eq!(sb.host.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn registry_failure_triggers_compensating_removal() {
        let sb = Sandbox::new().await;
        let registry = Arc::new(FailingRegistry {
            inner: sb.registry.clone(),
            fail_create_user: true,
        });
        let vhosts = Arc::new(VirtualHostProvisioner::new(
            sb.config.clone(),
            sb.host.clone(),
            registry.clone(),
            ReloadGate::new(),
        ));
        let users = SystemUserProvisioner::new(
            sb.config.clone(),
            sb.host.clone(),
            registry,
            vhosts,
        );

        let err = users.create(create_req("alice")).await.unwrap_err();
        match err {
            AgentError::Persistence { compensation: Some(c), .. } => {
                assert!(c.succeeded);
                assert_eq!(c.attempted, "userdel -r alice");
            }
            other => panic!("expected Persistence with compensation, got {:?}", other),
        }
        assert_eq!(sb.host.calls_matching("userdel -r alice").len(), 1);
        // Inventory untouched
        assert!(!sb.registry.username_exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn failed_compensation_is_reported_not_swallowed() {
        let sb = Sandbox::new().await;
        let registry = Arc::new(FailingRegistry {
            inner: sb.registry.clone(),
            fail_create_user: true,
        });
        let vhosts = Arc::new(VirtualHostProvisioner::new(
            sb.config.clone(),
            sb.host.clone(),
            registry.clone(),
            ReloadGate::new(),
        ));
        let users = SystemUserProvisioner::new(
            sb.config.clone(),
            sb.host.clone(),
            registry,
            vhosts,
        );
        sb.host.fail_on("userdel", "userdel: cannot lock /etc/passwd");

        let err = users.create(create_req("alice")).await.unwrap_err();
        match err {
            AgentError::Persistence { compensation: Some(c), .. } => {
                assert!(!c.succeeded);
                assert!(c.detail.contains("userdel"));
            }
            other => panic!("expected Persistence with failed compensation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn update_is_registry_only() {
        let sb = Sandbox::new().await;
        let (users, _) = provisioners(&sb);
        let record = users.create(create_req("alice")).await.unwrap();
        let calls_before = sb.host.calls().len();

        let updated = users
            .update(
                record.id,
                UpdateUserRequest {
                    description: Some("staging tenant".to_string()),
                    ssh_enabled: Some(true),
                    ftp_enabled: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.description.as_deref(), Some("staging tenant"));
        assert!(updated.ssh_enabled);
        assert_eq!(sb.host.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn delete_deprovisions_owned_vhosts_before_the_account() {
        let sb = Sandbox::new().await;
        let (users, vhosts) = provisioners(&sb);
        let record = users.create(create_req("alice")).await.unwrap();
        vhosts
            .create(CreateVhostRequest {
                domain: "example.com".to_string(),
                system_user_id: record.id,
                document_root: None,
                php_version: None,
                ssl_enabled: false,
                custom_config: None,
            })
            .await
            .unwrap();

        users.delete(record.id).await.unwrap();

        assert!(!exists(&sb.sites_available("example.com")));
        assert!(!exists(&sb.sites_enabled("example.com")));
        assert!(sb.registry.find_user(record.id).await.unwrap().is_none());
        assert!(sb.registry.find_vhost_by_domain("example.com").await.unwrap().is_none());
        assert_eq!(sb.host.calls_matching("userdel -r alice").len(), 1);
    }

    #[tokio::test]
    async fn delete_tolerates_an_already_absent_os_account() {
        let sb = Sandbox::new().await;
        let (users, _) = provisioners(&sb);
        let record = users.create(create_req("alice")).await.unwrap();

        sb.host.fail_with("userdel", USERDEL_NO_SUCH_USER, "userdel: user alice does not exist");
        users.delete(record.id).await.unwrap();
        assert!(sb.registry.find_user(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_aborts_when_account_removal_fails() {
        let sb = Sandbox::new().await;
        let (users, _) = provisioners(&sb);
        let record = users.create(create_req("alice")).await.unwrap();

        sb.host.fail_on("userdel", "userdel: cannot lock /etc/passwd");
        let err = users.delete(record.id).await.unwrap_err();
        assert!(matches!(err, AgentError::ExternalCommand { .. }));
        // Record stays: the OS account still exists
        assert!(sb.registry.find_user(record.id).await.unwrap().is_some());
    }
}
