// agent/src/sys/vhost.rs
//
// The transactional core of the agent. A virtual host goes live only after
// the rendered configuration has survived the web server's own self-test;
// any failure between the pending registry insert and the reload unwinds
// back to the pre-request state (registry and filesystem both).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::registry::{NewVhost, Registry, VhostRecord, VhostStatus, VhostUpdate};
use crate::sys::exec::CommandExecutor;
use crate::sys::locks::ReloadGate;
use crate::sys::render::{ConfigRenderer, VhostTemplate};

pub const SUPPORTED_PHP_VERSIONS: &[&str] = &["8.1", "8.2", "8.3"];
pub const DEFAULT_PHP_VERSION: &str = "8.3";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVhostRequest {
    pub domain: String,
    pub system_user_id: u64,
    #[serde(default)]
    pub document_root: Option<PathBuf>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub custom_config: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateVhostRequest {
    #[serde(default)]
    pub document_root: Option<PathBuf>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub ssl_enabled: Option<bool>,
    #[serde(default)]
    pub status: Option<VhostStatus>,
    #[serde(default)]
    pub custom_config: Option<String>,
}

/// 🛡️ Zero-Trust: the domain both names OS files and lands inside the
/// rendered configuration, so it gets the strict grammar AND a traversal
/// guard before anything touches the filesystem.
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.contains("..") || domain.contains('/') || domain.contains('\\') {
        return Err(AgentError::Validation(format!(
            "path traversal detected in domain '{}'",
            domain
        )));
    }
    let re = Regex::new(r"^[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap();
    if !re.is_match(domain) {
        return Err(AgentError::Validation(format!(
            "'{}' is not a valid domain name",
            domain
        )));
    }
    Ok(())
}

fn validate_php_version(version: &str) -> Result<()> {
    if !SUPPORTED_PHP_VERSIONS.contains(&version) {
        return Err(AgentError::Validation(format!(
            "unsupported PHP version '{}' (supported: {})",
            version,
            SUPPORTED_PHP_VERSIONS.join(", ")
        )));
    }
    Ok(())
}

pub struct VirtualHostProvisioner {
    config: AgentConfig,
    executor: Arc<dyn CommandExecutor>,
    registry: Arc<dyn Registry>,
    renderer: ConfigRenderer,
    reload_gate: Arc<ReloadGate>,
}

impl VirtualHostProvisioner {
    pub fn new(
        config: AgentConfig,
        executor: Arc<dyn CommandExecutor>,
        registry: Arc<dyn Registry>,
        reload_gate: Arc<ReloadGate>,
    ) -> Self {
        let renderer = ConfigRenderer::new(
            config.cert_live_root.clone(),
            config.php_socket_dir.clone(),
        );
        Self { config, executor, registry, renderer, reload_gate }
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    pub(crate) fn gate(&self) -> &ReloadGate {
        &self.reload_gate
    }

    pub(crate) fn config_path(&self, domain: &str) -> PathBuf {
        self.config.sites_available_dir.join(domain)
    }

    pub(crate) fn enabled_path(&self, domain: &str) -> PathBuf {
        self.config.sites_enabled_dir.join(domain)
    }

    /// Renders the definition for a registered vhost with an explicit TLS
    /// flag (issuance re-renders with TLS on before the flag is committed).
    pub(crate) fn render_record(
        &self,
        vhost: &VhostRecord,
        owner_username: &str,
        tls_enabled: bool,
    ) -> String {
        self.renderer.render(&VhostTemplate {
            domain: &vhost.domain,
            document_root: &vhost.document_root,
            owner: owner_username,
            php_version: &vhost.php_version,
            tls_enabled,
            custom_fragment: vhost.custom_config.as_deref(),
        })
    }

    /// Current on-disk definition, if any. Used to snapshot before a rewrite.
    pub(crate) async fn read_config(&self, domain: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.config_path(domain)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stages `content` in a scratch file, then moves it into the privileged
    /// destination. The write happens unprivileged; only the `mv` touches
    /// the web-server directory.
    async fn stage_into(&self, content: &str, dest: &Path) -> Result<()> {
        let staged = tempfile::NamedTempFile::new()?.into_temp_path();
        fs::write(&staged, content).await?;
        let mut perms = fs::metadata(&staged).await?.permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&staged, perms).await?;

        let staged_str = staged.to_string_lossy().into_owned();
        let dest_str = dest.to_string_lossy().into_owned();
        self.executor
            .run("mv", &[&staged_str, &dest_str], self.deadline())
            .await?;
        // The scratch path was consumed by the move; its Drop cleanup is a no-op.
        let _ = staged.keep();
        Ok(())
    }

    /// Writes the site definition and (optionally) the activation link.
    /// Caller must hold the reload gate.
    pub(crate) async fn install_config(
        &self,
        domain: &str,
        content: &str,
        ensure_link: bool,
    ) -> Result<()> {
        self.stage_into(content, &self.config_path(domain)).await?;
        if ensure_link {
            let config = self.config_path(domain).to_string_lossy().into_owned();
            let enabled = self.enabled_path(domain).to_string_lossy().into_owned();
            self.executor
                .run("ln", &["-sfn", &config, &enabled], self.deadline())
                .await?;
        }
        Ok(())
    }

    /// Web-server dry run over the full configuration tree. A rejection is
    /// a `ConfigTest` failure carrying the tool's verbatim output.
    pub(crate) async fn self_test(&self) -> Result<()> {
        match self.executor.run("nginx", &["-t"], self.deadline()).await {
            Ok(_) => Ok(()),
            Err(AgentError::ExternalCommand { stdout, stderr, .. }) => {
                let mut output = stdout;
                if !stderr.is_empty() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&stderr);
                }
                Err(AgentError::ConfigTest { output })
            }
            Err(other) => Err(other),
        }
    }

    pub(crate) async fn reload(&self) -> Result<()> {
        self.executor
            .run("systemctl", &["reload", "nginx"], self.deadline())
            .await
            .map(|_| ())
    }

    /// Best-effort removal of the definition and activation link; failures
    /// are logged, not surfaced, because this runs while unwinding.
    async fn remove_config_files(&self, domain: &str) {
        let config = self.config_path(domain).to_string_lossy().into_owned();
        let enabled = self.enabled_path(domain).to_string_lossy().into_owned();
        if let Err(e) = self
            .executor
            .run("rm", &["-f", &enabled, &config], self.deadline())
            .await
        {
            warn!(domain = %domain, error = %e, "rollback could not remove site files");
        }
    }

    // ==========================================================================
    // 1. Create: Requested → DocRootEnsured → Persisted(pending) → Live
    // ==========================================================================

    pub async fn create(&self, req: CreateVhostRequest) -> Result<VhostRecord> {
        validate_domain(&req.domain)?;
        let php_version = req
            .php_version
            .unwrap_or_else(|| DEFAULT_PHP_VERSION.to_string());
        validate_php_version(&php_version)?;

        // Uniqueness before any OS-level action
        if self.registry.domain_exists(&req.domain).await? {
            return Err(AgentError::Validation(format!(
                "domain '{}' already registered",
                req.domain
            )));
        }
        let owner = self
            .registry
            .find_user(req.system_user_id)
            .await?
            .ok_or_else(|| {
                AgentError::Validation(format!(
                    "system user {} does not exist",
                    req.system_user_id
                ))
            })?;

        let document_root = match req.document_root {
            Some(root) => {
                if !root.is_absolute() {
                    return Err(AgentError::Validation(
                        "document root must be an absolute path".into(),
                    ));
                }
                root
            }
            None => owner.home_directory.join("public_html"),
        };

        self.ensure_document_root(&document_root, &owner.username, &req.domain)
            .await?;

        let config_text = self.renderer.render(&VhostTemplate {
            domain: &req.domain,
            document_root: &document_root,
            owner: &owner.username,
            php_version: &php_version,
            tls_enabled: req.ssl_enabled,
            custom_fragment: req.custom_config.as_deref(),
        });

        // Persisted(pending): the record exists before the first file write
        // so a crash mid-sequence is visible in the inventory.
        let record = self
            .registry
            .create_vhost(NewVhost {
                domain: req.domain.clone(),
                document_root,
                system_user_id: req.system_user_id,
                php_version,
                ssl_enabled: req.ssl_enabled,
                status: VhostStatus::Pending,
                nginx_config: Some(config_text.clone()),
                custom_config: req.custom_config,
            })
            .await?;

        let _gate = self.reload_gate.acquire().await;
        let applied = async {
            self.install_config(&req.domain, &config_text, true).await?;
            self.self_test().await?;
            self.reload().await
        }
        .await;

        if let Err(err) = applied {
            warn!(domain = %req.domain, error = %err, "virtual host create failed, unwinding");
            self.remove_config_files(&req.domain).await;
            if let Err(e) = self.registry.delete_vhost(record.id).await {
                warn!(domain = %req.domain, error = %e, "could not remove pending registry record");
            }
            return Err(err);
        }

        match self
            .registry
            .update_vhost(
                record.id,
                VhostUpdate { status: Some(VhostStatus::Active), ..Default::default() },
            )
            .await
        {
            Ok(live) => {
                info!(domain = %live.domain, id = live.id, "virtual host is live");
                Ok(live)
            }
            Err(e) => {
                // The site serves, but the inventory cannot say so: unwind
                // the OS side rather than leave the two disagreeing.
                warn!(domain = %req.domain, error = %e, "activation commit failed, unwinding");
                self.remove_config_files(&req.domain).await;
                if let Err(del) = self.registry.delete_vhost(record.id).await {
                    warn!(domain = %req.domain, error = %del, "could not remove pending registry record");
                }
                Err(e)
            }
        }
    }

    async fn ensure_document_root(
        &self,
        document_root: &Path,
        owner: &str,
        domain: &str,
    ) -> Result<()> {
        if fs::try_exists(document_root).await? {
            return Ok(());
        }

        let root = document_root.to_string_lossy().into_owned();
        let ownership = format!("{}:{}", owner, owner);
        self.executor.run("mkdir", &["-p", &root], self.deadline()).await?;
        self.executor
            .run("chown", &[&ownership, &root], self.deadline())
            .await?;
        self.executor.run("chmod", &["755", &root], self.deadline()).await?;

        // Placeholder landing page so the domain serves something real
        // the moment the definition goes live.
        let index = format!(
            "<!DOCTYPE html><html><head><title>Welcome to {domain}</title></head>\
             <body><h1>Website Under Construction</h1>\
             <p>This site is powered by Arbor.</p></body></html>"
        );
        let index_path = document_root.join("index.html");
        self.stage_into(&index, &index_path).await?;
        let index_str = index_path.to_string_lossy().into_owned();
        self.executor
            .run("chown", &[&ownership, &index_str], self.deadline())
            .await?;
        Ok(())
    }

    // ==========================================================================
    // 2. Update: snapshot, rewrite, verify; restore both sides on failure
    // ==========================================================================

    pub async fn update(&self, id: u64, req: UpdateVhostRequest) -> Result<VhostRecord> {
        let current = self
            .registry
            .find_vhost(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("virtual host {}", id)))?;
        let owner = self
            .registry
            .find_user(current.system_user_id)
            .await?
            .ok_or_else(|| {
                AgentError::NotFound(format!("system user {}", current.system_user_id))
            })?;

        if let Some(version) = &req.php_version {
            validate_php_version(version)?;
        }
        if let Some(root) = &req.document_root {
            if !root.is_absolute() {
                return Err(AgentError::Validation(
                    "document root must be an absolute path".into(),
                ));
            }
        }
        if req.status == Some(VhostStatus::Pending) {
            return Err(AgentError::Validation(
                "'pending' is not an assignable status".into(),
            ));
        }

        // Snapshot both sides before mutating either.
        let snapshot_record = current.clone();
        let snapshot_file = self.read_config(&current.domain).await?;

        let effective = VhostRecord {
            document_root: req.document_root.unwrap_or(current.document_root.clone()),
            php_version: req.php_version.unwrap_or(current.php_version.clone()),
            ssl_enabled: req.ssl_enabled.unwrap_or(current.ssl_enabled),
            status: req.status.unwrap_or(current.status),
            custom_config: req.custom_config.or(current.custom_config.clone()),
            ..current
        };
        let config_text =
            self.render_record(&effective, &owner.username, effective.ssl_enabled);

        let updated = self
            .registry
            .update_vhost(
                id,
                VhostUpdate {
                    document_root: Some(effective.document_root.clone()),
                    php_version: Some(effective.php_version.clone()),
                    ssl_enabled: Some(effective.ssl_enabled),
                    status: Some(effective.status),
                    nginx_config: Some(Some(config_text.clone())),
                    custom_config: Some(effective.custom_config.clone()),
                },
            )
            .await?;

        let _gate = self.reload_gate.acquire().await;
        let applied = async {
            self.install_config(&updated.domain, &config_text, false).await?;
            self.self_test().await?;
            self.reload().await
        }
        .await;

        if let Err(err) = applied {
            warn!(domain = %updated.domain, error = %err, "virtual host update failed, restoring snapshot");
            self.restore_snapshot(&snapshot_record, snapshot_file).await;
            return Err(err);
        }

        info!(domain = %updated.domain, id = updated.id, "virtual host updated");
        Ok(updated)
    }

    /// Puts the pre-update definition and registry fields back. Best effort:
    /// failures here are logged loudly, the original error still surfaces.
    async fn restore_snapshot(&self, snapshot: &VhostRecord, file: Option<String>) {
        match file {
            Some(text) => {
                if let Err(e) = self.stage_into(&text, &self.config_path(&snapshot.domain)).await {
                    warn!(domain = %snapshot.domain, error = %e, "could not restore site definition");
                }
            }
            None => {
                self.remove_config_files(&snapshot.domain).await;
            }
        }
        let restore = VhostUpdate {
            document_root: Some(snapshot.document_root.clone()),
            php_version: Some(snapshot.php_version.clone()),
            ssl_enabled: Some(snapshot.ssl_enabled),
            status: Some(snapshot.status),
            nginx_config: Some(snapshot.nginx_config.clone()),
            custom_config: Some(snapshot.custom_config.clone()),
        };
        if let Err(e) = self.registry.update_vhost(snapshot.id, restore).await {
            warn!(domain = %snapshot.domain, error = %e, "could not restore registry fields");
        }
    }

    // ==========================================================================
    // 3. Delete: serving configuration only, tenant data untouched
    // ==========================================================================

    pub async fn delete(&self, id: u64) -> Result<()> {
        let current = self
            .registry
            .find_vhost(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("virtual host {}", id)))?;

        let config_path = self.config_path(&current.domain);
        let enabled_path = self.enabled_path(&current.domain);
        let has_config = fs::symlink_metadata(&config_path).await.is_ok();
        let has_link = fs::symlink_metadata(&enabled_path).await.is_ok();

        let _gate = self.reload_gate.acquire().await;
        if has_config || has_link {
            let enabled = enabled_path.to_string_lossy().into_owned();
            let config = config_path.to_string_lossy().into_owned();
            // One invocation for both paths: either the serving config goes
            // away entirely or the registry record stays.
            self.executor
                .run("rm", &["-f", &enabled, &config], self.deadline())
                .await?;
        }

        // A failing self-test here is pre-existing breakage in some other
        // site's definition; removal of this one still stands.
        match self.self_test().await {
            Ok(()) => {
                if let Err(e) = self.reload().await {
                    warn!(domain = %current.domain, error = %e, "reload after removal failed");
                }
            }
            Err(e) => {
                warn!(domain = %current.domain, error = %e, "self-test failed after removal; skipping reload");
            }
        }

        self.registry.delete_vhost(id).await?;
        info!(domain = %current.domain, id, "virtual host deprovisioned");
        Ok(())
    }
}
