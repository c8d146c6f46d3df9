// agent/src/testutil.rs
//
// Shared test doubles. `FakeHost` stands in for the privileged executor:
// it records every argv it is handed (so tests can audit exactly which
// commands a sequence issued) and applies the file-layout effects of
// mkdir/mv/ln/rm inside a sandbox so rollback assertions run against a
// real filesystem. Account, web-server, and CA commands are no-ops unless
// a failure has been scripted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::registry::{
    CertificateRecord, FileRegistry, NewCertificate, NewSystemUser, NewVhost, Registry,
    SystemUserRecord, SystemUserUpdate, VhostRecord, VhostUpdate,
};
use crate::sys::exec::{CommandExecutor, CommandOutput};

pub struct FakeHost {
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, i32, String)>>,
    stdout_scripts: Mutex<HashMap<String, String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            stdout_scripts: Mutex::new(HashMap::new()),
        })
    }

    /// Any subsequent command whose rendered argv contains `needle` fails
    /// with exit 1 and the given stderr.
    pub fn fail_on(&self, needle: &str, stderr: &str) {
        self.fail_with(needle, 1, stderr);
    }

    /// Same, with a specific exit code (e.g. userdel's 6 for "no such user").
    pub fn fail_with(&self, needle: &str, exit_code: i32, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), exit_code, stderr.to_string()));
    }

    /// Scripted stdout for a matching successful command.
    pub fn stdout_for(&self, needle: &str, stdout: &str) {
        self.stdout_scripts
            .lock()
            .unwrap()
            .insert(needle.to_string(), stdout.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    fn apply_effects(&self, program: &str, args: &[&str]) -> std::io::Result<()> {
        match program {
            "mkdir" => {
                // mkdir -p <path>
                if let Some(path) = args.iter().find(|a| !a.starts_with('-')) {
                    std::fs::create_dir_all(path)?;
                }
            }
            "mv" => {
                if args.len() == 2 {
                    std::fs::rename(args[0], args[1])?;
                }
            }
            "ln" => {
                // ln -sfn <target> <link>
                if args.len() == 3 && args[0] == "-sfn" {
                    let _ = std::fs::remove_file(args[2]);
                    std::os::unix::fs::symlink(args[1], args[2])?;
                }
            }
            "rm" => {
                for path in args.iter().filter(|a| !a.starts_with('-')) {
                    let _ = std::fs::remove_file(path);
                }
            }
            // useradd/userdel/chown/chmod/nginx/systemctl/certbot leave no
            // observable trace inside the sandbox
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl CommandExecutor for FakeHost {
    async fn run(&self, program: &str, args: &[&str], _deadline: Duration) -> Result<CommandOutput> {
        let rendered = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        self.calls.lock().unwrap().push(rendered.clone());

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _, _)| rendered.contains(needle.as_str()))
            .cloned();
        if let Some((_, exit_code, stderr)) = failure {
            return Err(AgentError::ExternalCommand {
                program: program.to_string(),
                exit_code,
                stdout: String::new(),
                stderr,
            });
        }

        if let Err(e) = self.apply_effects(program, args) {
            return Err(AgentError::ExternalCommand {
                program: program.to_string(),
                exit_code: 1,
                stdout: String::new(),
                stderr: e.to_string(),
            });
        }

        let stdout = self
            .stdout_scripts
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| rendered.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(CommandOutput { exit_code: 0, stdout, stderr: String::new() })
    }
}

/// A sandboxed host: throwaway directory tree shaped like the real layout,
/// a fake executor, and a registry persisted inside the sandbox.
pub struct Sandbox {
    pub dir: TempDir,
    pub config: AgentConfig,
    pub host: Arc<FakeHost>,
    pub registry: Arc<FileRegistry>,
}

impl Sandbox {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("sandbox tempdir");
        let config = AgentConfig::for_test(dir.path());
        for path in [
            &config.home_root,
            &config.sites_available_dir,
            &config.sites_enabled_dir,
            &config.cert_live_root,
            &config.php_socket_dir,
        ] {
            std::fs::create_dir_all(path).expect("sandbox layout");
        }
        let registry = Arc::new(
            FileRegistry::open(config.state_file.clone())
                .await
                .expect("sandbox registry"),
        );
        Self { dir, config, host: FakeHost::new(), registry }
    }

    pub fn sites_available(&self, domain: &str) -> std::path::PathBuf {
        self.config.sites_available_dir.join(domain)
    }

    pub fn sites_enabled(&self, domain: &str) -> std::path::PathBuf {
        self.config.sites_enabled_dir.join(domain)
    }

    /// Seeds a registered user the way the user provisioner would.
    pub async fn seed_user(&self, name: &str) -> SystemUserRecord {
        self.registry
            .create_user(NewSystemUser {
                username: name.to_string(),
                home_directory: self.config.home_root.join(name),
                shell: "/bin/bash".to_string(),
                ssh_enabled: false,
                ftp_enabled: false,
                description: None,
                created_by: Some("test".to_string()),
            })
            .await
            .expect("seed user")
    }
}

pub fn exists(path: &Path) -> bool {
    // symlink_metadata: an activation symlink counts even if dangling
    std::fs::symlink_metadata(path).is_ok()
}

/// Registry wrapper that fails a scripted subset of writes, for exercising
/// compensation paths.
pub struct FailingRegistry {
    pub inner: Arc<FileRegistry>,
    pub fail_create_user: bool,
}

fn scripted_failure() -> AgentError {
    AgentError::Persistence {
        message: "scripted registry failure".to_string(),
        compensation: None,
    }
}

#[async_trait]
impl Registry for FailingRegistry {
    async fn list_users(&self) -> Result<Vec<SystemUserRecord>> {
        self.inner.list_users().await
    }
    async fn find_user(&self, id: u64) -> Result<Option<SystemUserRecord>> {
        self.inner.find_user(id).await
    }
    async fn username_exists(&self, username: &str) -> Result<bool> {
        self.inner.username_exists(username).await
    }
    async fn create_user(&self, user: NewSystemUser) -> Result<SystemUserRecord> {
        if self.fail_create_user {
            return Err(scripted_failure());
        }
        self.inner.create_user(user).await
    }
    async fn update_user(&self, id: u64, changes: SystemUserUpdate) -> Result<SystemUserRecord> {
        self.inner.update_user(id, changes).await
    }
    async fn delete_user(&self, id: u64) -> Result<()> {
        self.inner.delete_user(id).await
    }
    async fn list_vhosts(&self) -> Result<Vec<VhostRecord>> {
        self.inner.list_vhosts().await
    }
    async fn find_vhost(&self, id: u64) -> Result<Option<VhostRecord>> {
        self.inner.find_vhost(id).await
    }
    async fn find_vhost_by_domain(&self, domain: &str) -> Result<Option<VhostRecord>> {
        self.inner.find_vhost_by_domain(domain).await
    }
    async fn domain_exists(&self, domain: &str) -> Result<bool> {
        self.inner.domain_exists(domain).await
    }
    async fn vhosts_owned_by(&self, user_id: u64) -> Result<Vec<VhostRecord>> {
        self.inner.vhosts_owned_by(user_id).await
    }
    async fn create_vhost(&self, vhost: NewVhost) -> Result<VhostRecord> {
        self.inner.create_vhost(vhost).await
    }
    async fn update_vhost(&self, id: u64, changes: VhostUpdate) -> Result<VhostRecord> {
        self.inner.update_vhost(id, changes).await
    }
    async fn delete_vhost(&self, id: u64) -> Result<()> {
        self.inner.delete_vhost(id).await
    }
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        self.inner.list_certificates().await
    }
    async fn find_certificate(&self, id: u64) -> Result<Option<CertificateRecord>> {
        self.inner.find_certificate(id).await
    }
    async fn find_certificate_for_vhost(&self, vhost_id: u64) -> Result<Option<CertificateRecord>> {
        self.inner.find_certificate_for_vhost(vhost_id).await
    }
    async fn attach_certificate(
        &self,
        vhost_id: u64,
        cert: NewCertificate,
        nginx_config: String,
    ) -> Result<(VhostRecord, CertificateRecord)> {
        self.inner.attach_certificate(vhost_id, cert, nginx_config).await
    }
    async fn detach_certificate(&self, vhost_id: u64, nginx_config: String) -> Result<VhostRecord> {
        self.inner.detach_certificate(vhost_id, nginx_config).await
    }
    async fn record_renewal(
        &self,
        vhost_id: u64,
        expires_at: chrono::DateTime<chrono::Utc>,
        log_entry: &str,
    ) -> Result<CertificateRecord> {
        self.inner.record_renewal(vhost_id, expires_at, log_entry).await
    }
}
