// agent/src/registry/file.rs

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::registry::{
    CertificateRecord, NewCertificate, NewSystemUser, NewVhost, Registry, SystemUserRecord,
    SystemUserUpdate, VhostRecord, VhostUpdate,
};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RegistryState {
    next_user_id: u64,
    next_vhost_id: u64,
    next_certificate_id: u64,
    users: Vec<SystemUserRecord>,
    vhosts: Vec<VhostRecord>,
    certificates: Vec<CertificateRecord>,
}

/// Single-document JSON store. The whole inventory is small (one host's
/// tenants), so every mutation clones the state, applies the change, makes
/// it durable, and only then replaces the in-memory copy: a failed write
/// leaves both the file and the process state untouched.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    state: RwLock<RegistryState>,
}

fn persistence(message: impl std::fmt::Display) -> AgentError {
    AgentError::Persistence { message: message.to_string(), compensation: None }
}

impl FileRegistry {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| persistence(format!("corrupt registry file {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryState::default(),
            Err(e) => {
                return Err(persistence(format!("cannot read registry file {}: {}", path.display(), e)));
            }
        };
        Ok(Self { path, state: RwLock::new(state) })
    }

    /// Durable write: stage next to the target, tighten permissions, then
    /// atomically rename over the old document.
    async fn persist(&self, state: &RegistryState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(persistence)?;
        }

        let staged = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(state).map_err(persistence)?;
        fs::write(&staged, raw).await.map_err(persistence)?;

        let mut perms = fs::metadata(&staged).await.map_err(persistence)?.permissions();
        perms.set_mode(0o600); // rw------- : inventory is root's business
        fs::set_permissions(&staged, perms).await.map_err(persistence)?;

        fs::rename(&staged, &self.path).await.map_err(persistence)
    }

    /// Clone-mutate-persist-swap. `apply` returns whatever the caller needs
    /// back out of the mutated state.
    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut RegistryState) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let out = apply(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }
}

fn user_not_found(id: u64) -> AgentError {
    AgentError::NotFound(format!("system user {}", id))
}

fn vhost_not_found(id: u64) -> AgentError {
    AgentError::NotFound(format!("virtual host {}", id))
}

#[async_trait]
impl Registry for FileRegistry {
    // --- system users ---

    async fn list_users(&self) -> Result<Vec<SystemUserRecord>> {
        Ok(self.state.read().await.users.clone())
    }

    async fn find_user(&self, id: u64) -> Result<Option<SystemUserRecord>> {
        Ok(self.state.read().await.users.iter().find(|u| u.id == id).cloned())
    }

    async fn username_exists(&self, username: &str) -> Result<bool> {
        Ok(self.state.read().await.users.iter().any(|u| u.username == username))
    }

    async fn create_user(&self, user: NewSystemUser) -> Result<SystemUserRecord> {
        self.mutate(|state| {
            if state.users.iter().any(|u| u.username == user.username) {
                return Err(AgentError::Validation(format!(
                    "username '{}' already registered",
                    user.username
                )));
            }
            state.next_user_id += 1;
            let now = Utc::now();
            let record = SystemUserRecord {
                id: state.next_user_id,
                username: user.username,
                home_directory: user.home_directory,
                shell: user.shell,
                ssh_enabled: user.ssh_enabled,
                ftp_enabled: user.ftp_enabled,
                description: user.description,
                created_by: user.created_by,
                created_at: now,
                updated_at: now,
            };
            state.users.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn update_user(&self, id: u64, changes: SystemUserUpdate) -> Result<SystemUserRecord> {
        self.mutate(|state| {
            let user = state
                .users
                .iter_mut()
                .find(|u| u.id == id)
                .ok_or_else(|| user_not_found(id))?;
            if let Some(description) = changes.description {
                user.description = description;
            }
            if let Some(ssh) = changes.ssh_enabled {
                user.ssh_enabled = ssh;
            }
            if let Some(ftp) = changes.ftp_enabled {
                user.ftp_enabled = ftp;
            }
            user.updated_at = Utc::now();
            Ok(user.clone())
        })
        .await
    }

    async fn delete_user(&self, id: u64) -> Result<()> {
        self.mutate(|state| {
            if !state.users.iter().any(|u| u.id == id) {
                return Err(user_not_found(id));
            }
            // Cascade inside the same durable write: no dangling ownership.
            let owned: Vec<u64> = state
                .vhosts
                .iter()
                .filter(|v| v.system_user_id == id)
                .map(|v| v.id)
                .collect();
            state.certificates.retain(|c| !owned.contains(&c.vhost_id));
            state.vhosts.retain(|v| v.system_user_id != id);
            state.users.retain(|u| u.id != id);
            Ok(())
        })
        .await
    }

    // --- virtual hosts ---

    async fn list_vhosts(&self) -> Result<Vec<VhostRecord>> {
        Ok(self.state.read().await.vhosts.clone())
    }

    async fn find_vhost(&self, id: u64) -> Result<Option<VhostRecord>> {
        Ok(self.state.read().await.vhosts.iter().find(|v| v.id == id).cloned())
    }

    async fn find_vhost_by_domain(&self, domain: &str) -> Result<Option<VhostRecord>> {
        Ok(self
            .state
            .read()
            .await
            .vhosts
            .iter()
            .find(|v| v.domain == domain)
            .cloned())
    }

    async fn domain_exists(&self, domain: &str) -> Result<bool> {
        Ok(self.state.read().await.vhosts.iter().any(|v| v.domain == domain))
    }

    async fn vhosts_owned_by(&self, user_id: u64) -> Result<Vec<VhostRecord>> {
        Ok(self
            .state
            .read()
            .await
            .vhosts
            .iter()
            .filter(|v| v.system_user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_vhost(&self, vhost: NewVhost) -> Result<VhostRecord> {
        self.mutate(|state| {
            if state.vhosts.iter().any(|v| v.domain == vhost.domain) {
                return Err(AgentError::Validation(format!(
                    "domain '{}' already registered",
                    vhost.domain
                )));
            }
            if !state.users.iter().any(|u| u.id == vhost.system_user_id) {
                return Err(user_not_found(vhost.system_user_id));
            }
            state.next_vhost_id += 1;
            let now = Utc::now();
            let record = VhostRecord {
                id: state.next_vhost_id,
                domain: vhost.domain,
                document_root: vhost.document_root,
                system_user_id: vhost.system_user_id,
                php_version: vhost.php_version,
                ssl_enabled: vhost.ssl_enabled,
                status: vhost.status,
                nginx_config: vhost.nginx_config,
                custom_config: vhost.custom_config,
                created_at: now,
                updated_at: now,
            };
            state.vhosts.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn update_vhost(&self, id: u64, changes: VhostUpdate) -> Result<VhostRecord> {
        self.mutate(|state| {
            let vhost = state
                .vhosts
                .iter_mut()
                .find(|v| v.id == id)
                .ok_or_else(|| vhost_not_found(id))?;
            if let Some(document_root) = changes.document_root {
                vhost.document_root = document_root;
            }
            if let Some(php_version) = changes.php_version {
                vhost.php_version = php_version;
            }
            if let Some(ssl) = changes.ssl_enabled {
                vhost.ssl_enabled = ssl;
            }
            if let Some(status) = changes.status {
                vhost.status = status;
            }
            if let Some(nginx_config) = changes.nginx_config {
                vhost.nginx_config = nginx_config;
            }
            if let Some(custom_config) = changes.custom_config {
                vhost.custom_config = custom_config;
            }
            vhost.updated_at = Utc::now();
            Ok(vhost.clone())
        })
        .await
    }

    async fn delete_vhost(&self, id: u64) -> Result<()> {
        self.mutate(|state| {
            if !state.vhosts.iter().any(|v| v.id == id) {
                return Err(vhost_not_found(id));
            }
            state.certificates.retain(|c| c.vhost_id != id);
            state.vhosts.retain(|v| v.id != id);
            Ok(())
        })
        .await
    }

    // --- certificates ---

    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        Ok(self.state.read().await.certificates.clone())
    }

    async fn find_certificate(&self, id: u64) -> Result<Option<CertificateRecord>> {
        Ok(self
            .state
            .read()
            .await
            .certificates
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn find_certificate_for_vhost(&self, vhost_id: u64) -> Result<Option<CertificateRecord>> {
        Ok(self
            .state
            .read()
            .await
            .certificates
            .iter()
            .find(|c| c.vhost_id == vhost_id)
            .cloned())
    }

    async fn attach_certificate(
        &self,
        vhost_id: u64,
        cert: NewCertificate,
        nginx_config: String,
    ) -> Result<(VhostRecord, CertificateRecord)> {
        self.mutate(|state| {
            if state.certificates.iter().any(|c| c.vhost_id == vhost_id) {
                return Err(AgentError::Validation(format!(
                    "virtual host {} already has a live certificate",
                    vhost_id
                )));
            }
            let vhost = state
                .vhosts
                .iter_mut()
                .find(|v| v.id == vhost_id)
                .ok_or_else(|| vhost_not_found(vhost_id))?;

            let now = Utc::now();
            vhost.ssl_enabled = true;
            vhost.nginx_config = Some(nginx_config);
            vhost.updated_at = now;
            let vhost = vhost.clone();

            state.next_certificate_id += 1;
            let record = CertificateRecord {
                id: state.next_certificate_id,
                vhost_id,
                cert_path: cert.cert_path,
                key_path: cert.key_path,
                chain_path: cert.chain_path,
                expires_at: cert.expires_at,
                auto_renew: cert.auto_renew,
                last_renewed_at: None,
                renewal_log: cert.renewal_log,
                created_at: now,
                updated_at: now,
            };
            state.certificates.push(record.clone());
            Ok((vhost, record))
        })
        .await
    }

    async fn detach_certificate(&self, vhost_id: u64, nginx_config: String) -> Result<VhostRecord> {
        self.mutate(|state| {
            if !state.certificates.iter().any(|c| c.vhost_id == vhost_id) {
                return Err(AgentError::NotFound(format!(
                    "certificate for virtual host {}",
                    vhost_id
                )));
            }
            let vhost = state
                .vhosts
                .iter_mut()
                .find(|v| v.id == vhost_id)
                .ok_or_else(|| vhost_not_found(vhost_id))?;
            vhost.ssl_enabled = false;
            vhost.nginx_config = Some(nginx_config);
            vhost.updated_at = Utc::now();
            let vhost = vhost.clone();
            state.certificates.retain(|c| c.vhost_id != vhost_id);
            Ok(vhost)
        })
        .await
    }

    async fn record_renewal(
        &self,
        vhost_id: u64,
        expires_at: DateTime<Utc>,
        log_entry: &str,
    ) -> Result<CertificateRecord> {
        self.mutate(|state| {
            let cert = state
                .certificates
                .iter_mut()
                .find(|c| c.vhost_id == vhost_id)
                .ok_or_else(|| {
                    AgentError::NotFound(format!("certificate for virtual host {}", vhost_id))
                })?;
            let now = Utc::now();
            cert.expires_at = expires_at;
            cert.last_renewed_at = Some(now);
            cert.renewal_log = Some(match cert.renewal_log.take() {
                Some(mut log) => {
                    log.push('\n');
                    log.push_str(log_entry);
                    log
                }
                None => log_entry.to_string(),
            });
            cert.updated_at = now;
            Ok(cert.clone())
        })
        .await
    }
}
