// agent/src/sys/ssl.rs
//
// Certificate issuance through the external ACME client. The client owns
// the key material end to end: this module never reads a private key, it
// only records where certbot put things and keeps the served configuration
// in step with the TLS state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::registry::{CertificateRecord, NewCertificate, Registry, VhostRecord};
use crate::sys::exec::CommandExecutor;
use crate::sys::vhost::VirtualHostProvisioner;

/// CA-issued certificates run on a 90-day clock.
const CERT_LIFETIME_DAYS: u64 = 90;

#[derive(Debug, Clone, Deserialize)]
pub struct EnableTlsRequest {
    /// Contact identifier handed to the certificate authority
    pub email: String,
}

fn validate_email(email: &str) -> Result<()> {
    let re = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    if !re.is_match(email) {
        return Err(AgentError::Validation(format!(
            "'{}' is not a valid contact email",
            email
        )));
    }
    Ok(())
}

pub struct CertificateIssuer {
    config: AgentConfig,
    executor: Arc<dyn CommandExecutor>,
    registry: Arc<dyn Registry>,
    vhosts: Arc<VirtualHostProvisioner>,
}

impl CertificateIssuer {
    pub fn new(
        config: AgentConfig,
        executor: Arc<dyn CommandExecutor>,
        registry: Arc<dyn Registry>,
        vhosts: Arc<VirtualHostProvisioner>,
    ) -> Self {
        Self { config, executor, registry, vhosts }
    }

    fn issuance_deadline(&self) -> Duration {
        Duration::from_secs(self.config.issuance_timeout_secs)
    }

    fn material_paths(&self, domain: &str) -> NewCertificate {
        let live = self.config.cert_live_root.join(domain);
        NewCertificate {
            cert_path: live.join("fullchain.pem"),
            key_path: live.join("privkey.pem"),
            chain_path: live.join("chain.pem"),
            expires_at: Utc::now() + Days::new(CERT_LIFETIME_DAYS),
            auto_renew: true,
            renewal_log: None,
        }
    }

    async fn load_vhost_and_owner(&self, vhost_id: u64) -> Result<(VhostRecord, String)> {
        let vhost = self
            .registry
            .find_vhost(vhost_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("virtual host {}", vhost_id)))?;
        let owner = self
            .registry
            .find_user(vhost.system_user_id)
            .await?
            .ok_or_else(|| {
                AgentError::NotFound(format!("system user {}", vhost.system_user_id))
            })?;
        Ok((vhost, owner.username))
    }

    /// Rewrites the served definition for `vhost` with the given TLS shape
    /// and verifies it, restoring the snapshot if the self-test refuses.
    /// Returns the rendering that is now live.
    async fn apply_tls_shape(
        &self,
        vhost: &VhostRecord,
        owner: &str,
        tls_enabled: bool,
    ) -> Result<String> {
        let config_text = self.vhosts.render_record(vhost, owner, tls_enabled);
        let snapshot = self.vhosts.read_config(&vhost.domain).await?;

        let _gate = self.vhosts.gate().acquire().await;
        let applied = async {
            self.vhosts
                .install_config(&vhost.domain, &config_text, true)
                .await?;
            self.vhosts.self_test().await?;
            self.vhosts.reload().await
        }
        .await;

        if let Err(err) = applied {
            warn!(domain = %vhost.domain, error = %err, "TLS reconfiguration failed, restoring previous definition");
            if let Some(previous) = snapshot {
                if let Err(e) = self
                    .vhosts
                    .install_config(&vhost.domain, &previous, false)
                    .await
                {
                    warn!(domain = %vhost.domain, error = %e, "could not restore previous definition");
                }
            }
            return Err(err);
        }

        Ok(config_text)
    }

    // ==========================================================================
    // 1. Issue: certbot, then the synchronous re-render, then one commit
    // ==========================================================================

    pub async fn issue(
        &self,
        vhost_id: u64,
        req: EnableTlsRequest,
    ) -> Result<(VhostRecord, CertificateRecord)> {
        validate_email(&req.email)?;
        let (vhost, owner) = self.load_vhost_and_owner(vhost_id).await?;

        if self
            .registry
            .find_certificate_for_vhost(vhost_id)
            .await?
            .is_some()
        {
            return Err(AgentError::Validation(format!(
                "virtual host '{}' already has a live certificate",
                vhost.domain
            )));
        }

        // Non-interactive issuance; failures (rate limits included) surface
        // the client's output verbatim for caller-driven retry.
        self.executor
            .run(
                "certbot",
                &[
                    "--nginx",
                    "-d",
                    &vhost.domain,
                    "--email",
                    &req.email,
                    "--agree-tos",
                    "--non-interactive",
                    "--redirect",
                ],
                self.issuance_deadline(),
            )
            .await?;

        // TLS changes the shape of the rendering (two server blocks), so the
        // re-render happens here, synchronously: never from a stale cache.
        let snapshot = self.vhosts.read_config(&vhost.domain).await?;
        let config_text = self.apply_tls_shape(&vhost, &owner, true).await?;

        // ssl_enabled and the certificate record commit together or not at all.
        match self
            .registry
            .attach_certificate(vhost_id, self.material_paths(&vhost.domain), config_text)
            .await
        {
            Ok((vhost, certificate)) => {
                info!(domain = %vhost.domain, expires_at = %certificate.expires_at, "certificate issued");
                Ok((vhost, certificate))
            }
            Err(err) => {
                // The TLS definition is live but the inventory cannot say
                // so; put the previous definition back and report whether
                // that worked.
                let compensation = self.restore_definition(&vhost.domain, snapshot).await;
                Err(AgentError::Persistence {
                    message: format!("certificate commit failed after issuance: {}", err),
                    compensation: Some(compensation),
                })
            }
        }
    }

    /// Best-effort return to a known definition after a failed registry
    /// commit. Outcome travels inside the error payload.
    async fn restore_definition(
        &self,
        domain: &str,
        snapshot: Option<String>,
    ) -> crate::error::Compensation {
        let attempted = format!("restore previous site definition for {}", domain);
        let Some(previous) = snapshot else {
            return crate::error::Compensation {
                attempted,
                succeeded: false,
                detail: "no previous definition to restore".to_string(),
            };
        };
        let _gate = self.vhosts.gate().acquire().await;
        let restored = async {
            self.vhosts.install_config(domain, &previous, false).await?;
            self.vhosts.self_test().await?;
            self.vhosts.reload().await
        }
        .await;
        match restored {
            Ok(()) => crate::error::Compensation {
                attempted,
                succeeded: true,
                detail: "previous definition reinstated".to_string(),
            },
            Err(e) => {
                warn!(domain = %domain, error = %e, "could not reinstate previous definition");
                crate::error::Compensation { attempted, succeeded: false, detail: e.to_string() }
            }
        }
    }

    // ==========================================================================
    // 2. Renew: bookkeeping refresh, configuration shape unchanged
    // ==========================================================================

    pub async fn renew(&self, vhost_id: u64) -> Result<CertificateRecord> {
        let (vhost, _) = self.load_vhost_and_owner(vhost_id).await?;
        if self
            .registry
            .find_certificate_for_vhost(vhost_id)
            .await?
            .is_none()
        {
            return Err(AgentError::NotFound(format!(
                "certificate for virtual host '{}'",
                vhost.domain
            )));
        }

        let output = self
            .executor
            .run(
                "certbot",
                &["renew", "--cert-name", &vhost.domain, "--non-interactive"],
                self.issuance_deadline(),
            )
            .await?;

        let mut log_entry = output.combined();
        if log_entry.is_empty() {
            log_entry = "certificate renewed".to_string();
        }
        let certificate = self
            .registry
            .record_renewal(
                vhost_id,
                Utc::now() + Days::new(CERT_LIFETIME_DAYS),
                &log_entry,
            )
            .await?;

        info!(domain = %vhost.domain, expires_at = %certificate.expires_at, "certificate renewed");
        Ok(certificate)
    }

    // ==========================================================================
    // 3. Detach: back to plain HTTP, key material left to the CA client
    // ==========================================================================

    pub async fn detach(&self, vhost_id: u64) -> Result<VhostRecord> {
        let (vhost, owner) = self.load_vhost_and_owner(vhost_id).await?;
        if self
            .registry
            .find_certificate_for_vhost(vhost_id)
            .await?
            .is_none()
        {
            return Err(AgentError::NotFound(format!(
                "certificate for virtual host '{}'",
                vhost.domain
            )));
        }

        let snapshot = self.vhosts.read_config(&vhost.domain).await?;
        let config_text = self.apply_tls_shape(&vhost, &owner, false).await?;
        match self.registry.detach_certificate(vhost_id, config_text).await {
            Ok(vhost) => {
                info!(domain = %vhost.domain, "certificate detached, serving plain HTTP");
                Ok(vhost)
            }
            Err(err) => {
                let compensation = self.restore_definition(&vhost.domain, snapshot).await;
                Err(AgentError::Persistence {
                    message: format!("certificate detach failed to commit: {}", err),
                    compensation: Some(compensation),
                })
            }
        }
    }
}
