// agent/src/registry/mod.rs
//
// The persisted inventory of provisioned resources. Entities are plain
// data-transfer structs; storage goes through the `Registry` trait so the
// provisioners never touch persistence mechanics (and tests can inject
// failing stores to exercise compensation paths).

pub mod file;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::FileRegistry;

// ==============================================================================
// 1. Records
// ==============================================================================

/// One OS account managed by the panel. `username` and `home_directory` are
/// immutable after creation: the name maps 1:1 to the OS account and the
/// home directory is derived from it, never chosen independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemUserRecord {
    pub id: u64,
    pub username: String,
    pub home_directory: PathBuf,
    pub shell: String,
    pub ssh_enabled: bool,
    pub ftp_enabled: bool,
    pub description: Option<String>,
    /// Opaque reference to whoever requested the account (control-plane side)
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VhostStatus {
    /// Exists in the registry but the site is not live yet (mid-create)
    Pending,
    Active,
    Inactive,
    Maintenance,
}

impl std::fmt::Display for VhostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VhostStatus::Pending => "pending",
            VhostStatus::Active => "active",
            VhostStatus::Inactive => "inactive",
            VhostStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// A served site. `domain` and `system_user_id` never change after creation;
/// a vhost cannot outlive its owning account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VhostRecord {
    pub id: u64,
    pub domain: String,
    pub document_root: PathBuf,
    pub system_user_id: u64,
    pub php_version: String,
    pub ssl_enabled: bool,
    pub status: VhostStatus,
    /// Cached rendering of the live site definition
    pub nginx_config: Option<String>,
    pub custom_config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// TLS material reference for exactly one vhost. Its existence implies
/// `ssl_enabled == true` on the owning record: the two are committed
/// together (`attach_certificate`) or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: u64,
    pub vhost_id: u64,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub chain_path: PathBuf,
    pub expires_at: DateTime<Utc>,
    pub auto_renew: bool,
    pub last_renewed_at: Option<DateTime<Utc>>,
    pub renewal_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ==============================================================================
// 2. Mutation inputs
// ==============================================================================

#[derive(Debug, Clone)]
pub struct NewSystemUser {
    pub username: String,
    pub home_directory: PathBuf,
    pub shell: String,
    pub ssh_enabled: bool,
    pub ftp_enabled: bool,
    pub description: Option<String>,
    pub created_by: Option<String>,
}

/// Non-identity fields only; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SystemUserUpdate {
    pub description: Option<Option<String>>,
    pub ssh_enabled: Option<bool>,
    pub ftp_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewVhost {
    pub domain: String,
    pub document_root: PathBuf,
    pub system_user_id: u64,
    pub php_version: String,
    pub ssl_enabled: bool,
    pub status: VhostStatus,
    pub nginx_config: Option<String>,
    pub custom_config: Option<String>,
}

/// `None` leaves a field unchanged; the double `Option` distinguishes
/// "don't touch" from "clear".
#[derive(Debug, Clone, Default)]
pub struct VhostUpdate {
    pub document_root: Option<PathBuf>,
    pub php_version: Option<String>,
    pub ssl_enabled: Option<bool>,
    pub status: Option<VhostStatus>,
    pub nginx_config: Option<Option<String>>,
    pub custom_config: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub chain_path: PathBuf,
    pub expires_at: DateTime<Utc>,
    pub auto_renew: bool,
    pub renewal_log: Option<String>,
}

// ==============================================================================
// 3. Repository seam
// ==============================================================================

/// Inventory access for the three entity types. Writes are durable before
/// the call returns; cascades (user → vhosts → certificates) happen inside
/// one durable mutation so the stored document never holds a dangling
/// reference.
#[async_trait]
pub trait Registry: Send + Sync {
    // --- system users ---
    async fn list_users(&self) -> Result<Vec<SystemUserRecord>>;
    async fn find_user(&self, id: u64) -> Result<Option<SystemUserRecord>>;
    async fn username_exists(&self, username: &str) -> Result<bool>;
    async fn create_user(&self, user: NewSystemUser) -> Result<SystemUserRecord>;
    async fn update_user(&self, id: u64, changes: SystemUserUpdate) -> Result<SystemUserRecord>;
    async fn delete_user(&self, id: u64) -> Result<()>;

    // --- virtual hosts ---
    async fn list_vhosts(&self) -> Result<Vec<VhostRecord>>;
    async fn find_vhost(&self, id: u64) -> Result<Option<VhostRecord>>;
    async fn find_vhost_by_domain(&self, domain: &str) -> Result<Option<VhostRecord>>;
    async fn domain_exists(&self, domain: &str) -> Result<bool>;
    async fn vhosts_owned_by(&self, user_id: u64) -> Result<Vec<VhostRecord>>;
    async fn create_vhost(&self, vhost: NewVhost) -> Result<VhostRecord>;
    async fn update_vhost(&self, id: u64, changes: VhostUpdate) -> Result<VhostRecord>;
    async fn delete_vhost(&self, id: u64) -> Result<()>;

    // --- certificates ---
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>>;
    async fn find_certificate(&self, id: u64) -> Result<Option<CertificateRecord>>;
    async fn find_certificate_for_vhost(&self, vhost_id: u64) -> Result<Option<CertificateRecord>>;

    /// Sets `ssl_enabled`, stores the TLS rendering, and inserts the
    /// certificate record in one durable write.
    async fn attach_certificate(
        &self,
        vhost_id: u64,
        cert: NewCertificate,
        nginx_config: String,
    ) -> Result<(VhostRecord, CertificateRecord)>;

    /// Removes the certificate record and clears `ssl_enabled` in one
    /// durable write.
    async fn detach_certificate(&self, vhost_id: u64, nginx_config: String) -> Result<VhostRecord>;

    /// Bumps expiry/renewal bookkeeping after a successful renewal.
    async fn record_renewal(
        &self,
        vhost_id: u64,
        expires_at: DateTime<Utc>,
        log_entry: &str,
    ) -> Result<CertificateRecord>;
}
