// agent/src/server.rs

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::registry::{CertificateRecord, Registry, SystemUserRecord, VhostRecord};
use crate::sys::exec::CommandExecutor;
use crate::sys::locks::{ClaimTable, ReloadGate, ResourceKind};
use crate::sys::ssl::{CertificateIssuer, EnableTlsRequest};
use crate::sys::users::{CreateUserRequest, SystemUserProvisioner, UpdateUserRequest};
use crate::sys::vhost::{CreateVhostRequest, UpdateVhostRequest, VirtualHostProvisioner};

// ==============================================================================
// 1. Wire types: the thin collaborator boundary
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Get,
    List,
    EnableTls,
    RenewCertificate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    SystemUser,
    VirtualHost,
    Certificate,
}

#[derive(Debug, Deserialize)]
pub struct OperationRequest {
    pub operation: Operation,
    pub entity_type: EntityType,
    #[serde(default)]
    pub entity_id: Option<u64>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct FailureBody {
    pub kind: &'static str,
    pub message: String,
    /// Captured external-tool output, verbatim, when the failure carries any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// For persistence failures: whether the compensating action succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensated: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureBody>,
}

impl OperationOutcome {
    fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    fn failure(err: &AgentError) -> Self {
        let mut message = err.to_string();
        let mut compensated = None;
        if let AgentError::Persistence { compensation: Some(c), .. } = err {
            compensated = Some(c.succeeded);
            message.push_str(&format!("; compensation ({}): {}", c.attempted, c.detail));
        }
        Self {
            success: false,
            data: None,
            error: Some(FailureBody {
                kind: err.kind(),
                message,
                output: err.captured_output(),
                compensated,
            }),
        }
    }
}

/// Entity views mirror what the control plane renders: the entity plus its
/// related records, attached.
#[derive(Debug, Serialize)]
struct UserView {
    #[serde(flatten)]
    user: SystemUserRecord,
    vhosts: Vec<VhostRecord>,
}

#[derive(Debug, Serialize)]
struct VhostView {
    #[serde(flatten)]
    vhost: VhostRecord,
    system_user: Option<SystemUserRecord>,
    ssl_certificate: Option<CertificateRecord>,
}

// ==============================================================================
// 2. The orchestrating service
// ==============================================================================

pub struct ArborAgentService {
    registry: Arc<dyn Registry>,
    pub(crate) claims: Arc<ClaimTable>,
    users: SystemUserProvisioner,
    vhosts: Arc<VirtualHostProvisioner>,
    certificates: CertificateIssuer,
}

impl ArborAgentService {
    pub fn new(
        config: AgentConfig,
        registry: Arc<dyn Registry>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        // One gate: the web-server reload is a single global resource.
        let reload_gate = ReloadGate::new();
        let vhosts = Arc::new(VirtualHostProvisioner::new(
            config.clone(),
            executor.clone(),
            registry.clone(),
            reload_gate,
        ));
        let users = SystemUserProvisioner::new(
            config.clone(),
            executor.clone(),
            registry.clone(),
            vhosts.clone(),
        );
        let certificates =
            CertificateIssuer::new(config, executor, registry.clone(), vhosts.clone());
        Self {
            registry,
            claims: ClaimTable::new(),
            users,
            vhosts,
            certificates,
        }
    }

    pub async fn handle(&self, request: OperationRequest) -> OperationOutcome {
        match self.dispatch(request).await {
            Ok(data) => OperationOutcome::ok(data),
            Err(err) => {
                warn!(error = %err, kind = err.kind(), "operation failed");
                OperationOutcome::failure(&err)
            }
        }
    }

    async fn dispatch(&self, request: OperationRequest) -> Result<Value> {
        use EntityType::*;
        use Operation::*;

        match (request.operation, request.entity_type) {
            // --- system users ---
            (Create, SystemUser) => {
                let req: CreateUserRequest = parse_payload(request.payload)?;
                let _claim = self.claims.claim(ResourceKind::SystemUser, &req.username)?;
                let user = self.users.create(req).await?;
                self.user_view(user).await
            }
            (Update, SystemUser) => {
                let id = require_id(request.entity_id)?;
                let req: UpdateUserRequest = parse_payload(request.payload)?;
                let user = self.require_user(id).await?;
                let _claim = self.claims.claim(ResourceKind::SystemUser, &user.username)?;
                let user = self.users.update(id, req).await?;
                self.user_view(user).await
            }
            (Delete, SystemUser) => {
                let id = require_id(request.entity_id)?;
                let user = self.require_user(id).await?;
                let _claim = self.claims.claim(ResourceKind::SystemUser, &user.username)?;
                // The cascade touches every owned domain; claim them all up
                // front so no concurrent vhost operation interleaves.
                let mut _domain_claims = Vec::new();
                for vhost in self.registry.vhosts_owned_by(id).await? {
                    _domain_claims
                        .push(self.claims.claim(ResourceKind::VirtualHost, &vhost.domain)?);
                }
                self.users.delete(id).await?;
                Ok(json!({ "message": "system user deleted" }))
            }
            (Get, SystemUser) => {
                let id = require_id(request.entity_id)?;
                let user = self.require_user(id).await?;
                self.user_view(user).await
            }
            (List, SystemUser) => {
                let mut views = Vec::new();
                for user in self.registry.list_users().await? {
                    views.push(self.user_view(user).await?);
                }
                Ok(Value::Array(views))
            }

            // --- virtual hosts ---
            (Create, VirtualHost) => {
                let req: CreateVhostRequest = parse_payload(request.payload)?;
                let _claim = self.claims.claim(ResourceKind::VirtualHost, &req.domain)?;
                let vhost = self.vhosts.create(req).await?;
                self.vhost_view(vhost).await
            }
            (Update, VirtualHost) => {
                let id = require_id(request.entity_id)?;
                let req: UpdateVhostRequest = parse_payload(request.payload)?;
                let vhost = self.require_vhost(id).await?;
                let _claim = self.claims.claim(ResourceKind::VirtualHost, &vhost.domain)?;
                let vhost = self.vhosts.update(id, req).await?;
                self.vhost_view(vhost).await
            }
            (Delete, VirtualHost) => {
                let id = require_id(request.entity_id)?;
                let vhost = self.require_vhost(id).await?;
                let _claim = self.claims.claim(ResourceKind::VirtualHost, &vhost.domain)?;
                self.vhosts.delete(id).await?;
                Ok(json!({ "message": "virtual host deleted" }))
            }
            (Get, VirtualHost) => {
                let id = require_id(request.entity_id)?;
                let vhost = self.require_vhost(id).await?;
                self.vhost_view(vhost).await
            }
            (List, VirtualHost) => {
                let mut views = Vec::new();
                for vhost in self.registry.list_vhosts().await? {
                    views.push(self.vhost_view(vhost).await?);
                }
                Ok(Value::Array(views))
            }
            (EnableTls, VirtualHost) => {
                let id = require_id(request.entity_id)?;
                let req: EnableTlsRequest = parse_payload(request.payload)?;
                let vhost = self.require_vhost(id).await?;
                let _claim = self.claims.claim(ResourceKind::VirtualHost, &vhost.domain)?;
                let (vhost, _) = self.certificates.issue(id, req).await?;
                self.vhost_view(vhost).await
            }
            (RenewCertificate, VirtualHost) => {
                let id = require_id(request.entity_id)?;
                let vhost = self.require_vhost(id).await?;
                let _claim = self.claims.claim(ResourceKind::VirtualHost, &vhost.domain)?;
                let certificate = self.certificates.renew(id).await?;
                serialize(certificate)
            }

            // --- certificates ---
            (Get, Certificate) => {
                let id = require_id(request.entity_id)?;
                let certificate = self.require_certificate(id).await?;
                serialize(certificate)
            }
            (List, Certificate) => serialize(self.registry.list_certificates().await?),
            (RenewCertificate, Certificate) => {
                let id = require_id(request.entity_id)?;
                let certificate = self.require_certificate(id).await?;
                let vhost = self.require_vhost(certificate.vhost_id).await?;
                let _claim = self.claims.claim(ResourceKind::VirtualHost, &vhost.domain)?;
                let certificate = self.certificates.renew(certificate.vhost_id).await?;
                serialize(certificate)
            }
            (Delete, Certificate) => {
                let id = require_id(request.entity_id)?;
                let certificate = self.require_certificate(id).await?;
                let vhost = self.require_vhost(certificate.vhost_id).await?;
                let _claim = self.claims.claim(ResourceKind::VirtualHost, &vhost.domain)?;
                let vhost = self.certificates.detach(certificate.vhost_id).await?;
                self.vhost_view(vhost).await
            }

            (op, entity) => Err(AgentError::Validation(format!(
                "operation {:?} is not supported for {:?}",
                op, entity
            ))),
        }
    }

    async fn require_user(&self, id: u64) -> Result<SystemUserRecord> {
        self.registry
            .find_user(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("system user {}", id)))
    }

    async fn require_vhost(&self, id: u64) -> Result<VhostRecord> {
        self.registry
            .find_vhost(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("virtual host {}", id)))
    }

    async fn require_certificate(&self, id: u64) -> Result<CertificateRecord> {
        self.registry
            .find_certificate(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("certificate {}", id)))
    }

    async fn user_view(&self, user: SystemUserRecord) -> Result<Value> {
        let vhosts = self.registry.vhosts_owned_by(user.id).await?;
        serialize(UserView { user, vhosts })
    }

    async fn vhost_view(&self, vhost: VhostRecord) -> Result<Value> {
        let system_user = self.registry.find_user(vhost.system_user_id).await?;
        let ssl_certificate = self.registry.find_certificate_for_vhost(vhost.id).await?;
        serialize(VhostView { vhost, system_user, ssl_certificate })
    }
}

fn serialize<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| AgentError::Persistence {
        message: format!("could not serialize response: {}", e),
        compensation: None,
    })
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Option<Value>) -> Result<T> {
    let value = payload
        .ok_or_else(|| AgentError::Validation("payload is required for this operation".into()))?;
    serde_json::from_value(value)
        .map_err(|e| AgentError::Validation(format!("invalid payload: {}", e)))
}

fn require_id(entity_id: Option<u64>) -> Result<u64> {
    entity_id
        .ok_or_else(|| AgentError::Validation("entity_id is required for this operation".into()))
}

// ==============================================================================
// 3. Connection handling: newline-delimited JSON frames
// ==============================================================================

/// Serves one accepted connection. The caller has already spawned us onto a
/// dedicated task, so blocking provisioning sequences never stall the
/// accept loop; the control plane opens a connection per request.
pub async fn handle_connection(
    service: Arc<ArborAgentService>,
    stream: UnixStream,
    expected_api_uid: u32,
) {
    // 🛡️ SECURITY BOUNDARY: SO_PEERCRED: only root and the control-plane
    // API account may drive this agent, socket permissions notwithstanding.
    match stream.peer_cred() {
        Ok(cred) if cred.uid() == 0 || cred.uid() == expected_api_uid => {}
        Ok(cred) => {
            warn!(peer_uid = cred.uid(), "rejected connection from unexpected UID");
            return;
        }
        Err(e) => {
            warn!(error = %e, "could not read peer credentials; dropping connection");
            return;
        }
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<OperationRequest>(&line) {
            Ok(request) => {
                info!(raw = %line, "operation received");
                service.handle(request).await
            }
            Err(e) => OperationOutcome::failure(&AgentError::Validation(format!(
                "malformed request frame: {}",
                e
            ))),
        };

        let mut frame = serde_json::to_string(&outcome)
            .unwrap_or_else(|_| r#"{"success":false}"#.to_string());
        frame.push('\n');
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
}
