// agent/src/sys/locks.rs
//
// Mutual exclusion for provisioning sequences. Two concurrent requests for
// the same identifier must not both pass the uniqueness check: the first
// claim wins, the second fails immediately with a conflict. Claims are RAII
// guards held for the whole sequence.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    SystemUser,
    VirtualHost,
}

impl ResourceKind {
    fn label(self) -> &'static str {
        match self {
            ResourceKind::SystemUser => "system_user",
            ResourceKind::VirtualHost => "virtual_host",
        }
    }
}

/// In-flight claims keyed by `(resource kind, identifier)`.
#[derive(Debug)]
pub struct ClaimTable {
    held: Mutex<HashSet<(ResourceKind, String)>>,
}

impl ClaimTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { held: Mutex::new(HashSet::new()) })
    }

    /// Claims an identifier for the duration of one provisioning sequence.
    /// A second claim while the first guard is alive fails with `Conflict`;
    /// there is deliberately no waiting.
    pub fn claim(self: &Arc<Self>, kind: ResourceKind, identifier: &str) -> Result<ResourceClaim> {
        let key = (kind, identifier.to_string());
        let mut held = self.held.lock().expect("claim table poisoned");
        if !held.insert(key.clone()) {
            return Err(AgentError::Conflict {
                kind: kind.label(),
                identifier: identifier.to_string(),
            });
        }
        Ok(ResourceClaim { table: Arc::clone(self), key: Some(key) })
    }
}

/// RAII claim; releasing is dropping.
#[derive(Debug)]
pub struct ResourceClaim {
    table: Arc<ClaimTable>,
    key: Option<(ResourceKind, String)>,
}

impl Drop for ResourceClaim {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Ok(mut held) = self.table.held.lock() {
                held.remove(&key);
            }
        }
    }
}

/// The web-server reload is one shared global resource. Every
/// write→enable→self-test→reload critical section runs under this gate so
/// a self-test never observes another request's half-applied files.
pub struct ReloadGate {
    gate: AsyncMutex<()>,
}

impl ReloadGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { gate: AsyncMutex::new(()) })
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_identifier_conflicts() {
        let table = ClaimTable::new();
        let _held = table.claim(ResourceKind::VirtualHost, "example.com").unwrap();

        let err = table.claim(ResourceKind::VirtualHost, "example.com").unwrap_err();
        match err {
            AgentError::Conflict { kind, identifier } => {
                assert_eq!(kind, "virtual_host");
                assert_eq!(identifier, "example.com");
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[test]
    fn dropping_the_guard_releases_the_claim() {
        let table = ClaimTable::new();
        {
            let _held = table.claim(ResourceKind::SystemUser, "alice").unwrap();
        }
        assert!(table.claim(ResourceKind::SystemUser, "alice").is_ok());
    }

    #[test]
    fn claims_are_scoped_by_kind_and_identifier() {
        let table = ClaimTable::new();
        let _a = table.claim(ResourceKind::VirtualHost, "example.com").unwrap();
        // Different kind, same identifier string: independent.
        let _b = table.claim(ResourceKind::SystemUser, "example.com").unwrap();
        // Same kind, different identifier: independent.
        let _c = table.claim(ResourceKind::VirtualHost, "other.com").unwrap();
    }

    #[tokio::test]
    async fn exactly_one_of_two_racing_claims_wins() {
        let table = ClaimTable::new();
        let t1 = Arc::clone(&table);
        let t2 = Arc::clone(&table);
        // Guards must stay alive until both outcomes are observed, otherwise
        // the loser would see an already-released claim.
        let (a, b) = tokio::join!(
            async move { t1.claim(ResourceKind::VirtualHost, "example.com") },
            async move { t2.claim(ResourceKind::VirtualHost, "example.com") },
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn reload_gate_serializes_critical_sections() {
        let gate = ReloadGate::new();
        let first = gate.acquire().await;
        // A second acquisition must not be immediately available.
        assert!(gate.gate.try_lock().is_err());
        drop(first);
        assert!(gate.gate.try_lock().is_ok());
    }
}
