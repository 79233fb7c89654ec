use axum::extract::ws::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use call_proto::{Role, ServerEvent};

use crate::auth::Principal;

pub type Tx = mpsc::UnboundedSender<Message>;

/// Opaque reference to one live connection. Distinct from a user id, which is
/// a stable identity that may map to different handles over time.
pub type ConnId = Uuid;

struct PresenceEntry {
    principal: Principal,
    tx: Tx,
}

/// Tracks which users currently have a live connection and on which handle.
///
/// Every entry has a live underlying socket; entries are removed synchronously
/// on disconnect, so a successful lookup is always addressable.
#[derive(Clone)]
pub struct PresenceRegistry {
    peers: Arc<DashMap<ConnId, PresenceEntry>>,
    /// Reverse index, at most one live handle per user id.
    by_user: Arc<DashMap<Uuid, ConnId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            by_user: Arc::new(DashMap::new()),
        }
    }

    /// Idempotent upsert. A later registration for the same user id silently
    /// drops the prior handle's entry; a re-registration on the same handle
    /// supersedes its previous principal.
    pub fn register(&self, conn: ConnId, principal: Principal, tx: Tx) {
        if let Some(prev) = self.by_user.insert(principal.user_id, conn) {
            if prev != conn {
                self.peers.remove(&prev);
            }
        }

        if let Some(old) = self.peers.insert(conn, PresenceEntry { principal: principal.clone(), tx }) {
            if old.principal.user_id != principal.user_id {
                self.by_user
                    .remove_if(&old.principal.user_id, |_, mapped| *mapped == conn);
            }
        }
    }

    /// Called on disconnect. Removes both the forward and reverse entries.
    pub fn unregister(&self, conn: ConnId) {
        if let Some((_, entry)) = self.peers.remove(&conn) {
            self.by_user
                .remove_if(&entry.principal.user_id, |_, mapped| *mapped == conn);
        }
    }

    /// `None` means "target currently offline", never a fault.
    pub fn lookup(&self, user_id: Uuid) -> Option<ConnId> {
        self.by_user.get(&user_id).map(|conn| *conn)
    }

    pub fn principal(&self, conn: ConnId) -> Option<Principal> {
        self.peers.get(&conn).map(|entry| entry.principal.clone())
    }

    /// Fan-out set for an incoming call. Order is unspecified.
    pub fn list_by_tenant_and_roles(&self, tenant_id: Uuid, roles: &[Role]) -> Vec<ConnId> {
        self.peers
            .iter()
            .filter(|entry| {
                entry.principal.tenant_id == tenant_id && roles.contains(&entry.principal.role)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Push an event onto the handle's writer channel. Returns false when the
    /// handle is no longer live.
    pub fn send_to(&self, conn: ConnId, event: &ServerEvent) -> bool {
        let Ok(text) = serde_json::to_string(event) else {
            return false;
        };
        match self.peers.get(&conn) {
            Some(entry) => entry.tx.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: Role, tenant_id: Uuid) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            display_name: "someone".to_string(),
            role,
            tenant_id,
        }
    }

    fn channel() -> (Tx, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn later_registration_replaces_prior_handle() {
        let registry = PresenceRegistry::new();
        let tenant = Uuid::new_v4();
        let alice = principal(Role::Admin, tenant);

        let old_conn = Uuid::new_v4();
        let new_conn = Uuid::new_v4();
        registry.register(old_conn, alice.clone(), channel().0);
        registry.register(new_conn, alice.clone(), channel().0);

        assert_eq!(registry.lookup(alice.user_id), Some(new_conn));
        assert!(registry.principal(old_conn).is_none());
    }

    #[tokio::test]
    async fn unregister_clears_both_indexes() {
        let registry = PresenceRegistry::new();
        let tenant = Uuid::new_v4();
        let bob = principal(Role::Staff, tenant);

        let conn = Uuid::new_v4();
        registry.register(conn, bob.clone(), channel().0);
        registry.unregister(conn);

        assert!(registry.lookup(bob.user_id).is_none());
        assert!(registry.principal(conn).is_none());
        assert!(!registry.send_to(conn, &ServerEvent::CallRinging { session_id: Uuid::new_v4() }));
    }

    #[tokio::test]
    async fn fan_out_filters_by_tenant_and_role() {
        let registry = PresenceRegistry::new();
        let tenant = Uuid::new_v4();
        let other_tenant = Uuid::new_v4();

        let admin_conn = Uuid::new_v4();
        let staff_conn = Uuid::new_v4();
        let customer_conn = Uuid::new_v4();
        let foreign_conn = Uuid::new_v4();

        registry.register(admin_conn, principal(Role::Admin, tenant), channel().0);
        registry.register(staff_conn, principal(Role::Staff, tenant), channel().0);
        registry.register(customer_conn, principal(Role::Customer, tenant), channel().0);
        registry.register(foreign_conn, principal(Role::Admin, other_tenant), channel().0);

        let mut listeners = registry.list_by_tenant_and_roles(tenant, &[Role::Admin, Role::Staff]);
        listeners.sort();
        let mut expected = vec![admin_conn, staff_conn];
        expected.sort();
        assert_eq!(listeners, expected);
    }

    #[tokio::test]
    async fn send_to_delivers_to_live_handle() {
        let registry = PresenceRegistry::new();
        let tenant = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = channel();
        registry.register(conn, principal(Role::Admin, tenant), tx);

        let session_id = Uuid::new_v4();
        assert!(registry.send_to(conn, &ServerEvent::CallRinging { session_id }));

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        assert!(text.contains("call-ringing"));
    }
}
