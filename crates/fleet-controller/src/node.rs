//! Node registry: one long-lived record per configured/registered node
//! name. A Node outlives any particular agent connection — it flips
//! between online and offline as agents come and go, but is never
//! removed while the controller runs.

use fleet_core::escape::escape;
use fleet_core::types::NodeStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use zbus::zvariant::OwnedObjectPath;

/// The live connection to a node's agent. Dropping this (on disconnect)
/// does not remove the `Node` itself, only this handle.
pub struct AgentConnection {
    pub connection: zbus::Connection,
    pub peer_ip: String,
}

pub struct Node {
    pub name: String,
    pub object_path: OwnedObjectPath,
    pub state: NodeStatus,
    pub last_seen_micros: u64,
    pub agent: Option<AgentConnection>,
}

impl Node {
    pub fn new(base_path: &str, name: &str) -> Self {
        let object_path = OwnedObjectPath::try_from(format!("{base_path}/node/{}", escape(name)))
            .expect("escaped node name produces a well-formed object path");
        Node {
            name: name.to_string(),
            object_path,
            state: NodeStatus::Offline,
            last_seen_micros: 0,
            agent: None,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self.state, NodeStatus::Online) && self.agent.is_some()
    }

    pub fn peer_ip(&self) -> String {
        self.agent
            .as_ref()
            .map(|a| a.peer_ip.clone())
            .unwrap_or_default()
    }
}

/// Keyed by node name. Registration and heartbeat/offline transitions all
/// go through here so there is exactly one place that owns a Node's
/// lifetime.
pub struct NodeRegistry {
    base_path: String,
    nodes: RwLock<HashMap<String, Node>>,
}

impl NodeRegistry {
    pub fn new(base_path: impl Into<String>) -> Arc<Self> {
        Arc::new(NodeRegistry {
            base_path: base_path.into(),
            nodes: RwLock::new(HashMap::new()),
        })
    }

    /// Finds or creates the Node record for `name`, offline and
    /// unconnected. Idempotent: calling it again for an already-known name
    /// is a no-op on the existing record.
    pub async fn ensure(&self, name: &str) -> OwnedObjectPath {
        let mut nodes = self.nodes.write().await;
        nodes
            .entry(name.to_string())
            .or_insert_with(|| Node::new(&self.base_path, name))
            .object_path
            .clone()
    }

    /// Attempts to migrate an anonymous connection onto the Node named
    /// `name`. Fails if that Node already has a live agent connection.
    pub async fn register(
        &self,
        name: &str,
        connection: zbus::Connection,
        peer_ip: String,
        now_micros: u64,
    ) -> Result<OwnedObjectPath, fleet_core::Error> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .entry(name.to_string())
            .or_insert_with(|| Node::new(&self.base_path, name));

        if node.agent.is_some() {
            return Err(fleet_core::Error::AddressInUse(name.to_string()));
        }

        node.agent = Some(AgentConnection {
            connection,
            peer_ip,
        });
        node.state = NodeStatus::Online;
        node.last_seen_micros = now_micros;
        Ok(node.object_path.clone())
    }

    pub async fn heartbeat(&self, name: &str, now_micros: u64) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(name) {
            Some(node) => {
                node.last_seen_micros = now_micros;
                true
            }
            None => false,
        }
    }

    /// Marks a node offline (disconnect or missed-heartbeat timeout),
    /// dropping its agent connection. Returns true if it was online.
    pub async fn mark_offline(&self, name: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(name) {
            Some(node) if node.is_online() => {
                node.agent = None;
                node.state = NodeStatus::Offline;
                true
            }
            _ => false,
        }
    }

    pub async fn get_agent_connection(&self, name: &str) -> Option<zbus::Connection> {
        let nodes = self.nodes.read().await;
        nodes
            .get(name)
            .and_then(|n| n.agent.as_ref())
            .map(|a| a.connection.clone())
    }

    pub async fn is_online(&self, name: &str) -> bool {
        let nodes = self.nodes.read().await;
        nodes.get(name).map(Node::is_online).unwrap_or(false)
    }

    pub async fn object_path_of(&self, name: &str) -> Option<OwnedObjectPath> {
        let nodes = self.nodes.read().await;
        nodes.get(name).map(|n| n.object_path.clone())
    }

    pub async fn online_names(&self) -> Vec<String> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.is_online())
            .map(|n| n.name.clone())
            .collect()
    }

    /// `(name, path, status, peer_ip)` rows for `Controller.ListNodes`.
    pub async fn list(&self) -> Vec<(String, OwnedObjectPath, String, String)> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .map(|n| {
                (
                    n.name.clone(),
                    n.object_path.clone(),
                    n.state.as_str().to_string(),
                    n.peer_ip(),
                )
            })
            .collect()
    }

    pub async fn last_seen_micros(&self, name: &str) -> Option<u64> {
        let nodes = self.nodes.read().await;
        nodes.get(name).map(|n| n.last_seen_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_register_again_is_rejected_without_disconnect() {
        let registry = NodeRegistry::new("/org/eclipse/bluechi");
        let conn1 = crate::test_support::dummy_connection().await;
        registry
            .register("laptop", conn1, "10.0.0.1".into(), 1)
            .await
            .unwrap();

        let conn2 = crate::test_support::dummy_connection().await;
        let err = registry
            .register("laptop", conn2, "10.0.0.2".into(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, fleet_core::Error::AddressInUse(_)));
    }

    #[tokio::test]
    async fn offline_then_reregister_reuses_the_same_object_path() {
        let registry = NodeRegistry::new("/org/eclipse/bluechi");
        let conn1 = crate::test_support::dummy_connection().await;
        let path1 = registry
            .register("laptop", conn1, "10.0.0.1".into(), 1)
            .await
            .unwrap();

        registry.mark_offline("laptop").await;

        let conn2 = crate::test_support::dummy_connection().await;
        let path2 = registry
            .register("laptop", conn2, "10.0.0.2".into(), 2)
            .await
            .unwrap();

        assert_eq!(path1, path2);
    }
}
