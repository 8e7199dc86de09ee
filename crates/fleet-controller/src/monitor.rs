//! Monitor engine: client-scoped subscription sets, collapsed into a
//! minimal set of upstream agent subscriptions via a reverse index keyed
//! on (node, unit).

use crate::agent_proxy::AgentProxy;
use crate::node::NodeRegistry;
use async_trait::async_trait;
use fleet_core::escape::escape;
use fleet_core::glob::matches as glob_matches;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use zbus::zvariant::OwnedObjectPath;

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub monitor_id: u64,
    pub node_pattern: String,
    pub unit_pattern: String,
}

impl Subscription {
    fn matches(&self, node: &str, unit: &str) -> bool {
        (self.node_pattern == "*" || self.node_pattern == node)
            && glob_matches(unit, &self.unit_pattern)
    }
}

struct MonitorRecord {
    object_path: OwnedObjectPath,
    owner: String,
    subscription_ids: HashSet<u64>,
}

#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn unit_new(&self, node: &str, unit: &str, reason: &str);
    async fn unit_removed(&self, node: &str, unit: &str, reason: &str);
    async fn unit_state_changed(&self, node: &str, unit: &str, active_state: &str, sub_state: &str, reason: &str);
    async fn unit_properties_changed(
        &self,
        node: &str,
        unit: &str,
        interface: &str,
        properties: std::collections::HashMap<String, zbus::zvariant::OwnedValue>,
    );
}

pub struct MonitorEngine {
    base_path: String,
    monitor_counter: AtomicU64,
    subscription_counter: AtomicU64,
    monitors: RwLock<HashMap<u64, MonitorRecord>>,
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    /// Every (node, unit) pair any agent has reported seeing, so a freshly
    /// added subscription can be matched against units that already exist.
    known_units: RwLock<HashSet<(String, String)>>,
    /// (node, unit) -> subscriptions currently matching it.
    reverse: RwLock<HashMap<(String, String), HashSet<u64>>>,
    nodes: Arc<NodeRegistry>,
}

impl MonitorEngine {
    pub fn new(base_path: impl Into<String>, nodes: Arc<NodeRegistry>) -> Arc<Self> {
        Arc::new(MonitorEngine {
            base_path: base_path.into(),
            monitor_counter: AtomicU64::new(1),
            subscription_counter: AtomicU64::new(1),
            monitors: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            known_units: RwLock::new(HashSet::new()),
            reverse: RwLock::new(HashMap::new()),
            nodes,
        })
    }

    pub async fn create_monitor(&self, owner: String) -> (u64, OwnedObjectPath) {
        let id = self.monitor_counter.fetch_add(1, Ordering::SeqCst);
        let object_path = OwnedObjectPath::try_from(format!("{}/monitor/{}", self.base_path, id))
            .expect("monitor id produces a well-formed object path");

        self.monitors.write().await.insert(
            id,
            MonitorRecord {
                object_path: object_path.clone(),
                owner,
                subscription_ids: HashSet::new(),
            },
        );

        (id, object_path)
    }

    /// Torn down when the owning client's unique name vanishes from the
    /// user-facing bus.
    pub async fn close_monitors_owned_by(&self, owner: &str) {
        let ids: Vec<u64> = {
            let monitors = self.monitors.read().await;
            monitors
                .iter()
                .filter(|(_, m)| m.owner == owner)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.close(id).await;
        }
    }

    pub async fn subscribe(&self, monitor_id: u64, node_pattern: String, unit_pattern: String) -> Option<u64> {
        if !self.monitors.read().await.contains_key(&monitor_id) {
            return None;
        }

        let sub_id = self.subscription_counter.fetch_add(1, Ordering::SeqCst);
        let subscription = Subscription {
            id: sub_id,
            monitor_id,
            node_pattern,
            unit_pattern,
        };

        self.monitors
            .write()
            .await
            .get_mut(&monitor_id)
            .expect("checked above")
            .subscription_ids
            .insert(sub_id);
        self.subscriptions.write().await.insert(sub_id, subscription.clone());

        self.install_for_known_units(&subscription).await;
        Some(sub_id)
    }

    pub async fn subscribe_list(&self, monitor_id: u64, node: String, units: Vec<String>) -> Vec<u64> {
        let mut ids = Vec::with_capacity(units.len());
        for unit in units {
            if let Some(id) = self.subscribe(monitor_id, node.clone(), unit).await {
                ids.push(id);
            }
        }
        ids
    }

    pub async fn unsubscribe(&self, monitor_id: u64, subscription_id: u64) {
        let Some(subscription) = self.subscriptions.write().await.remove(&subscription_id) else {
            return;
        };
        if subscription.monitor_id != monitor_id {
            return;
        }

        if let Some(monitor) = self.monitors.write().await.get_mut(&monitor_id) {
            monitor.subscription_ids.remove(&subscription_id);
        }

        self.uninstall_for_known_units(&subscription).await;
    }

    pub async fn close(&self, monitor_id: u64) {
        let Some(monitor) = self.monitors.write().await.remove(&monitor_id) else {
            return;
        };
        for sub_id in monitor.subscription_ids {
            if let Some(subscription) = self.subscriptions.write().await.remove(&sub_id) {
                self.uninstall_for_known_units(&subscription).await;
            }
        }
    }

    /// Called when a `UnitNew` (or equivalent first sighting) arrives
    /// from an agent. Updates the reverse index and, for each newly
    /// matched subscription's (node, unit) pair, installs the upstream
    /// agent subscription exactly once.
    pub async fn observe_unit(&self, node: &str, unit: &str) {
        self.known_units
            .write()
            .await
            .insert((node.to_string(), unit.to_string()));

        let matching: Vec<u64> = {
            let subs = self.subscriptions.read().await;
            subs.values()
                .filter(|s| s.matches(node, unit))
                .map(|s| s.id)
                .collect()
        };
        if matching.is_empty() {
            return;
        }

        let key = (node.to_string(), unit.to_string());
        let was_empty = {
            let mut reverse = self.reverse.write().await;
            let entry = reverse.entry(key.clone()).or_default();
            let was_empty = entry.is_empty();
            entry.extend(matching);
            was_empty
        };

        if was_empty {
            self.install_upstream(node, unit).await;
        }
    }

    async fn install_for_known_units(&self, subscription: &Subscription) {
        let known: Vec<(String, String)> = self.known_units.read().await.iter().cloned().collect();
        for (node, unit) in known {
            if !subscription.matches(&node, &unit) {
                continue;
            }
            let key = (node.clone(), unit.clone());
            let was_empty = {
                let mut reverse = self.reverse.write().await;
                let entry = reverse.entry(key).or_default();
                let was_empty = entry.is_empty();
                entry.insert(subscription.id);
                was_empty
            };
            if was_empty {
                self.install_upstream(&node, &unit).await;
            }
        }
    }

    async fn uninstall_for_known_units(&self, subscription: &Subscription) {
        let known: Vec<(String, String)> = self.known_units.read().await.iter().cloned().collect();
        for (node, unit) in known {
            if !subscription.matches(&node, &unit) {
                continue;
            }
            let key = (node.clone(), unit.clone());
            let now_empty = {
                let mut reverse = self.reverse.write().await;
                match reverse.get_mut(&key) {
                    Some(set) => {
                        set.remove(&subscription.id);
                        set.is_empty()
                    }
                    None => false,
                }
            };
            if now_empty {
                self.reverse.write().await.remove(&key);
                self.uninstall_upstream(&node, &unit).await;
            }
        }
    }

    async fn install_upstream(&self, node: &str, unit: &str) {
        let Some(connection) = self.nodes.get_agent_connection(node).await else {
            return;
        };
        if let Ok(proxy) = AgentProxy::new(&connection, &self.base_path).await {
            let _ = proxy.subscribe(unit).await;
        }
    }

    async fn uninstall_upstream(&self, node: &str, unit: &str) {
        let Some(connection) = self.nodes.get_agent_connection(node).await else {
            return;
        };
        if let Ok(proxy) = AgentProxy::new(&connection, &self.base_path).await {
            let _ = proxy.unsubscribe(unit).await;
        }
    }

    /// Which Monitor object a subscription belongs to, so a fanned-out
    /// signal can be emitted on the right object path.
    pub async fn monitor_id_of(&self, subscription_id: u64) -> Option<u64> {
        self.subscriptions
            .read()
            .await
            .get(&subscription_id)
            .map(|s| s.monitor_id)
    }

    pub async fn monitor_object_path_of(&self, monitor_id: u64) -> Option<OwnedObjectPath> {
        self.monitors.read().await.get(&monitor_id).map(|m| m.object_path.clone())
    }

    /// Subscriptions currently interested in (node, unit); used to decide
    /// whether a just-arrived agent signal should be fanned out.
    pub async fn subscribers_for(&self, node: &str, unit: &str) -> Vec<u64> {
        let reverse = self.reverse.read().await;
        reverse
            .get(&(node.to_string(), unit.to_string()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops everything this engine knows about a node that just went
    /// offline: its units are no longer "known", and any reverse-index
    /// entries for them are cleared (subscriptions themselves survive and
    /// are re-matched once the node comes back and re-announces units).
    pub async fn invalidate_node(&self, node: &str) {
        let mut known = self.known_units.write().await;
        let stale: Vec<(String, String)> = known
            .iter()
            .filter(|(n, _)| n == node)
            .cloned()
            .collect();
        for pair in &stale {
            known.remove(pair);
        }
        drop(known);

        let mut reverse = self.reverse.write().await;
        for pair in stale {
            reverse.remove(&pair);
        }
    }

    pub fn monitor_object_path(base_path: &str, id: u64) -> OwnedObjectPath {
        OwnedObjectPath::try_from(format!("{base_path}/monitor/{id}"))
            .expect("monitor id produces a well-formed object path")
    }

    #[allow(dead_code)]
    fn node_object_path(&self, name: &str) -> String {
        format!("{}/node/{}", self.base_path, escape(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_overlapping_subscriptions_collapse_to_one_reverse_entry() {
        let nodes = NodeRegistry::new("/org/eclipse/bluechi");
        let engine = MonitorEngine::new("/org/eclipse/bluechi", nodes);

        let (m1, _) = engine.create_monitor("client-1".to_string()).await;
        let (m2, _) = engine.create_monitor("client-2".to_string()).await;

        let s1 = engine
            .subscribe(m1, "laptop".to_string(), "app-*.service".to_string())
            .await
            .unwrap();
        let s2 = engine
            .subscribe(m2, "laptop".to_string(), "app-foo.*".to_string())
            .await
            .unwrap();

        engine.observe_unit("laptop", "app-foo.service").await;

        let subscribers = engine.subscribers_for("laptop", "app-foo.service").await;
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.contains(&s1));
        assert!(subscribers.contains(&s2));

        engine.unsubscribe(m1, s1).await;
        let subscribers = engine.subscribers_for("laptop", "app-foo.service").await;
        assert_eq!(subscribers, vec![s2]);

        engine.unsubscribe(m2, s2).await;
        let subscribers = engine.subscribers_for("laptop", "app-foo.service").await;
        assert!(subscribers.is_empty());
    }

    #[tokio::test]
    async fn close_removes_all_subscriptions_for_owner() {
        let nodes = NodeRegistry::new("/org/eclipse/bluechi");
        let engine = MonitorEngine::new("/org/eclipse/bluechi", nodes);
        let (id, _path) = engine.create_monitor("client-1".to_string()).await;

        engine
            .subscribe(id, "laptop".to_string(), "*".to_string())
            .await
            .unwrap();
        engine.observe_unit("laptop", "db.service").await;
        assert_eq!(engine.subscribers_for("laptop", "db.service").await.len(), 1);

        engine.close(id).await;
        assert!(engine.subscribers_for("laptop", "db.service").await.is_empty());
    }
}
