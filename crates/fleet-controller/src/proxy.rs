//! Proxy-service engine: lets a requesting node depend on a unit running
//! on a different (target) node by starting a local proxy unit that
//! tracks the target's lifecycle. Refcounted so two local units
//! depending on the same (target_node, target_unit) share one upstream
//! start/stop pair.

use crate::agent_jobs::AgentJobTracker;
use crate::agent_proxy::AgentProxy;
use crate::job::CALL_TIMEOUT;
use crate::node::NodeRegistry;
use fleet_core::types::{JobResult, ProxyState};
use fleet_core::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use zbus::zvariant::OwnedObjectPath;

#[derive(Debug, Clone)]
pub struct ProxyService {
    pub id: u32,
    pub object_path: OwnedObjectPath,
    pub requesting_node: String,
    pub target_node: String,
    pub target_unit: String,
    pub state: ProxyState,
    pub refcount: u32,
}

pub struct ProxyEngine {
    base_path: String,
    counter: AtomicU32,
    services: RwLock<HashMap<u32, ProxyService>>,
    /// (requesting_node, target_node, target_unit) -> service id, so a
    /// second CreateProxy for the same triple shares the first's refcount
    /// instead of starting a second upstream unit.
    by_key: RwLock<HashMap<(String, String, String), u32>>,
    nodes: Arc<NodeRegistry>,
    agent_jobs: Arc<AgentJobTracker>,
}

impl ProxyEngine {
    pub fn new(base_path: impl Into<String>, nodes: Arc<NodeRegistry>, agent_jobs: Arc<AgentJobTracker>) -> Arc<Self> {
        Arc::new(ProxyEngine {
            base_path: base_path.into(),
            counter: AtomicU32::new(1),
            services: RwLock::new(HashMap::new()),
            by_key: RwLock::new(HashMap::new()),
            nodes,
            agent_jobs,
        })
    }

    /// Creates or joins a proxy for `target_node`'s `target_unit`, as seen
    /// from `requesting_node`. Starts the upstream unit only on the first
    /// caller; later callers just bump the refcount.
    pub async fn create_proxy(
        &self,
        requesting_node: String,
        target_node: String,
        target_unit: String,
    ) -> Result<OwnedObjectPath, Error> {
        let key = (requesting_node.clone(), target_node.clone(), target_unit.clone());

        if let Some(&id) = self.by_key.read().await.get(&key) {
            let mut services = self.services.write().await;
            let service = services.get_mut(&id).expect("by_key entries always have a service");
            service.refcount += 1;
            return Ok(service.object_path.clone());
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let object_path = OwnedObjectPath::try_from(format!("{}/proxy/{}", self.base_path, id))
            .expect("proxy id produces a well-formed object path");

        let mut service = ProxyService {
            id,
            object_path: object_path.clone(),
            requesting_node,
            target_node: target_node.clone(),
            target_unit: target_unit.clone(),
            state: ProxyState::Pending,
            refcount: 1,
        };

        service.state = match self.start_upstream(&target_node, &target_unit).await {
            Ok(()) => ProxyState::Ready,
            Err(_) => ProxyState::Failed,
        };

        self.services.write().await.insert(id, service);
        self.by_key.write().await.insert(key, id);

        Ok(object_path)
    }

    /// Drops one reference; stops the upstream unit once the last
    /// reference is gone.
    pub async fn remove_proxy(&self, id: u32) -> Result<(), Error> {
        let finished = {
            let mut services = self.services.write().await;
            let Some(service) = services.get_mut(&id) else {
                return Err(Error::invalid_argument(format!("no such proxy {id}")));
            };
            service.refcount = service.refcount.saturating_sub(1);
            if service.refcount == 0 {
                service.state = ProxyState::Stopped;
                Some((service.target_node.clone(), service.target_unit.clone()))
            } else {
                None
            }
        };

        if let Some((target_node, target_unit)) = finished {
            let key = {
                let services = self.services.read().await;
                let service = &services[&id];
                (
                    service.requesting_node.clone(),
                    service.target_node.clone(),
                    service.target_unit.clone(),
                )
            };
            self.by_key.write().await.remove(&key);
            self.services.write().await.remove(&id);
            let _ = self.stop_upstream(&target_node, &target_unit).await;
        }

        Ok(())
    }

    pub async fn state_of(&self, id: u32) -> Option<ProxyState> {
        self.services.read().await.get(&id).map(|s| s.state)
    }

    /// Fails every proxy whose target node just went offline, so
    /// dependents see a prompt state transition instead of hanging.
    pub async fn fail_proxies_for_target(&self, target_node: &str) {
        let mut services = self.services.write().await;
        for service in services.values_mut() {
            if service.target_node == target_node && service.state == ProxyState::Ready {
                service.state = ProxyState::Failed;
            }
        }
    }

    /// Starts the upstream unit and awaits the agent's correlated
    /// `JobRemoved` for it, rather than trusting the synchronous
    /// `StartUnit` reply — that reply only confirms systemd accepted the
    /// job, not that the unit actually came up.
    async fn start_upstream(&self, target_node: &str, target_unit: &str) -> Result<(), Error> {
        let connection = self
            .nodes
            .get_agent_connection(target_node)
            .await
            .ok_or_else(|| Error::Offline(target_node.to_string()))?;
        let proxy = AgentProxy::new(&connection, &self.base_path).await?;
        let job_path = proxy.start_unit(target_unit, "replace").await?;

        let completion = self.agent_jobs.wait_for(target_node, job_path.as_str());
        match tokio::time::timeout(CALL_TIMEOUT, completion).await {
            Ok(Ok(JobResult::Done)) => Ok(()),
            Ok(Ok(_)) => Err(Error::ActivationFailed(target_unit.to_string())),
            Ok(Err(_)) | Err(_) => Err(Error::Timeout(CALL_TIMEOUT)),
        }
    }

    async fn stop_upstream(&self, target_node: &str, target_unit: &str) -> Result<(), Error> {
        let Some(connection) = self.nodes.get_agent_connection(target_node).await else {
            return Ok(());
        };
        let proxy = AgentProxy::new(&connection, &self.base_path).await?;
        let job_path = proxy.stop_unit(target_unit, "replace").await?;

        let completion = self.agent_jobs.wait_for(target_node, job_path.as_str());
        let _ = tokio::time::timeout(CALL_TIMEOUT, completion).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_create_for_same_triple_shares_refcount() {
        let nodes = NodeRegistry::new("/org/eclipse/bluechi");
        let engine = ProxyEngine::new("/org/eclipse/bluechi", nodes, Arc::new(AgentJobTracker::new()));

        let path1 = engine
            .create_proxy("a".into(), "b".into(), "db.service".into())
            .await
            .unwrap();
        let path2 = engine
            .create_proxy("a".into(), "b".into(), "db.service".into())
            .await
            .unwrap();

        assert_eq!(path1, path2);
    }

    #[tokio::test]
    async fn missing_target_node_marks_proxy_failed() {
        let nodes = NodeRegistry::new("/org/eclipse/bluechi");
        let engine = ProxyEngine::new("/org/eclipse/bluechi", nodes, Arc::new(AgentJobTracker::new()));

        let path = engine
            .create_proxy("a".into(), "unknown-node".into(), "db.service".into())
            .await
            .unwrap();

        let id: u32 = path.as_str().rsplit('/').next().unwrap().parse().unwrap();
        assert_eq!(engine.state_of(id).await, Some(ProxyState::Failed));
    }

    #[tokio::test]
    async fn remove_proxy_is_noop_until_last_reference_drops() {
        let nodes = NodeRegistry::new("/org/eclipse/bluechi");
        let engine = ProxyEngine::new("/org/eclipse/bluechi", nodes, Arc::new(AgentJobTracker::new()));

        let path = engine
            .create_proxy("a".into(), "unknown-node".into(), "db.service".into())
            .await
            .unwrap();
        engine
            .create_proxy("a".into(), "unknown-node".into(), "db.service".into())
            .await
            .unwrap();

        let id: u32 = path.as_str().rsplit('/').next().unwrap().parse().unwrap();
        engine.remove_proxy(id).await.unwrap();
        assert!(engine.state_of(id).await.is_some());

        engine.remove_proxy(id).await.unwrap();
        assert!(engine.state_of(id).await.is_none());
    }
}
