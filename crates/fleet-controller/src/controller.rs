//! Top-level wiring: owns every engine, serves the public interfaces on
//! the user-facing bus, accepts agent peer connections, and runs the
//! heartbeat-timeout sweep that is this project's only way of noticing a
//! node went away (no reliance on transport-level disconnect events).

use crate::agent_jobs::AgentJobTracker;
use crate::interfaces::{ControllerInterface, InternalManagerInterface, JobInterface, MonitorInterface, NodeInterface};
use crate::job::{JobEngine, JobSink};
use crate::monitor::{MonitorEngine, MonitorSink};
use crate::node::NodeRegistry;
use crate::proxy::ProxyEngine;
use async_trait::async_trait;
use fleet_core::audit::{ExecutionRecord, ExecutionTracker};
use fleet_core::types::{JobResult, JobState, JobType};
use fleet_core::{Config, Result};
use fleet_transport::{Accepted, PeerListener};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

/// Handle used by `SetLogLevel` to change the running tracing filter
/// without restarting the process.
pub type LogLevelHandle = tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

pub struct Controller {
    pub config: Arc<Config>,
    pub nodes: Arc<NodeRegistry>,
    pub jobs: Arc<JobEngine>,
    pub monitors: Arc<MonitorEngine>,
    pub proxies: Arc<ProxyEngine>,
    pub audit: Arc<ExecutionTracker>,
    pub agent_jobs: Arc<AgentJobTracker>,
    /// The user-facing bus connection exporting the public interfaces.
    public_connection: zbus::Connection,
    /// Accepted agent connections, kept alive here until their Node is
    /// marked offline and dropped.
    peer_connections: Mutex<Vec<zbus::Connection>>,
}

impl Controller {
    pub async fn new(config: Config, log_handle: Option<LogLevelHandle>) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let nodes = NodeRegistry::new(config.base_path.clone());
        let agent_jobs = Arc::new(AgentJobTracker::new());
        let jobs = JobEngine::new(config.base_path.clone(), nodes.clone(), agent_jobs.clone());
        let monitors = MonitorEngine::new(config.base_path.clone(), nodes.clone());
        let proxies = ProxyEngine::new(config.base_path.clone(), nodes.clone(), agent_jobs.clone());
        let audit = Arc::new(ExecutionTracker::default());

        let controller_iface = ControllerInterface::new(
            nodes.clone(),
            jobs.clone(),
            monitors.clone(),
            proxies.clone(),
            audit.clone(),
            log_handle,
        );

        let public_connection = zbus::connection::Builder::system()?
            .name(config.base_name.clone())?
            .serve_at(config.base_path.clone(), controller_iface)?
            .build()
            .await?;

        let controller = Arc::new(Controller {
            config,
            nodes,
            jobs,
            monitors,
            proxies,
            audit,
            agent_jobs,
            public_connection,
            peer_connections: Mutex::new(Vec::new()),
        });

        controller.jobs.set_sink(controller.clone()).await;

        if let Ok(iface_ref) = controller
            .public_connection
            .object_server()
            .interface::<_, ControllerInterface>(controller.config.base_path.clone())
            .await
        {
            iface_ref.get().await.attach_controller(controller.clone());
        }

        Ok(controller)
    }

    /// Runs forever: the peer-bus accept loop and the heartbeat sweep,
    /// side by side.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = PeerListener::bind(&self.config).await?;

        let sweep = self.clone();
        tokio::spawn(async move { sweep.heartbeat_sweep_loop().await });

        loop {
            let accepted = listener.accept().await?;
            let peer_ip = peer_ip_of(&accepted);
            let controller = self.clone();
            tokio::spawn(async move {
                if let Err(e) = controller.handle_peer(accepted, peer_ip).await {
                    tracing::warn!(error = %e, "failed to set up agent peer connection");
                }
            });
        }
    }

    async fn handle_peer(self: Arc<Self>, accepted: Accepted, peer_ip: String) -> Result<()> {
        let connection = fleet_transport::server_peer_bus(accepted, &self.config).await?;

        let manager_path = format!("{}/internal/manager", self.config.base_path);
        connection
            .object_server()
            .at(
                manager_path,
                InternalManagerInterface::new(self.clone(), peer_ip),
            )
            .await?;

        self.peer_connections.lock().await.push(connection);
        Ok(())
    }

    /// Called from `internal.Manager.Register`: validates the requested
    /// name, migrates the agent's connection onto its Node, and publishes
    /// the corresponding public `Node` object.
    pub async fn register_node(
        self: &Arc<Self>,
        name: &str,
        connection: zbus::Connection,
        peer_ip: String,
    ) -> Result<OwnedObjectPath> {
        if !self.config.allows_node_name(name) {
            return Err(fleet_core::Error::invalid_argument(format!(
                "node name {name} is not in the allow-list"
            )));
        }
        let now = now_micros();
        let listener_connection = connection.clone();
        let path = self.nodes.register(name, connection, peer_ip, now).await?;
        if let Err(e) = self.publish_node(name).await {
            tracing::warn!(node = name, error = %e, "failed to publish node object");
        }

        let controller = self.clone();
        let node_name = name.to_string();
        tokio::spawn(async move {
            controller.listen_for_unit_signals(node_name, listener_connection).await;
        });

        Ok(path)
    }

    /// Forwards an Agent's unit-lifecycle signals (raised over its own
    /// `internal.Agent` interface, installed via the Monitor engine's
    /// upstream subscribe/unsubscribe calls) into the matching Monitor
    /// objects on the public bus.
    async fn listen_for_unit_signals(self: Arc<Self>, node: String, connection: zbus::Connection) {
        let mut stream = zbus::MessageStream::from(&connection);
        while let Some(msg) = stream.next().await {
            let Ok(msg) = msg else { break };
            let header = msg.header();
            if header.message_type() != zbus::message::Type::Signal {
                continue;
            }
            if header.interface().map(|i| i.as_str()) != Some("internal.Agent") {
                continue;
            }
            let Some(member) = header.member() else { continue };

            match member.as_str() {
                "UnitNew" => {
                    if let Ok((unit, reason)) = msg.body().deserialize::<(String, String)>() {
                        self.unit_new(&node, &unit, &reason).await;
                    }
                }
                "UnitRemoved" => {
                    if let Ok((unit, reason)) = msg.body().deserialize::<(String, String)>() {
                        self.unit_removed(&node, &unit, &reason).await;
                    }
                }
                "UnitStateChanged" => {
                    if let Ok((unit, active_state, sub_state, reason)) =
                        msg.body().deserialize::<(String, String, String, String)>()
                    {
                        self.unit_state_changed(&node, &unit, &active_state, &sub_state, &reason)
                            .await;
                    }
                }
                "UnitPropertiesChanged" => {
                    if let Ok((unit, interface_name, properties)) =
                        msg.body()
                            .deserialize::<(String, String, HashMap<String, OwnedValue>)>()
                    {
                        self.unit_properties_changed(&node, &unit, &interface_name, properties)
                            .await;
                    }
                }
                "JobRemoved" => {
                    if let Ok((job, result)) = msg.body().deserialize::<(String, String)>() {
                        self.agent_jobs.complete(&node, &job, &result);
                    }
                }
                _ => {}
            }
        }
        tracing::debug!(node = %node, "agent peer connection closed");
    }

    /// Calls `emit` once per Monitor object whose subscriptions currently
    /// match (node, unit).
    async fn fanout_to_monitors<F, Fut>(&self, node: &str, unit: &str, emit: F)
    where
        F: Fn(zbus::object_server::SignalEmitter<'static>) -> Fut,
        Fut: std::future::Future<Output = zbus::Result<()>>,
    {
        let subscriptions = self.monitors.subscribers_for(node, unit).await;
        let mut seen_monitors = std::collections::HashSet::new();
        for subscription_id in subscriptions {
            let Some(monitor_id) = self.monitors.monitor_id_of(subscription_id).await else {
                continue;
            };
            if !seen_monitors.insert(monitor_id) {
                continue;
            }
            let Some(path) = self.monitors.monitor_object_path_of(monitor_id).await else {
                continue;
            };
            let Ok(iface_ref) = self
                .public_connection
                .object_server()
                .interface::<_, MonitorInterface>(path)
                .await
            else {
                continue;
            };
            let emitter = iface_ref.signal_emitter().to_owned();
            if let Err(e) = emit(emitter).await {
                tracing::warn!(error = %e, "failed to emit monitor signal");
            }
        }
    }

    async fn heartbeat_sweep_loop(self: Arc<Self>) {
        let timeout_micros = (self.config.heartbeat_interval_ms * 2 * 1000) as u64;
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        loop {
            interval.tick().await;
            let now = now_micros();
            for name in self.nodes.online_names().await {
                let Some(last_seen) = self.nodes.last_seen_micros(&name).await else {
                    continue;
                };
                if now.saturating_sub(last_seen) > timeout_micros {
                    self.handle_node_offline(&name).await;
                }
            }
        }
    }

    async fn handle_node_offline(&self, name: &str) {
        if !self.nodes.mark_offline(name).await {
            return;
        }
        tracing::info!(node = name, "node missed heartbeat deadline, marking offline");
        self.monitors.invalidate_node(name).await;
        self.proxies.fail_proxies_for_target(name).await;
        self.agent_jobs.invalidate_node(name);

        if let Some(path) = self.nodes.object_path_of(name).await {
            if let Ok(iface_ref) = self
                .public_connection
                .object_server()
                .interface::<_, ControllerInterface>(self.config.base_path.clone())
                .await
            {
                let emitter = iface_ref.signal_emitter();
                if let Ok(object_path) = zbus::zvariant::ObjectPath::try_from(path.as_str()) {
                    let _ = ControllerInterface::node_disconnected(&emitter, name, object_path).await;
                }
            }
        }
    }

    /// Called once a Register call succeeds, to export the per-node
    /// public `Node` object and announce it on the public bus.
    pub async fn publish_node(&self, name: &str) -> Result<()> {
        let path = self.nodes.ensure(name).await;
        let node_iface = NodeInterface::new(
            name.to_string(),
            self.nodes.clone(),
            self.jobs.clone(),
            self.config.base_path.clone(),
        );
        self.public_connection
            .object_server()
            .at(path.clone(), node_iface)
            .await?;

        if let Ok(iface_ref) = self
            .public_connection
            .object_server()
            .interface::<_, ControllerInterface>(self.config.base_path.clone())
            .await
        {
            let emitter = iface_ref.signal_emitter();
            if let Ok(object_path) = zbus::zvariant::ObjectPath::try_from(path.as_str()) {
                let _ = ControllerInterface::node_connected(&emitter, name, object_path).await;
            }
        }
        Ok(())
    }

    pub async fn publish_monitor(&self, id: u64, path: OwnedObjectPath) -> Result<()> {
        let monitor_iface = MonitorInterface::new(id, self.monitors.clone());
        self.public_connection
            .object_server()
            .at(path, monitor_iface)
            .await?;
        Ok(())
    }

    /// Exports `<base>/job/<id>` for the duration of a job's run; paired
    /// with `unpublish_job` once it reaches a terminal state.
    async fn publish_job(&self, path: &OwnedObjectPath, job_type: JobType) -> Result<()> {
        let job_iface = JobInterface::new(job_type.as_str().to_string(), JobState::Waiting.as_str());
        self.public_connection
            .object_server()
            .at(path.clone(), job_iface)
            .await?;
        Ok(())
    }

    async fn unpublish_job(&self, path: &OwnedObjectPath) {
        let _ = self
            .public_connection
            .object_server()
            .remove::<JobInterface, _>(path.clone())
            .await;
    }
}

#[async_trait]
impl JobSink for Controller {
    async fn job_new(&self, id: u32, path: &OwnedObjectPath, job_type: JobType) {
        if let Err(e) = self.publish_job(path, job_type).await {
            tracing::warn!(error = %e, "failed to publish job object");
        }

        let Ok(iface_ref) = self
            .public_connection
            .object_server()
            .interface::<_, ControllerInterface>(self.config.base_path.clone())
            .await
        else {
            return;
        };
        let emitter = iface_ref.signal_emitter();
        if let Ok(object_path) = zbus::zvariant::ObjectPath::try_from(path.as_str()) {
            let _ = ControllerInterface::job_new(&emitter, id, object_path).await;
        }
    }

    async fn job_state_changed(&self, path: &OwnedObjectPath, state: JobState) {
        if let Ok(job_iface_ref) = self
            .public_connection
            .object_server()
            .interface::<_, JobInterface>(path.clone())
            .await
        {
            let job_iface = job_iface_ref.get().await;
            job_iface.set_state(state.as_str());
            let _ = job_iface.state_changed(job_iface_ref.signal_emitter()).await;
        }

        let Ok(iface_ref) = self
            .public_connection
            .object_server()
            .interface::<_, ControllerInterface>(self.config.base_path.clone())
            .await
        else {
            return;
        };
        let emitter = iface_ref.signal_emitter();
        if let Ok(object_path) = zbus::zvariant::ObjectPath::try_from(path.as_str()) {
            let _ = ControllerInterface::job_state_changed(&emitter, object_path, state.as_str()).await;
        }
    }

    async fn job_removed(
        &self,
        id: u32,
        path: &OwnedObjectPath,
        job_type: JobType,
        node: Option<&str>,
        result: JobResult,
    ) {
        self.audit.record(ExecutionRecord {
            job_type: job_type.as_str().to_string(),
            node: node.map(str::to_string),
            result: result.as_str().to_string(),
            finished_at_micros: now_micros(),
        });

        self.unpublish_job(path).await;

        let Ok(iface_ref) = self
            .public_connection
            .object_server()
            .interface::<_, ControllerInterface>(self.config.base_path.clone())
            .await
        else {
            return;
        };
        let emitter = iface_ref.signal_emitter();
        if let Ok(object_path) = zbus::zvariant::ObjectPath::try_from(path.as_str()) {
            let _ = ControllerInterface::job_removed(
                &emitter,
                id,
                object_path,
                job_type.as_str(),
                node.unwrap_or(""),
                result.as_str(),
            )
            .await;
        }
    }
}

#[async_trait]
impl MonitorSink for Controller {
    async fn unit_new(&self, node: &str, unit: &str, reason: &str) {
        self.monitors.observe_unit(node, unit).await;
        let (node, unit, reason) = (node.to_string(), unit.to_string(), reason.to_string());
        self.fanout_to_monitors(&node, &unit, |emitter| {
            let (node, unit, reason) = (node.clone(), unit.clone(), reason.clone());
            async move { MonitorInterface::unit_new(&emitter, &node, &unit, &reason).await }
        })
        .await;
    }

    async fn unit_removed(&self, node: &str, unit: &str, reason: &str) {
        let (node, unit, reason) = (node.to_string(), unit.to_string(), reason.to_string());
        self.fanout_to_monitors(&node, &unit, |emitter| {
            let (node, unit, reason) = (node.clone(), unit.clone(), reason.clone());
            async move { MonitorInterface::unit_removed(&emitter, &node, &unit, &reason).await }
        })
        .await;
    }

    async fn unit_state_changed(&self, node: &str, unit: &str, active_state: &str, sub_state: &str, reason: &str) {
        let (node, unit, active_state, sub_state, reason) = (
            node.to_string(),
            unit.to_string(),
            active_state.to_string(),
            sub_state.to_string(),
            reason.to_string(),
        );
        self.fanout_to_monitors(&node, &unit, |emitter| {
            let (node, unit, active_state, sub_state, reason) =
                (node.clone(), unit.clone(), active_state.clone(), sub_state.clone(), reason.clone());
            async move {
                MonitorInterface::unit_state_changed(&emitter, &node, &unit, &active_state, &sub_state, &reason).await
            }
        })
        .await;
    }

    async fn unit_properties_changed(&self, node: &str, unit: &str, interface: &str, properties: HashMap<String, OwnedValue>) {
        let (node, unit, interface) = (node.to_string(), unit.to_string(), interface.to_string());
        self.fanout_to_monitors(&node, &unit, |emitter| {
            let (node, unit, interface, properties) = (node.clone(), unit.clone(), interface.clone(), properties.clone());
            async move { MonitorInterface::unit_properties_changed(&emitter, &node, &unit, &interface, properties).await }
        })
        .await;
    }
}

fn peer_ip_of(accepted: &Accepted) -> String {
    match accepted {
        Accepted::Tcp(_, addr) => addr.ip().to_string(),
        Accepted::Uds(_) => "local".to_string(),
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
