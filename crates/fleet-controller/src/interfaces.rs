//! The exported D-Bus object wrappers. Each struct owns just enough
//! shared state to answer its interface's methods; the actual bookkeeping
//! lives in the engines (`job`, `monitor`, `proxy`, `node`). Signal stubs
//! follow the `#[zbus(signal)]` declaration shape used for
//! `org.freedesktop.systemd1.Manager` elsewhere in this codebase: no body,
//! a leading `&SignalEmitter<'_>`, called as `Self::signal_name(&emitter,
//! ...)` from plain (non-`#[interface]`) impl blocks.

use crate::agent_proxy::AgentProxy;
use crate::job::{JobEngine, JobSpec};
use crate::monitor::MonitorEngine;
use crate::node::NodeRegistry;
use crate::proxy::ProxyEngine;
use fleet_core::audit::ExecutionTracker;
use fleet_core::config::LogLevel;
use fleet_core::types::NodeListEntry;
use std::sync::Arc;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};
use zbus::{fdo, interface};

pub struct ControllerInterface {
    pub(crate) nodes: Arc<NodeRegistry>,
    pub(crate) jobs: Arc<JobEngine>,
    pub(crate) monitors: Arc<MonitorEngine>,
    pub(crate) proxies: Arc<ProxyEngine>,
    pub(crate) audit: Arc<ExecutionTracker>,
    /// Absent when the binary wiring it up has no reloadable filter to
    /// offer (e.g. in tests); `SetLogLevel` then reports `NotSupported`.
    log_handle: Option<crate::controller::LogLevelHandle>,
    /// Set once, right after construction, via [`ControllerInterface::attach_controller`] —
    /// `Controller::new` builds this interface before the `Arc<Controller>` it
    /// belongs to exists, so it can't be threaded through the constructor.
    controller: std::sync::OnceLock<Arc<crate::controller::Controller>>,
}

impl ControllerInterface {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        jobs: Arc<JobEngine>,
        monitors: Arc<MonitorEngine>,
        proxies: Arc<ProxyEngine>,
        audit: Arc<ExecutionTracker>,
        log_handle: Option<crate::controller::LogLevelHandle>,
    ) -> Self {
        ControllerInterface {
            nodes,
            jobs,
            monitors,
            proxies,
            audit,
            log_handle,
            controller: std::sync::OnceLock::new(),
        }
    }

    pub fn attach_controller(&self, controller: Arc<crate::controller::Controller>) {
        let _ = self.controller.set(controller);
    }
}

#[interface(name = "org.eclipse.bluechi.Controller")]
impl ControllerInterface {
    async fn list_nodes(&self) -> Vec<NodeListEntry> {
        self.nodes.list().await
    }

    async fn create_monitor(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> fdo::Result<OwnedObjectPath> {
        let owner = header
            .sender()
            .map(|s| s.to_string())
            .unwrap_or_default();
        let (id, path) = self.monitors.create_monitor(owner).await;
        if let Some(controller) = self.controller.get() {
            if let Err(e) = controller.publish_monitor(id, path.clone()).await {
                tracing::warn!(error = %e, "failed to publish monitor object");
            }
        }
        Ok(path)
    }

    async fn create_proxy(&self, requesting_node: String, target_node: String, target_unit: String) -> fdo::Result<OwnedObjectPath> {
        self.proxies
            .create_proxy(requesting_node, target_node, target_unit)
            .await
            .map_err(Into::into)
    }

    async fn remove_proxy(&self, proxy_id: u32) -> fdo::Result<()> {
        self.proxies.remove_proxy(proxy_id).await.map_err(Into::into)
    }

    async fn get_node(&self, name: String) -> fdo::Result<OwnedObjectPath> {
        self.nodes
            .object_path_of(&name)
            .await
            .ok_or_else(|| fdo::Error::ServiceUnknown(format!("node {name} is not registered")))
    }

    /// Resumes recording into `ListRecentJobs`; has no effect on jobs
    /// already in flight.
    async fn enable_metrics(&self) {
        self.audit.set_enabled(true);
    }

    async fn disable_metrics(&self) {
        self.audit.set_enabled(false);
    }

    async fn set_log_level(&self, level: String) -> fdo::Result<()> {
        let parsed = LogLevel::parse(&level)
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("invalid log level: {level}")))?;
        let Some(handle) = &self.log_handle else {
            return Err(fdo::Error::NotSupported(
                "this process was started without a reloadable log filter".to_string(),
            ));
        };
        handle
            .reload(tracing_subscriber::EnvFilter::new(parsed.as_tracing_filter()))
            .map_err(|e| fdo::Error::Failed(format!("failed to reload log filter: {e}")))
    }

    /// Ambient: the most recent terminal job outcomes, newest first. Not
    /// part of the control path — purely diagnostic.
    async fn list_recent_jobs(&self) -> Vec<(String, String, String, u64)> {
        self.audit
            .recent()
            .into_iter()
            .map(|r| (r.job_type, r.node.unwrap_or_default(), r.result, r.finished_at_micros))
            .collect()
    }

    #[zbus(signal)]
    pub async fn job_new(emitter: &SignalEmitter<'_>, id: u32, job: ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn job_state_changed(emitter: &SignalEmitter<'_>, job: ObjectPath<'_>, state: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn job_removed(
        emitter: &SignalEmitter<'_>,
        id: u32,
        job: ObjectPath<'_>,
        job_type: &str,
        node: &str,
        result: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn node_connected(emitter: &SignalEmitter<'_>, name: &str, node: ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn node_disconnected(emitter: &SignalEmitter<'_>, name: &str, node: ObjectPath<'_>) -> zbus::Result<()>;
}

/// The per-job public object at `<base>/job/<id>`, published for the
/// duration of a job's run and removed once it reaches a terminal state.
/// Mirrors `ControllerInterface`'s own `JobNew`/`JobStateChanged`/
/// `JobRemoved` signals with a real object whose `State` property can be
/// watched directly.
pub struct JobInterface {
    job_type: String,
    state: std::sync::Mutex<String>,
}

impl JobInterface {
    pub fn new(job_type: String, state: &str) -> Self {
        JobInterface {
            job_type,
            state: std::sync::Mutex::new(state.to_string()),
        }
    }

    pub fn set_state(&self, state: &str) {
        *self.state.lock().expect("job interface mutex poisoned") = state.to_string();
    }
}

#[interface(name = "org.eclipse.bluechi.Job")]
impl JobInterface {
    #[zbus(property)]
    async fn job_type(&self) -> String {
        self.job_type.clone()
    }

    #[zbus(property)]
    async fn state(&self) -> String {
        self.state.lock().expect("job interface mutex poisoned").clone()
    }
}

pub struct NodeInterface {
    name: String,
    nodes: Arc<NodeRegistry>,
    jobs: Arc<JobEngine>,
    base_path: String,
}

impl NodeInterface {
    pub fn new(name: String, nodes: Arc<NodeRegistry>, jobs: Arc<JobEngine>, base_path: String) -> Self {
        NodeInterface {
            name,
            nodes,
            jobs,
            base_path,
        }
    }

    async fn agent_proxy(&self) -> fdo::Result<AgentProxy<'static>> {
        let connection = self
            .nodes
            .get_agent_connection(&self.name)
            .await
            .ok_or_else(|| fdo::Error::Failed(format!("node {} is offline", self.name)))?;
        AgentProxy::new(&connection, &self.base_path)
            .await
            .map_err(Into::into)
    }
}

#[interface(name = "org.eclipse.bluechi.Node")]
impl NodeInterface {
    #[zbus(property)]
    async fn status(&self) -> String {
        if self.nodes.is_online(&self.name).await {
            "online".to_string()
        } else {
            "offline".to_string()
        }
    }

    async fn start_unit(&self, unit: String, mode: String) -> OwnedObjectPath {
        self.submit_lifecycle(fleet_core::types::JobType::StartUnit, unit, mode).await
    }

    async fn stop_unit(&self, unit: String, mode: String) -> OwnedObjectPath {
        self.submit_lifecycle(fleet_core::types::JobType::StopUnit, unit, mode).await
    }

    async fn restart_unit(&self, unit: String, mode: String) -> OwnedObjectPath {
        self.submit_lifecycle(fleet_core::types::JobType::RestartUnit, unit, mode).await
    }

    async fn reload_unit(&self, unit: String, mode: String) -> OwnedObjectPath {
        self.submit_lifecycle(fleet_core::types::JobType::ReloadUnit, unit, mode).await
    }

    async fn enable_unit_files(&self, units: Vec<String>, runtime: bool, force: bool) -> OwnedObjectPath {
        let (_, path, _) = self
            .jobs
            .submit(JobSpec::EnableUnitFiles {
                node: self.name.clone(),
                units,
                runtime,
                force,
            })
            .await;
        path
    }

    async fn disable_unit_files(&self, units: Vec<String>, runtime: bool) -> OwnedObjectPath {
        let (_, path, _) = self
            .jobs
            .submit(JobSpec::DisableUnitFiles {
                node: self.name.clone(),
                units,
                runtime,
            })
            .await;
        path
    }

    async fn reload(&self) -> OwnedObjectPath {
        let (_, path, _) = self
            .jobs
            .submit(JobSpec::DaemonReload { node: self.name.clone() })
            .await;
        path
    }

    #[allow(clippy::type_complexity)]
    async fn list_units(
        &self,
        pattern: String,
    ) -> fdo::Result<Vec<(String, String, String, String, String, String, String, u32, String, String)>> {
        let proxy = self.agent_proxy().await?;
        let units = proxy
            .list_units(if pattern.is_empty() { None } else { Some(&pattern) })
            .await?;
        Ok(units.iter().map(fleet_core::types::UnitInfo::as_tuple).collect())
    }

    async fn get_unit_properties(&self, unit: String) -> fdo::Result<std::collections::HashMap<String, OwnedValue>> {
        let proxy = self.agent_proxy().await?;
        proxy.get_unit_properties(&unit).await.map_err(Into::into)
    }

    async fn freeze_unit(&self, unit: String) -> fdo::Result<()> {
        let proxy = self.agent_proxy().await?;
        proxy.freeze_unit(&unit).await.map_err(Into::into)
    }

    async fn thaw_unit(&self, unit: String) -> fdo::Result<()> {
        let proxy = self.agent_proxy().await?;
        proxy.thaw_unit(&unit).await.map_err(Into::into)
    }

    async fn set_unit_properties(
        &self,
        unit: String,
        runtime: bool,
        properties: Vec<(String, OwnedValue)>,
    ) -> fdo::Result<()> {
        let proxy = self.agent_proxy().await?;
        proxy
            .set_unit_properties(&unit, runtime, properties)
            .await
            .map_err(Into::into)
    }

    #[zbus(property)]
    async fn last_seen_timestamp(&self) -> u64 {
        self.nodes.last_seen_micros(&self.name).await.unwrap_or(0)
    }
}

impl NodeInterface {
    async fn submit_lifecycle(&self, job_type: fleet_core::types::JobType, unit: String, mode: String) -> OwnedObjectPath {
        let (_, path, _) = self
            .jobs
            .submit(JobSpec::UnitLifecycle {
                job_type,
                node: self.name.clone(),
                unit,
                mode,
            })
            .await;
        path
    }
}

pub struct MonitorInterface {
    id: u64,
    engine: Arc<MonitorEngine>,
}

impl MonitorInterface {
    pub fn new(id: u64, engine: Arc<MonitorEngine>) -> Self {
        MonitorInterface { id, engine }
    }
}

#[interface(name = "org.eclipse.bluechi.Monitor")]
impl MonitorInterface {
    async fn subscribe(&self, node: String, unit: String) -> fdo::Result<u64> {
        self.engine
            .subscribe(self.id, node, unit)
            .await
            .ok_or_else(|| fdo::Error::Failed("monitor already closed".to_string()))
    }

    async fn subscribe_list(&self, node: String, units: Vec<String>) -> Vec<u64> {
        self.engine.subscribe_list(self.id, node, units).await
    }

    async fn unsubscribe(&self, subscription_id: u64) {
        self.engine.unsubscribe(self.id, subscription_id).await;
    }

    async fn close(&self) {
        self.engine.close(self.id).await;
    }

    #[zbus(signal)]
    pub async fn unit_new(emitter: &SignalEmitter<'_>, node: &str, unit: &str, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn unit_removed(emitter: &SignalEmitter<'_>, node: &str, unit: &str, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn unit_state_changed(
        emitter: &SignalEmitter<'_>,
        node: &str,
        unit: &str,
        active_state: &str,
        sub_state: &str,
        reason: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn unit_properties_changed(
        emitter: &SignalEmitter<'_>,
        node: &str,
        unit: &str,
        interface: &str,
        properties: std::collections::HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;
}

/// The internal interface an Agent registers against over the peer bus.
/// Never exported on the user-facing bus.
pub struct InternalManagerInterface {
    controller: Arc<crate::controller::Controller>,
    /// The address this connection was actually accepted from — never
    /// trusted from the agent's own say-so.
    peer_ip: String,
    /// The name this connection registered under, if any. One connection
    /// may only ever register once — a second `Register` call, even under
    /// a different name, is rejected rather than silently re-targeted.
    registered: tokio::sync::Mutex<Option<String>>,
}

impl InternalManagerInterface {
    pub fn new(controller: Arc<crate::controller::Controller>, peer_ip: String) -> Self {
        InternalManagerInterface {
            controller,
            peer_ip,
            registered: tokio::sync::Mutex::new(None),
        }
    }
}

#[interface(name = "internal.Manager")]
impl InternalManagerInterface {
    async fn register(
        &self,
        #[zbus(connection)] connection: &zbus::Connection,
        name: String,
    ) -> fdo::Result<OwnedObjectPath> {
        let mut registered = self.registered.lock().await;
        if registered.is_some() {
            return Err(fdo::Error::AddressInUse(
                "this connection has already registered a node".to_string(),
            ));
        }

        let path = self
            .controller
            .register_node(&name, connection.clone(), self.peer_ip.clone())
            .await
            .map_err(fdo::Error::from)?;

        *registered = Some(name);
        Ok(path)
    }

    async fn heartbeat(&self, name: String) -> fdo::Result<()> {
        if self.controller.nodes.heartbeat(&name, now_micros()).await {
            Ok(())
        } else {
            Err(fdo::Error::Failed(format!("node {name} is not registered")))
        }
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
