//! The `internal.Agent` interface exported on this agent's peer
//! connection to the controller. Every method here either calls straight
//! through to the real systemd manager on this host, or (for
//! Subscribe/Unsubscribe) adjusts local bookkeeping used by the relay
//! task in `relay.rs` to decide which unit signals are worth forwarding.

use crate::local_manager::SystemdManagerProxy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{fdo, interface};

pub struct AgentInterface {
    system_bus: zbus::Connection,
    pub(crate) subscribed_units: Arc<Mutex<HashSet<String>>>,
    /// Object path (as a string) -> unit name, for every unit currently
    /// subscribed to. Lets the relay task recognize which unit a raw
    /// `PropertiesChanged` signal belongs to without re-deriving
    /// systemd's own unit-path escaping.
    pub(crate) unit_paths: Arc<Mutex<HashMap<String, String>>>,
}

impl AgentInterface {
    pub fn new(system_bus: zbus::Connection) -> Self {
        AgentInterface {
            system_bus,
            subscribed_units: Arc::new(Mutex::new(HashSet::new())),
            unit_paths: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribed_units_handle(&self) -> Arc<Mutex<HashSet<String>>> {
        self.subscribed_units.clone()
    }

    pub fn unit_paths_handle(&self) -> Arc<Mutex<HashMap<String, String>>> {
        self.unit_paths.clone()
    }

    async fn local_manager(&self) -> fdo::Result<SystemdManagerProxy<'static>> {
        SystemdManagerProxy::new(&self.system_bus).await.map_err(Into::into)
    }
}

#[interface(name = "internal.Agent")]
impl AgentInterface {
    async fn start_unit(&self, unit: String, mode: String) -> fdo::Result<OwnedObjectPath> {
        self.local_manager().await?.start_unit(&unit, &mode).await.map_err(Into::into)
    }

    async fn stop_unit(&self, unit: String, mode: String) -> fdo::Result<OwnedObjectPath> {
        self.local_manager().await?.stop_unit(&unit, &mode).await.map_err(Into::into)
    }

    async fn restart_unit(&self, unit: String, mode: String) -> fdo::Result<OwnedObjectPath> {
        self.local_manager().await?.restart_unit(&unit, &mode).await.map_err(Into::into)
    }

    async fn reload_unit(&self, unit: String, mode: String) -> fdo::Result<OwnedObjectPath> {
        self.local_manager().await?.reload_unit(&unit, &mode).await.map_err(Into::into)
    }

    #[allow(clippy::type_complexity)]
    async fn enable_unit_files(
        &self,
        units: Vec<String>,
        runtime: bool,
        force: bool,
    ) -> fdo::Result<(bool, Vec<(String, String, String)>)> {
        let manager = self.local_manager().await?;
        let refs: Vec<&str> = units.iter().map(String::as_str).collect();
        manager.enable_unit_files(&refs, runtime, force).await.map_err(Into::into)
    }

    async fn disable_unit_files(&self, units: Vec<String>, runtime: bool) -> fdo::Result<Vec<(String, String, String)>> {
        let manager = self.local_manager().await?;
        let refs: Vec<&str> = units.iter().map(String::as_str).collect();
        manager.disable_unit_files(&refs, runtime).await.map_err(Into::into)
    }

    async fn reload(&self) -> fdo::Result<()> {
        self.local_manager().await?.reload().await.map_err(Into::into)
    }

    async fn isolate(&self, target: String) -> fdo::Result<()> {
        self.local_manager()
            .await?
            .start_unit(&target, "isolate")
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn freeze_unit(&self, unit: String) -> fdo::Result<()> {
        self.local_manager().await?.freeze_unit(&unit).await.map_err(Into::into)
    }

    async fn thaw_unit(&self, unit: String) -> fdo::Result<()> {
        self.local_manager().await?.thaw_unit(&unit).await.map_err(Into::into)
    }

    async fn set_unit_properties(
        &self,
        unit: String,
        runtime: bool,
        properties: Vec<(String, OwnedValue)>,
    ) -> fdo::Result<()> {
        self.local_manager()
            .await?
            .set_unit_properties(&unit, runtime, properties)
            .await
            .map_err(Into::into)
    }

    #[allow(clippy::type_complexity)]
    async fn list_units(
        &self,
        pattern: String,
    ) -> fdo::Result<Vec<(String, String, String, String, String, String, OwnedObjectPath, u32, String, OwnedObjectPath)>> {
        let all = self.local_manager().await?.list_units().await?;
        Ok(if pattern.is_empty() {
            all
        } else {
            all.into_iter()
                .filter(|u| fleet_core::glob::matches(&u.0, &pattern))
                .collect()
        })
    }

    async fn get_unit_properties(&self, unit: String) -> fdo::Result<std::collections::HashMap<String, OwnedValue>> {
        let manager = self.local_manager().await?;
        let path = manager.get_unit(&unit).await?;
        let props = zbus::fdo::PropertiesProxy::builder(&self.system_bus)
            .destination("org.freedesktop.systemd1")?
            .path(path)?
            .build()
            .await?;
        let interface = zbus::names::InterfaceName::try_from("org.freedesktop.systemd1.Unit")
            .expect("well-formed interface name literal");
        props.get_all(interface).await.map_err(Into::into)
    }

    /// Installs the upstream `systemd1.Manager.Subscribe` exactly once,
    /// the first time any unit is of interest; later unit additions just
    /// extend the local filter set the relay task consults.
    async fn subscribe(&self, unit: String) -> fdo::Result<()> {
        let manager = self.local_manager().await?;
        let first = {
            let mut units = self.subscribed_units.lock().await;
            let first = units.is_empty();
            units.insert(unit.clone());
            first
        };
        if first {
            manager.subscribe().await?;
        }
        if let Ok(path) = manager.get_unit(&unit).await {
            self.unit_paths.lock().await.insert(path.to_string(), unit);
        }
        Ok(())
    }

    async fn unsubscribe(&self, unit: String) -> fdo::Result<()> {
        let empty = {
            let mut units = self.subscribed_units.lock().await;
            units.remove(&unit);
            units.is_empty()
        };
        self.unit_paths.lock().await.retain(|_, u| u != &unit);
        if empty {
            self.local_manager().await?.unsubscribe().await?;
        }
        Ok(())
    }

    #[zbus(signal)]
    pub async fn unit_new(emitter: &SignalEmitter<'_>, unit: &str, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn unit_removed(emitter: &SignalEmitter<'_>, unit: &str, reason: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn unit_state_changed(
        emitter: &SignalEmitter<'_>,
        unit: &str,
        active_state: &str,
        sub_state: &str,
        reason: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn unit_properties_changed(
        emitter: &SignalEmitter<'_>,
        unit: &str,
        interface_name: &str,
        properties: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn job_removed(emitter: &SignalEmitter<'_>, job: &str, result: &str) -> zbus::Result<()>;
}
