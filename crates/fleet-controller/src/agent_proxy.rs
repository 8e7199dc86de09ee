//! Thin client for the Controller's calls onto an Agent's internal
//! interface over the peer connection established at Register time.
//! This is a hand-rolled `zbus::Proxy` rather than a macro-generated one
//! (as `zbus::fdo::DBusProxy` is) because the interface is private to
//! this project and small enough that the macro's boilerplate buys
//! nothing.

use fleet_core::types::UnitInfo;
use fleet_core::Error;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

const AGENT_INTERFACE: &str = "internal.Agent";

pub struct AgentProxy<'a> {
    inner: zbus::Proxy<'a>,
}

impl<'a> AgentProxy<'a> {
    pub async fn new(connection: &zbus::Connection, base_path: &str) -> Result<AgentProxy<'static>, Error> {
        let proxy = zbus::Proxy::new(
            connection,
            "node.agent",
            format!("{base_path}/internal/agent"),
            AGENT_INTERFACE.to_string(),
        )
        .await
        .map_err(Error::Dbus)?;
        Ok(AgentProxy { inner: proxy })
    }

    pub async fn start_unit(&self, unit: &str, mode: &str) -> Result<OwnedObjectPath, Error> {
        self.inner
            .call("StartUnit", &(unit, mode))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn stop_unit(&self, unit: &str, mode: &str) -> Result<OwnedObjectPath, Error> {
        self.inner
            .call("StopUnit", &(unit, mode))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn restart_unit(&self, unit: &str, mode: &str) -> Result<OwnedObjectPath, Error> {
        self.inner
            .call("RestartUnit", &(unit, mode))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn reload_unit(&self, unit: &str, mode: &str) -> Result<OwnedObjectPath, Error> {
        self.inner
            .call("ReloadUnit", &(unit, mode))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn enable_unit_files(
        &self,
        units: &[String],
        runtime: bool,
        force: bool,
    ) -> Result<(bool, Vec<(String, String, String)>), Error> {
        self.inner
            .call("EnableUnitFiles", &(units, runtime, force))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn disable_unit_files(
        &self,
        units: &[String],
        runtime: bool,
    ) -> Result<Vec<(String, String, String)>, Error> {
        self.inner
            .call("DisableUnitFiles", &(units, runtime))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn reload(&self) -> Result<(), Error> {
        self.inner.call("Reload", &()).await.map_err(Error::Dbus)
    }

    pub async fn isolate(&self, target: &str) -> Result<(), Error> {
        self.inner
            .call("Isolate", &(target,))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn list_units(&self, pattern: Option<&str>) -> Result<Vec<UnitInfo>, Error> {
        let rows: Vec<(
            String,
            String,
            String,
            String,
            String,
            String,
            OwnedObjectPath,
            u32,
            String,
            OwnedObjectPath,
        )> = self
            .inner
            .call("ListUnits", &(pattern.unwrap_or(""),))
            .await
            .map_err(Error::Dbus)?;

        Ok(rows
            .into_iter()
            .map(|r| UnitInfo {
                id: r.0,
                description: r.1,
                load_state: r.2,
                active_state: r.3,
                sub_state: r.4,
                following: r.5,
                unit_path: r.6.to_string(),
                job_id: r.7,
                job_type: r.8,
                job_path: r.9.to_string(),
            })
            .collect())
    }

    pub async fn get_unit_properties(
        &self,
        unit: &str,
    ) -> Result<std::collections::HashMap<String, OwnedValue>, Error> {
        self.inner
            .call("GetUnitProperties", &(unit,))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn subscribe(&self, unit: &str) -> Result<(), Error> {
        self.inner
            .call("Subscribe", &(unit,))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn unsubscribe(&self, unit: &str) -> Result<(), Error> {
        self.inner
            .call("Unsubscribe", &(unit,))
            .await
            .map_err(Error::Dbus)
    }

    pub async fn freeze_unit(&self, unit: &str) -> Result<(), Error> {
        self.inner.call("FreezeUnit", &(unit,)).await.map_err(Error::Dbus)
    }

    pub async fn thaw_unit(&self, unit: &str) -> Result<(), Error> {
        self.inner.call("ThawUnit", &(unit,)).await.map_err(Error::Dbus)
    }

    pub async fn set_unit_properties(
        &self,
        unit: &str,
        runtime: bool,
        properties: Vec<(String, OwnedValue)>,
    ) -> Result<(), Error> {
        self.inner
            .call("SetUnitProperties", &(unit, runtime, properties))
            .await
            .map_err(Error::Dbus)
    }
}
