//! Thin client for this agent's calls into the controller's
//! `internal.Manager` interface, over the peer connection this agent
//! itself opened. Hand-rolled for the same reason `agent_proxy::AgentProxy`
//! is on the controller side: the interface is private to this project.

use fleet_core::Error;
use zbus::zvariant::OwnedObjectPath;

pub struct ManagerProxy<'a> {
    inner: zbus::Proxy<'a>,
}

impl<'a> ManagerProxy<'a> {
    pub async fn new(connection: &zbus::Connection, base_path: &str) -> Result<ManagerProxy<'static>, Error> {
        let proxy = zbus::Proxy::new(
            connection,
            "controller",
            format!("{base_path}/internal/manager"),
            "internal.Manager".to_string(),
        )
        .await
        .map_err(Error::Dbus)?;
        Ok(ManagerProxy { inner: proxy })
    }

    pub async fn register(&self, name: &str) -> Result<OwnedObjectPath, Error> {
        self.inner.call("Register", &(name,)).await.map_err(Error::Dbus)
    }

    pub async fn heartbeat(&self, name: &str) -> Result<(), Error> {
        self.inner.call("Heartbeat", &(name,)).await.map_err(Error::Dbus)
    }
}
