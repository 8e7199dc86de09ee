//! Top-level agent wiring: connects to the local systemd manager, dials
//! the controller, registers, and keeps a heartbeat alive. Reconnects
//! with `fleet_transport::Backoff` whenever the controller connection —
//! or just its heartbeat — drops, mirroring `Controller::run`'s
//! accept-loop-plus-sweep shape on the client side.

use crate::interface::AgentInterface;
use crate::manager_proxy::ManagerProxy;
use fleet_core::{Config, Error, Result};
use fleet_transport::Backoff;
use std::sync::Arc;
use std::time::Duration;

pub struct Agent {
    config: Arc<Config>,
    system_bus: zbus::Connection,
}

impl Agent {
    pub async fn new(config: Config) -> Result<Self> {
        let system_bus = zbus::connection::Builder::system()?.build().await?;
        Ok(Agent {
            config: Arc::new(config),
            system_bus,
        })
    }

    /// Runs forever: connects, registers, heartbeats, and on any failure
    /// backs off and tries again. Never returns except on a fatal
    /// configuration error (no controller address configured at all).
    pub async fn run(self) -> Result<()> {
        let address = self
            .config
            .controller_address
            .clone()
            .or_else(|| {
                self.config
                    .controller_host
                    .clone()
                    .map(|host| format!("{host}:{}", self.config.port))
            })
            .ok_or_else(|| Error::config("no controller address or host configured"))?;

        let mut backoff = Backoff::default();
        loop {
            match self.connect_and_serve(&address).await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    tracing::warn!(error = %e, "lost connection to controller, reconnecting");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// One connect-register-heartbeat cycle. Returns once the heartbeat
    /// task observes a failure, so the caller can apply backoff before
    /// retrying.
    async fn connect_and_serve(&self, address: &str) -> Result<()> {
        let peer_connection = fleet_transport::connect_controller(address, &self.config).await?;

        let agent_path = format!("{}/internal/agent", self.config.base_path);
        let agent_iface = AgentInterface::new(self.system_bus.clone());
        let subscribed_units = agent_iface.subscribed_units_handle();
        let unit_paths = agent_iface.unit_paths_handle();
        peer_connection
            .object_server()
            .at(agent_path.clone(), agent_iface)
            .await?;

        let manager = ManagerProxy::new(&peer_connection, &self.config.base_path).await?;
        manager.register(&self.config.node_name).await?;
        tracing::info!(node = %self.config.node_name, "registered with controller");

        let relay = {
            let system_bus = self.system_bus.clone();
            let peer_connection = peer_connection.clone();
            let agent_path = agent_path.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    crate::relay::run(system_bus, peer_connection, agent_path, subscribed_units, unit_paths).await
                {
                    tracing::warn!(error = %e, "unit signal relay task ended");
                }
            })
        };

        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let node_name = self.config.node_name.clone();
        let result = loop {
            tokio::time::sleep(heartbeat_interval).await;
            if let Err(e) = manager.heartbeat(&node_name).await {
                break Err(e);
            }
        };

        relay.abort();
        result
    }
}
