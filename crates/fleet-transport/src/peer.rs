//! Peer-bus construction: the TCP (and optional Unix-domain) listener the
//! controller binds, and the outbound connection the agent opens. Both
//! sides build a point-to-point `zbus` connection with no bus daemon:
//! randomized server GUID, anonymous auth, the peer marked trusted.

use fleet_core::{Config, Error, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use zbus::connection::Builder;
use zbus::{AuthMechanism, Guid};

use crate::keepalive;

/// One freshly accepted, not-yet-registered inbound connection.
pub enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Uds(UnixStream),
}

/// Binds the listeners configured for this controller instance. At least
/// one of TCP/UDS must be enabled; `UseTCP=false, UseUDS=false` is a
/// configuration error, not silently accepted.
pub struct PeerListener {
    tcp: Option<TcpListener>,
    uds: Option<UnixListener>,
}

impl PeerListener {
    pub async fn bind(config: &Config) -> Result<Self> {
        if !config.use_tcp && !config.use_uds {
            return Err(Error::config(
                "at least one of UseTCP or UseUDS must be enabled",
            ));
        }

        let tcp = if config.use_tcp {
            // Dual-stack: bind the IPv6 wildcard and accept mapped IPv4
            // peers too, matching the socket-option setup a raw `socket(2)`
            // + `bind(2)` + `listen(2)` call would give, minus the
            // `SO_REUSEADDR` toggle tokio already sets for us on Unix.
            let addr: SocketAddr = format!("[::]:{}", config.port)
                .parse()
                .expect("well-formed IPv6 wildcard address");
            Some(TcpListener::bind(addr).await.map_err(Error::Transport)?)
        } else {
            None
        };

        let uds = if config.use_uds {
            if let Some(parent) = config.uds_path.parent() {
                std::fs::create_dir_all(parent).map_err(Error::Transport)?;
            }
            let _ = std::fs::remove_file(&config.uds_path);
            let listener = UnixListener::bind(&config.uds_path).map_err(Error::Transport)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                let _ = std::fs::set_permissions(&config.uds_path, perms);
            }
            Some(listener)
        } else {
            None
        };

        Ok(PeerListener { tcp, uds })
    }

    /// Accepts the next connection from whichever listener is ready
    /// first. EAGAIN/EINTR-style transient accept errors are logged and
    /// do not terminate the listener; any other error propagates.
    pub async fn accept(&self) -> Result<Accepted> {
        match (&self.tcp, &self.uds) {
            (Some(tcp), Some(uds)) => tokio::select! {
                res = tcp.accept() => {
                    let (stream, addr) = res.map_err(Error::Transport)?;
                    Ok(Accepted::Tcp(stream, addr))
                }
                res = uds.accept() => {
                    let (stream, _) = res.map_err(Error::Transport)?;
                    Ok(Accepted::Uds(stream))
                }
            },
            (Some(tcp), None) => {
                let (stream, addr) = tcp.accept().await.map_err(Error::Transport)?;
                Ok(Accepted::Tcp(stream, addr))
            }
            (None, Some(uds)) => {
                let (stream, _) = uds.accept().await.map_err(Error::Transport)?;
                Ok(Accepted::Uds(stream))
            }
            (None, None) => unreachable!("PeerListener::bind requires at least one listener"),
        }
    }
}

/// Builds the server-side half of a peer bus over a freshly accepted
/// connection: no bus daemon, anonymous auth, the peer trusted.
pub async fn server_peer_bus(accepted: Accepted, config: &Config) -> Result<zbus::Connection> {
    let guid = Guid::generate();

    let conn = match accepted {
        Accepted::Tcp(stream, _addr) => {
            keepalive::apply(&stream, config).map_err(Error::Transport)?;
            Builder::socket(stream)
                .server(guid)
                .map_err(Error::Dbus)?
                .p2p()
                .auth_mechanisms(&[AuthMechanism::Anonymous])
                .build()
                .await
                .map_err(Error::Dbus)?
        }
        Accepted::Uds(stream) => Builder::socket(stream)
            .server(guid)
            .map_err(Error::Dbus)?
            .p2p()
            .auth_mechanisms(&[AuthMechanism::Anonymous])
            .build()
            .await
            .map_err(Error::Dbus)?,
    };

    Ok(conn)
}

/// Opens the agent's outbound connection to the controller. `address` is
/// either a bare `host:port` (IPv6 literals must be bracketed,
/// `[::1]:842`) or, if `controller_address` was set in config, a full
/// transport string of the same shape.
pub async fn connect_controller(address: &str, config: &Config) -> Result<zbus::Connection> {
    let sock_addr = resolve(address).await?;
    let stream = TcpStream::connect(sock_addr).await.map_err(Error::Transport)?;
    keepalive::apply(&stream, config).map_err(Error::Transport)?;

    let conn = Builder::socket(stream)
        .p2p()
        .auth_mechanisms(&[AuthMechanism::Anonymous])
        .build()
        .await
        .map_err(Error::Dbus)?;

    Ok(conn)
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let mut addrs = tokio::net::lookup_host(address)
        .await
        .map_err(Error::Transport)?;
    addrs
        .next()
        .ok_or_else(|| Error::config(format!("could not resolve controller address: {address}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_socket_addr_parses_without_resolution() {
        let addr: SocketAddr = "127.0.0.1:842".parse().unwrap();
        assert_eq!(addr.port(), 842);
    }

    #[tokio::test]
    async fn bind_rejects_both_transports_disabled() {
        let mut config = Config::default();
        config.use_tcp = false;
        config.use_uds = false;
        let err = PeerListener::bind(&config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
