//! Peer-bus construction and connection-lifecycle helpers shared by the
//! controller and the agent: the TCP/UDS listener, the outbound connect
//! path, socket tuning, and reconnect backoff.

pub mod backoff;
pub mod keepalive;
pub mod peer;

pub use backoff::Backoff;
pub use peer::{server_peer_bus, Accepted, PeerListener};
