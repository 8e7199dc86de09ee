//! Central error type for the fleet controller and agent.
//!
//! Mirrors the error taxonomy every component maps its failures onto:
//! transport, protocol, timeout, resource, and fatal. Interface
//! implementations translate `Error` into a `zbus::fdo::Error` at the bus
//! boundary; nothing upstream of that boundary should match on bus error
//! names directly.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error(transparent)]
    Dbus(#[from] zbus::Error),

    #[error(transparent)]
    DbusFdo(#[from] zbus::fdo::Error),

    #[error("node {0} is offline")]
    Offline(String),

    #[error("node name already in use: {0}")]
    AddressInUse(String),

    #[error("unknown node: {0}")]
    ServiceUnknown(String),

    #[error("no such subscription")]
    NoSuchSubscription,

    #[error("activation failed: {0}")]
    ActivationFailed(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }
}

/// Maps a core error onto the bus error a caller observes, per the
/// protocol-error taxonomy: callers never see `Transport`/`Resource`/`Fatal`
/// variants directly, only the `org.freedesktop.DBus.Error.*` name they map
/// to.
impl From<Error> for zbus::fdo::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::DbusFdo(e) => e,
            Error::AddressInUse(msg) => zbus::fdo::Error::AddressInUse(msg),
            Error::ServiceUnknown(msg) => zbus::fdo::Error::ServiceUnknown(msg),
            Error::InvalidArgument(msg) => zbus::fdo::Error::InvalidArgs(msg),
            Error::NoSuchSubscription => {
                zbus::fdo::Error::Failed("no such subscription".into())
            }
            Error::Offline(node) => zbus::fdo::Error::Failed(format!("{node} is offline")),
            Error::ActivationFailed(msg) => {
                zbus::fdo::Error::Failed(format!("activation failed: {msg}"))
            }
            Error::Timeout(d) => zbus::fdo::Error::Timeout(format!("timed out after {d:?}")),
            Error::Resource(msg) => zbus::fdo::Error::NoMemory(msg),
            Error::Dbus(e) => zbus::fdo::Error::Failed(e.to_string()),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}
