//! Port model and the host-side port capability.
//!
//! Ports are owned by the host environment. The core only ever holds
//! `Arc<dyn HostPort>` handles and reads metadata through them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Host-assigned port identifier, stable for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PortId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Connected,
    Disconnected,
}

/// Descriptive snapshot of a host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub id: PortId,
    pub name: String,
    pub manufacturer: String,
    pub version: String,
    pub port_type: PortType,
    pub state: PortState,
}

impl PortInfo {
    pub fn input(id: impl Into<PortId>, name: impl Into<String>) -> Self {
        Self::new(id, name, PortType::Input)
    }

    pub fn output(id: impl Into<PortId>, name: impl Into<String>) -> Self {
        Self::new(id, name, PortType::Output)
    }

    fn new(id: impl Into<PortId>, name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            manufacturer: String::new(),
            version: String::new(),
            port_type,
            state: PortState::Connected,
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn is_connected(&self) -> bool {
        self.state == PortState::Connected
    }
}

/// Callback a port invokes for every raw message it receives, with the host
/// timestamp in milliseconds and the message bytes.
pub type MessageListener = Arc<dyn Fn(f64, &[u8]) + Send + Sync>;

/// Capability interface for a port supplied by the host.
///
/// A port carries at most one attached listener at a time. Attaching while
/// one is already present replaces it.
///
/// `detach_listener` removes `listener` only if it is the one attached
/// (same `Arc`); anything else is a no-op. It may block until the host's
/// callback thread has finished, so callers must not hold locks that a
/// listener could take.
pub trait HostPort: Send + Sync {
    fn info(&self) -> PortInfo;

    fn attach_listener(&self, listener: MessageListener) -> Result<()>;

    fn detach_listener(&self, listener: &MessageListener);

    /// Send raw bytes out of an output port.
    fn send(&self, _data: &[u8]) -> Result<()> {
        Err(Error::MidiPort(format!(
            "port '{}' does not accept outgoing messages",
            self.info().id
        )))
    }
}

impl fmt::Debug for dyn HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        f.debug_struct("HostPort")
            .field("id", &info.id)
            .field("name", &info.name)
            .field("port_type", &info.port_type)
            .finish()
    }
}

/// A hot-plug notification: `port` is now in `state`.
#[derive(Clone)]
pub struct PortStateChange {
    pub port: Arc<dyn HostPort>,
    pub state: PortState,
}

impl fmt::Debug for PortStateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortStateChange")
            .field("port", &self.port.info().id)
            .field("state", &self.state)
            .finish()
    }
}

pub type StateChangeListener = Arc<dyn Fn(PortStateChange) + Send + Sync>;
