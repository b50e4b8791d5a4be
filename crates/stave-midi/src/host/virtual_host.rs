//! In-process MIDI host with virtual ports.
//!
//! Ports are created and removed programmatically; every connect/disconnect
//! raises a hot-plug notification exactly like a hardware host would.
//! Messages are injected with [`VirtualMidiHost::deliver`].

use super::{clear_if_same, MidiHost};
use crate::error::{Error, Result};
use crate::port::{
    HostPort, MessageListener, PortId, PortInfo, PortState, PortStateChange, PortType,
    StateChangeListener,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A virtual port. Inputs deliver messages to the attached listener;
/// outputs record everything sent to them.
pub struct VirtualPort {
    info: PortInfo,
    state: Mutex<PortState>,
    listener: Mutex<Option<MessageListener>>,
    attach_count: AtomicUsize,
    detach_count: AtomicUsize,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl VirtualPort {
    fn new(info: PortInfo) -> Self {
        Self {
            state: Mutex::new(PortState::Connected),
            info,
            listener: Mutex::new(None),
            attach_count: AtomicUsize::new(0),
            detach_count: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &PortId {
        &self.info.id
    }

    /// Push a message into an input port. Returns `false` when no listener
    /// is attached (the message goes nowhere).
    pub fn deliver(&self, timestamp: f64, data: &[u8]) -> bool {
        // Clone out of the lock so the listener may re-enter the port.
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                listener(timestamp, data);
                true
            }
            None => false,
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Total number of `attach_listener` calls over the port's lifetime.
    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::Acquire)
    }

    /// Number of `detach_listener` calls that actually removed a listener.
    pub fn detach_count(&self) -> usize {
        self.detach_count.load(Ordering::Acquire)
    }

    /// Messages sent to an output port, oldest first.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    fn set_state(&self, state: PortState) {
        *self.state.lock() = state;
    }
}

impl HostPort for VirtualPort {
    fn info(&self) -> PortInfo {
        let mut info = self.info.clone();
        info.state = *self.state.lock();
        info
    }

    fn attach_listener(&self, listener: MessageListener) -> Result<()> {
        if self.info.port_type != PortType::Input {
            return Err(Error::MidiPort(format!(
                "cannot listen on output port '{}'",
                self.info.id
            )));
        }
        *self.listener.lock() = Some(listener);
        self.attach_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn detach_listener(&self, listener: &MessageListener) {
        let mut current = self.listener.lock();
        if current.as_ref().is_some_and(|l| Arc::ptr_eq(l, listener)) {
            *current = None;
            self.detach_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.info.port_type != PortType::Output {
            return Err(Error::MidiPort(format!(
                "cannot send to input port '{}'",
                self.info.id
            )));
        }
        if *self.state.lock() == PortState::Disconnected {
            return Err(Error::MidiDevice(format!(
                "port '{}' is disconnected",
                self.info.id
            )));
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }
}

impl std::fmt::Debug for VirtualPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPort")
            .field("id", &self.info.id)
            .field("port_type", &self.info.port_type)
            .field("state", &*self.state.lock())
            .field("has_listener", &self.has_listener())
            .finish()
    }
}

#[derive(Default)]
struct VirtualHostInner {
    ports: Mutex<Vec<Arc<VirtualPort>>>,
    state_listener: Mutex<Option<StateChangeListener>>,
    denied: Mutex<Option<Error>>,
}

/// In-process MIDI host. Clone is cheap (Arc internally).
#[derive(Clone, Default)]
pub struct VirtualMidiHost {
    inner: Arc<VirtualHostInner>,
}

impl VirtualMidiHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make enumeration fail with `error` until [`allow_access`](Self::allow_access).
    pub fn deny_access(&self, error: Error) {
        *self.inner.denied.lock() = Some(error);
    }

    pub fn allow_access(&self) {
        *self.inner.denied.lock() = None;
    }

    /// Plug in a port. A port already present under the same id and direction
    /// is replaced (a reconnect with fresh metadata).
    pub fn connect(&self, info: PortInfo) -> Arc<VirtualPort> {
        let port = Arc::new(VirtualPort::new(info));
        {
            let mut ports = self.inner.ports.lock();
            ports.retain(|p| !(p.info.id == port.info.id && p.info.port_type == port.info.port_type));
            ports.push(Arc::clone(&port));
        }
        debug!("Virtual MIDI port connected: {}", port.info.id);
        self.notify(Arc::clone(&port), PortState::Connected);
        port
    }

    pub fn connect_input(&self, id: impl Into<PortId>, name: impl Into<String>) -> Arc<VirtualPort> {
        self.connect(PortInfo::input(id, name))
    }

    pub fn connect_output(&self, id: impl Into<PortId>, name: impl Into<String>) -> Arc<VirtualPort> {
        self.connect(PortInfo::output(id, name))
    }

    /// Unplug a port. Returns `false` if no such port was connected.
    pub fn disconnect(&self, port_type: PortType, id: &PortId) -> bool {
        let removed = {
            let mut ports = self.inner.ports.lock();
            let position = ports
                .iter()
                .position(|p| &p.info.id == id && p.info.port_type == port_type);
            position.map(|i| ports.remove(i))
        };

        match removed {
            Some(port) => {
                port.set_state(PortState::Disconnected);
                debug!("Virtual MIDI port disconnected: {}", id);
                self.notify(port, PortState::Disconnected);
                true
            }
            None => false,
        }
    }

    pub fn port(&self, port_type: PortType, id: &PortId) -> Option<Arc<VirtualPort>> {
        self.inner
            .ports
            .lock()
            .iter()
            .find(|p| &p.info.id == id && p.info.port_type == port_type)
            .cloned()
    }

    /// Deliver a message on the input port `id`. Returns `false` if the port
    /// does not exist or nothing is listening on it.
    pub fn deliver(&self, id: &PortId, timestamp: f64, data: &[u8]) -> bool {
        match self.port(PortType::Input, id) {
            Some(port) => port.deliver(timestamp, data),
            None => false,
        }
    }

    fn ports_of(&self, port_type: PortType) -> Result<Vec<Arc<dyn HostPort>>> {
        if let Some(error) = self.inner.denied.lock().clone() {
            return Err(error);
        }
        Ok(self
            .inner
            .ports
            .lock()
            .iter()
            .filter(|p| p.info.port_type == port_type)
            .map(|p| Arc::clone(p) as Arc<dyn HostPort>)
            .collect())
    }

    fn notify(&self, port: Arc<VirtualPort>, state: PortState) {
        let listener = self.inner.state_listener.lock().clone();
        if let Some(listener) = listener {
            listener(PortStateChange { port, state });
        }
    }
}

impl MidiHost for VirtualMidiHost {
    fn inputs(&self) -> Result<Vec<Arc<dyn HostPort>>> {
        self.ports_of(PortType::Input)
    }

    fn outputs(&self) -> Result<Vec<Arc<dyn HostPort>>> {
        self.ports_of(PortType::Output)
    }

    fn on_state_change(&self, listener: Option<StateChangeListener>) {
        *self.inner.state_listener.lock() = listener;
    }

    fn remove_state_listener(&self, listener: &StateChangeListener) -> bool {
        clear_if_same(&mut self.inner.state_listener.lock(), listener)
    }
}

impl std::fmt::Debug for VirtualMidiHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMidiHost")
            .field("num_ports", &self.inner.ports.lock().len())
            .finish()
    }
}
