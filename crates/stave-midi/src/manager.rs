//! MIDI Device Manager
//!
//! Bridges host hot-plug notifications and per-port raw messages into one
//! subscription surface. Registry mutation, the active-listen set and
//! listener attach happen under a single manager lock, so notifications for
//! the same port are applied one at a time in the order they arrive.
//! Host-side detaches and event emission run after the lock is released.
//!
//! Every attached listener carries its own liveness flag. Detaching clears
//! the flag under the lock, before the host listener is removed, so a message
//! already in flight on the host side is dropped instead of reaching
//! consumers. The host detach names the listener it removes, so a `listen`
//! that slips in before it runs is not undone.

use crate::emitter::{EventEmitter, EventMap, Subscription};
use crate::error::{Error, Result};
use crate::host::MidiHost;
use crate::message::MidiMessage;
use crate::port::{
    HostPort, MessageListener, PortId, PortInfo, PortState, PortStateChange, PortType,
    StateChangeListener,
};
use crate::registry::PortRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceManagerConfig {
    /// Attach a listener to every input as soon as it appears.
    pub listen_by_default: bool,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            listen_by_default: true,
        }
    }
}

/// Channel names of the manager's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    MidiMessage,
    StateChange,
}

impl DeviceEventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceEventKind::MidiMessage => "midimessage",
            DeviceEventKind::StateChange => "statechange",
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A raw message from any listened input.
    MidiMessage(MidiMessage),
    /// A port was connected or disconnected.
    StateChange(PortInfo),
}

impl EventMap for DeviceEvent {
    type Name = DeviceEventKind;

    fn name(&self) -> DeviceEventKind {
        match self {
            DeviceEvent::MidiMessage(_) => DeviceEventKind::MidiMessage,
            DeviceEvent::StateChange(_) => DeviceEventKind::StateChange,
        }
    }
}

/// An attached listener and its liveness flag.
struct Listening {
    live: Arc<AtomicBool>,
    listener: MessageListener,
}

type ListenSet = HashMap<PortId, Listening>;

/// A listener already taken out of the listen set whose host-side detach is
/// still due. Run it after the manager lock is released: a host may block in
/// `detach_listener` until its callback thread finishes.
#[must_use]
struct PendingDetach {
    port: Option<Arc<dyn HostPort>>,
    listener: MessageListener,
}

impl PendingDetach {
    fn run(self) {
        if let Some(port) = self.port {
            port.detach_listener(&self.listener);
        }
    }
}

struct ManagerInner {
    host: Arc<dyn MidiHost>,
    config: DeviceManagerConfig,
    registry: PortRegistry,
    listening: Mutex<ListenSet>,
    events: EventEmitter<DeviceEvent>,
    /// The hot-plug listener this manager installed on `host`.
    state_listener: StateChangeListener,
}

impl ManagerInner {
    fn message_listener(&self, port_id: PortId, live: Arc<AtomicBool>) -> MessageListener {
        let events = self.events.clone();
        Arc::new(move |timestamp: f64, data: &[u8]| {
            if !live.load(Ordering::Acquire) {
                return;
            }
            events.emit(&DeviceEvent::MidiMessage(MidiMessage::new(
                port_id.clone(),
                timestamp,
                data,
            )));
        })
    }

    /// Attach to a registered input. `Ok(false)` if already listening.
    fn attach(&self, listening: &mut ListenSet, id: &PortId) -> Result<bool> {
        if listening.contains_key(id) {
            return Ok(false);
        }
        let port = self
            .registry
            .get_input(id)
            .ok_or_else(|| Error::UnknownPort(id.to_string()))?;

        let live = Arc::new(AtomicBool::new(true));
        let listener = self.message_listener(id.clone(), Arc::clone(&live));
        port.attach_listener(Arc::clone(&listener))?;
        listening.insert(id.clone(), Listening { live, listener });
        debug!("Listening on MIDI input: {}", id);
        Ok(true)
    }

    /// Take `id` out of the listen set and silence its listener. `None` if it
    /// was not listening. The host-side detach is left to the caller.
    fn unlisten(
        &self,
        listening: &mut ListenSet,
        id: &PortId,
        port: Option<Arc<dyn HostPort>>,
    ) -> Option<PendingDetach> {
        let entry = listening.remove(id)?;
        entry.live.store(false, Ordering::Release);
        debug!("Stopped listening on MIDI input: {}", id);
        Some(PendingDetach {
            port,
            listener: entry.listener,
        })
    }

    fn attach_by_default(&self, listening: &mut ListenSet, id: &PortId) {
        if !self.config.listen_by_default {
            return;
        }
        if let Err(e) = self.attach(listening, id) {
            warn!("Failed to listen on MIDI input {}: {}", id, e);
        }
    }

    fn handle_state_change(&self, change: PortStateChange) {
        let mut info = change.port.info();
        info.state = change.state;

        let pending = {
            let mut listening = self.listening.lock();
            match change.state {
                PortState::Connected => {
                    let stale = self.registry.upsert(Arc::clone(&change.port));
                    let mut pending = None;
                    if info.port_type == PortType::Input {
                        // A reconnect may hand us a new port object; the old
                        // listener belongs to the stale one.
                        if let Some(stale) = stale.filter(|old| !same_port(old, &change.port)) {
                            pending = self.unlisten(&mut listening, &info.id, Some(stale));
                        }
                        self.attach_by_default(&mut listening, &info.id);
                    }
                    info!("MIDI port connected: {} ({})", info.name, info.id);
                    pending
                }
                PortState::Disconnected => {
                    let removed = self.registry.remove(info.port_type, &info.id);
                    let mut pending = None;
                    if info.port_type == PortType::Input {
                        let port = removed.unwrap_or_else(|| Arc::clone(&change.port));
                        pending = self.unlisten(&mut listening, &info.id, Some(port));
                    }
                    info!("MIDI port disconnected: {} ({})", info.name, info.id);
                    pending
                }
            }
        };

        if let Some(pending) = pending {
            pending.run();
        }
        self.events.emit(&DeviceEvent::StateChange(info));
    }

    fn detach_all(&self) {
        let pending: Vec<PendingDetach> = {
            let mut listening = self.listening.lock();
            let ids: Vec<PortId> = listening.keys().cloned().collect();
            let mut pending = Vec::with_capacity(ids.len());
            for id in &ids {
                let port = self.registry.get_input(id);
                pending.extend(self.unlisten(&mut listening, id, port));
            }
            pending
        };
        for detach in pending {
            detach.run();
        }
    }

    fn release_host(&self) {
        self.host.remove_state_listener(&self.state_listener);
        self.detach_all();
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.release_host();
    }
}

fn same_port(a: &Arc<dyn HostPort>, b: &Arc<dyn HostPort>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Owns the port registry and the active-listen set for one host.
///
/// Clone is cheap and shares state. A host keeps a single hot-plug listener,
/// so the most recently initialized manager on a host is the one that tracks
/// hot-plug. Dropping an older manager does not unhook it.
#[derive(Clone)]
pub struct MidiDeviceManager {
    inner: Arc<ManagerInner>,
}

impl MidiDeviceManager {
    /// Enumerate the host's ports, listen on inputs (per config) and start
    /// tracking hot-plug notifications.
    ///
    /// Access failures (`AccessDenied`, `Unsupported`) come back as errors so
    /// the caller can carry on without MIDI.
    pub fn initialize(host: Arc<dyn MidiHost>, config: DeviceManagerConfig) -> Result<Self> {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let weak = weak.clone();
            let state_listener: StateChangeListener = Arc::new(move |change: PortStateChange| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_state_change(change);
                }
            });
            ManagerInner {
                host: Arc::clone(&host),
                config,
                registry: PortRegistry::new(),
                listening: Mutex::new(HashMap::new()),
                events: EventEmitter::new(),
                state_listener,
            }
        });

        // Registered before enumeration so nothing plugged in meanwhile is
        // missed; both paths upsert, so overlap is harmless.
        host.on_state_change(Some(Arc::clone(&inner.state_listener)));

        let (inputs, outputs) = match host.inputs().and_then(|i| Ok((i, host.outputs()?))) {
            Ok(ports) => ports,
            Err(e) => {
                warn!("MIDI initialization failed: {}", e);
                return Err(e);
            }
        };

        {
            let mut listening = inner.listening.lock();
            for port in outputs {
                inner.registry.upsert(port);
            }
            for port in inputs {
                let id = port.info().id;
                inner.registry.upsert(port);
                inner.attach_by_default(&mut listening, &id);
            }
        }

        info!(
            "MIDI device manager initialized: {} inputs, {} outputs",
            inner.registry.inputs().len(),
            inner.registry.outputs().len()
        );
        Ok(Self { inner })
    }

    /// Start receiving messages from input `id`.
    ///
    /// Returns `Ok(false)` if already listening (nothing is attached twice)
    /// and `Error::UnknownPort` if no such input is registered.
    pub fn listen(&self, id: &PortId) -> Result<bool> {
        let mut listening = self.inner.listening.lock();
        self.inner.attach(&mut listening, id)
    }

    /// Stop receiving messages from input `id`. No-op (`false`) if not listening.
    pub fn stop_listening(&self, id: &PortId) -> bool {
        let pending = {
            let mut listening = self.inner.listening.lock();
            let port = self.inner.registry.get_input(id);
            self.inner.unlisten(&mut listening, id, port)
        };
        match pending {
            Some(pending) => {
                pending.run();
                true
            }
            None => false,
        }
    }

    /// Apply a hot-plug notification. Hosts call this through the listener
    /// installed by [`initialize`](Self::initialize).
    pub fn handle_state_change(&self, change: PortStateChange) {
        self.inner.handle_state_change(change);
    }

    /// Send raw bytes to a registered output.
    pub fn send(&self, output: &PortId, data: &[u8]) -> Result<()> {
        let port = self
            .inner
            .registry
            .get_output(output)
            .ok_or_else(|| Error::UnknownPort(output.to_string()))?;
        port.send(data)
    }

    pub fn inputs(&self) -> Vec<PortInfo> {
        self.inner.registry.inputs()
    }

    pub fn outputs(&self) -> Vec<PortInfo> {
        self.inner.registry.outputs()
    }

    /// Look a port up in either direction, inputs first.
    pub fn port(&self, id: &PortId) -> Option<PortInfo> {
        self.inner
            .registry
            .get_input(id)
            .or_else(|| self.inner.registry.get_output(id))
            .map(|port| port.info())
    }

    pub fn is_listening(&self, id: &PortId) -> bool {
        self.inner.listening.lock().contains_key(id)
    }

    /// Ids currently in the active-listen set, sorted.
    pub fn listening(&self) -> Vec<PortId> {
        let mut ids: Vec<PortId> = self.inner.listening.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.inner.registry
    }

    /// The shared event stream (`midimessage`, `statechange`).
    pub fn events(&self) -> &EventEmitter<DeviceEvent> {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, kind: DeviceEventKind, handler: F) -> Subscription<DeviceEvent>
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    /// Subscribe to every message from every listened input.
    pub fn on_midi_message<F>(&self, handler: F) -> Subscription<DeviceEvent>
    where
        F: Fn(&MidiMessage) + Send + Sync + 'static,
    {
        self.inner.events.on(DeviceEventKind::MidiMessage, move |event| {
            if let DeviceEvent::MidiMessage(message) = event {
                handler(message);
            }
        })
    }

    pub fn on_state_change<F>(&self, handler: F) -> Subscription<DeviceEvent>
    where
        F: Fn(&PortInfo) + Send + Sync + 'static,
    {
        self.inner.events.on(DeviceEventKind::StateChange, move |event| {
            if let DeviceEvent::StateChange(info) = event {
                handler(info);
            }
        })
    }

    /// Detach every listener and stop tracking hot-plug notifications.
    /// Ports stay registered. A hot-plug listener installed since by another
    /// manager is left alone.
    pub fn shutdown(&self) {
        self.inner.release_host();
        debug!("MIDI device manager shut down");
    }
}

impl std::fmt::Debug for MidiDeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiDeviceManager")
            .field("registry", &self.inner.registry)
            .field("listening", &self.listening())
            .finish()
    }
}
