//! Hardware MIDI host backed by midir.
//!
//! midir has no hot-plug stream, so [`MidirHost::rescan`] diffs the current
//! port list against the last one and raises connect/disconnect
//! notifications for the difference. Call it periodically from the control
//! thread.
//!
//! Port ids are the system port names. A second port with the same name
//! gets a ` #2` suffix, and so on.

use super::{clear_if_same, MidiHost};
use crate::error::{Error, Result};
use crate::port::{
    HostPort, MessageListener, PortId, PortInfo, PortState, PortStateChange, PortType,
    StateChangeListener,
};
use midir::{Ignore, MidiIO, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Enumerate `io`'s ports as (id, system name, port handle).
fn enumerate<T: MidiIO>(io: &T) -> Vec<(PortId, String, T::Port)> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    io.ports()
        .into_iter()
        .filter_map(|port| {
            let name = io.port_name(&port).ok()?;
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            let id = if *count == 1 {
                name.clone()
            } else {
                format!("{} #{}", name, count)
            };
            Some((PortId::from(id), name, port))
        })
        .collect()
}

fn find<T: MidiIO>(io: &T, id: &PortId) -> Result<T::Port> {
    enumerate(io)
        .into_iter()
        .find(|(port_id, _, _)| port_id == id)
        .map(|(_, _, port)| port)
        .ok_or_else(|| Error::MidiDevice(format!("MIDI port '{}' not found", id)))
}

/// An open input connection and the listener it feeds.
struct InputConnection {
    listener: MessageListener,
    connection: MidiInputConnection<()>,
}

struct MidirPort {
    client_name: String,
    info: PortInfo,
    state: Mutex<PortState>,
    input: Mutex<Option<InputConnection>>,
    /// Connections replaced by a newer attach. Closing joins midir's callback
    /// thread, so they are closed on the next detach instead of inside attach.
    replaced: Mutex<Vec<MidiInputConnection<()>>>,
    output: Mutex<Option<MidiOutputConnection>>,
}

impl MidirPort {
    fn new(client_name: &str, info: PortInfo) -> Self {
        Self {
            client_name: client_name.to_string(),
            info,
            state: Mutex::new(PortState::Connected),
            input: Mutex::new(None),
            replaced: Mutex::new(Vec::new()),
            output: Mutex::new(None),
        }
    }

    fn close_replaced(&self) {
        let replaced = std::mem::take(&mut *self.replaced.lock());
        for conn in replaced {
            conn.close();
        }
    }

    fn close(&self) {
        *self.state.lock() = PortState::Disconnected;
        let input = self.input.lock().take();
        if let Some(input) = input {
            input.connection.close();
        }
        self.close_replaced();
        let output = self.output.lock().take();
        if let Some(conn) = output {
            conn.close();
        }
    }
}

impl HostPort for MidirPort {
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

        // midir consumes the client on connect, so each connection gets its own.
        let mut midi_in = MidiInput::new(&self.client_name)?;
        midi_in.ignore(Ignore::None);
        let port = find(&midi_in, &self.info.id)?;

        let callback = Arc::clone(&listener);
        let connection = midi_in.connect(
            &port,
            &self.info.name,
            // midir stamps in microseconds
            move |stamp, data, _| callback(stamp as f64 / 1000.0, data),
            (),
        )?;

        let previous = self.input.lock().replace(InputConnection {
            listener,
            connection,
        });
        if let Some(previous) = previous {
            self.replaced.lock().push(previous.connection);
        }
        debug!("Opened MIDI input connection: {}", self.info.id);
        Ok(())
    }

    fn detach_listener(&self, listener: &MessageListener) {
        let detached = {
            let mut input = self.input.lock();
            if input
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(&current.listener, listener))
            {
                input.take()
            } else {
                None
            }
        };
        if let Some(detached) = detached {
            detached.connection.close();
            debug!("Closed MIDI input connection: {}", self.info.id);
        }
        self.close_replaced();
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.info.port_type != PortType::Output {
            return Err(Error::MidiPort(format!(
                "cannot send to input port '{}'",
                self.info.id
            )));
        }

        let mut output = self.output.lock();
        if output.is_none() {
            let midi_out = MidiOutput::new(&self.client_name)?;
            let port = find(&midi_out, &self.info.id)?;
            *output = Some(midi_out.connect(&port, &self.info.name)?);
            debug!("Opened MIDI output connection: {}", self.info.id);
        }

        match output.as_mut() {
            Some(conn) => conn
                .send(data)
                .map_err(|e| Error::MidiPort(e.to_string())),
            None => Err(Error::MidiDevice(format!(
                "MIDI output '{}' is not connected",
                self.info.id
            ))),
        }
    }
}

/// Hardware MIDI host.
pub struct MidirHost {
    client_name: String,
    inputs: Mutex<HashMap<PortId, Arc<MidirPort>>>,
    outputs: Mutex<HashMap<PortId, Arc<MidirPort>>>,
    state_listener: Mutex<Option<StateChangeListener>>,
}

impl MidirHost {
    /// Open the platform MIDI backend. Fails with `Error::Unsupported` when
    /// there is none.
    pub fn new(client_name: impl Into<String>) -> Result<Self> {
        let host = Self {
            client_name: client_name.into(),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            state_listener: Mutex::new(None),
        };
        // The first scan has no listener, so it raises nothing.
        host.rescan()?;
        Ok(host)
    }

    /// Diff the system port list against the known ports and notify
    /// connects and disconnects. Returns the number of changes.
    pub fn rescan(&self) -> Result<usize> {
        let input_ids = enumerate(&MidiInput::new(&self.client_name)?);
        let output_ids = enumerate(&MidiOutput::new(&self.client_name)?);

        let mut changes = self.diff(
            &self.inputs,
            PortType::Input,
            input_ids.into_iter().map(|(id, name, _)| (id, name)),
        );
        changes.extend(self.diff(
            &self.outputs,
            PortType::Output,
            output_ids.into_iter().map(|(id, name, _)| (id, name)),
        ));

        let count = changes.len();
        let listener = self.state_listener.lock().clone();
        if let Some(listener) = listener {
            for change in changes {
                listener(change);
            }
        }
        Ok(count)
    }

    fn diff(
        &self,
        known: &Mutex<HashMap<PortId, Arc<MidirPort>>>,
        port_type: PortType,
        current: impl Iterator<Item = (PortId, String)>,
    ) -> Vec<PortStateChange> {
        let current: HashMap<PortId, String> = current.collect();
        let mut known = known.lock();
        let mut changes = Vec::new();

        let gone: Vec<PortId> = known
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(port) = known.remove(&id) {
                port.close();
                debug!("MIDI port vanished: {}", id);
                changes.push(PortStateChange {
                    port,
                    state: PortState::Disconnected,
                });
            }
        }

        let mut added: Vec<(PortId, String)> = current
            .into_iter()
            .filter(|(id, _)| !known.contains_key(id))
            .collect();
        added.sort();
        for (id, name) in added {
            let info = match port_type {
                PortType::Input => PortInfo::input(id.clone(), name),
                PortType::Output => PortInfo::output(id.clone(), name),
            };
            let port = Arc::new(MidirPort::new(&self.client_name, info));
            known.insert(id.clone(), Arc::clone(&port));
            debug!("MIDI port appeared: {}", id);
            changes.push(PortStateChange {
                port,
                state: PortState::Connected,
            });
        }

        changes
    }

    fn ports_of(&self, known: &Mutex<HashMap<PortId, Arc<MidirPort>>>) -> Vec<Arc<dyn HostPort>> {
        let mut ports: Vec<Arc<MidirPort>> = known.lock().values().cloned().collect();
        ports.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        ports
            .into_iter()
            .map(|port| port as Arc<dyn HostPort>)
            .collect()
    }
}

impl MidiHost for MidirHost {
    fn inputs(&self) -> Result<Vec<Arc<dyn HostPort>>> {
        Ok(self.ports_of(&self.inputs))
    }

    fn outputs(&self) -> Result<Vec<Arc<dyn HostPort>>> {
        Ok(self.ports_of(&self.outputs))
    }

    fn on_state_change(&self, listener: Option<StateChangeListener>) {
        *self.state_listener.lock() = listener;
    }

    fn remove_state_listener(&self, listener: &StateChangeListener) -> bool {
        clear_if_same(&mut self.state_listener.lock(), listener)
    }
}

impl Drop for MidirHost {
    fn drop(&mut self) {
        for port in self.inputs.lock().values().chain(self.outputs.lock().values()) {
            port.close();
        }
    }
}

impl std::fmt::Debug for MidirHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidirHost")
            .field("client_name", &self.client_name)
            .field("num_inputs", &self.inputs.lock().len())
            .field("num_outputs", &self.outputs.lock().len())
            .finish()
    }
}
