//! Live set of host ports, keyed by port id.
//!
//! Two maps, one per direction. Only the device manager writes; any thread
//! may read. Lookups take a read shard lock on the `DashMap`.

use crate::port::{HostPort, PortId, PortInfo, PortType};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct PortRegistry {
    inputs: DashMap<PortId, Arc<dyn HostPort>>,
    outputs: DashMap<PortId, Arc<dyn HostPort>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, port_type: PortType) -> &DashMap<PortId, Arc<dyn HostPort>> {
        match port_type {
            PortType::Input => &self.inputs,
            PortType::Output => &self.outputs,
        }
    }

    /// Insert or replace the entry for this port's id. Returns the stale
    /// entry if one was replaced.
    pub fn upsert(&self, port: Arc<dyn HostPort>) -> Option<Arc<dyn HostPort>> {
        let info = port.info();
        self.map(info.port_type).insert(info.id, port)
    }

    /// Remove an entry. Absent ids are a no-op.
    pub fn remove(&self, port_type: PortType, id: &PortId) -> Option<Arc<dyn HostPort>> {
        self.map(port_type).remove(id).map(|(_, port)| port)
    }

    pub fn get(&self, port_type: PortType, id: &PortId) -> Option<Arc<dyn HostPort>> {
        self.map(port_type).get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_input(&self, id: &PortId) -> Option<Arc<dyn HostPort>> {
        self.get(PortType::Input, id)
    }

    pub fn get_output(&self, id: &PortId) -> Option<Arc<dyn HostPort>> {
        self.get(PortType::Output, id)
    }

    pub fn contains(&self, port_type: PortType, id: &PortId) -> bool {
        self.map(port_type).contains_key(id)
    }

    /// Snapshot of the current input ports, sorted by id.
    pub fn inputs(&self) -> Vec<PortInfo> {
        Self::snapshot(&self.inputs)
    }

    /// Snapshot of the current output ports, sorted by id.
    pub fn outputs(&self) -> Vec<PortInfo> {
        Self::snapshot(&self.outputs)
    }

    fn snapshot(map: &DashMap<PortId, Arc<dyn HostPort>>) -> Vec<PortInfo> {
        let mut ports: Vec<PortInfo> = map.iter().map(|entry| entry.value().info()).collect();
        ports.sort_by(|a, b| a.id.cmp(&b.id));
        ports
    }

    pub fn input_ids(&self) -> Vec<PortId> {
        self.inputs.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inputs.clear();
        self.outputs.clear();
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("num_inputs", &self.inputs.len())
            .field("num_outputs", &self.outputs.len())
            .finish()
    }
}
