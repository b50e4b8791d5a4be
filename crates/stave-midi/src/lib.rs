//! MIDI device core for Stave.
//!
//! Typed event emitter, port registry, and a device manager that tracks
//! hot-plug transitions and fans raw input out on one `midimessage` stream.
//!
//! Hosts are injected through [`MidiHost`]: [`VirtualMidiHost`] for
//! in-process routing and tests, `MidirHost` (feature `midi-io`) for hardware.

pub mod error;
pub use error::{Error, Result};

pub mod emitter;
pub use emitter::{EventEmitter, EventMap, Handler, Subscription};

mod port;
pub use port::{
    HostPort, MessageListener, PortId, PortInfo, PortState, PortStateChange, PortType,
    StateChangeListener,
};

mod message;
pub use message::{MessageBytes, MidiMessage, CONTROL_CHANGE, NOTE_OFF, NOTE_ON};

mod registry;
pub use registry::PortRegistry;

pub mod host;
pub use host::{MidiHost, VirtualMidiHost, VirtualPort};

#[cfg(feature = "midi-io")]
pub use host::MidirHost;

mod manager;
pub use manager::{DeviceEvent, DeviceEventKind, DeviceManagerConfig, MidiDeviceManager};

pub use midi_msg::MidiMsg;
