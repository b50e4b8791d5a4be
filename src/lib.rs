//! # Stave
//!
//! Real-time MIDI device core and step sequencer.
//!
//! - **MIDI** ([`midi`]): port registry, hot-plug aware device manager, and a
//!   typed event emitter fanning every listened input out on one
//!   `midimessage` stream.
//! - **Sequencer** ([`sequencer`]): piano-roll clips and an audio-rate step
//!   scheduler fed through a lock-free control queue.
//!
//! ## Quick start
//!
//! ```ignore
//! use stave::prelude::*;
//!
//! let host = Arc::new(VirtualMidiHost::new());
//! let engine = StaveEngine::builder().midi_host(host.clone()).build()?;
//!
//! let _sub = engine.midi().on_midi_message(|msg| {
//!     println!("{} {:02x?}", msg.port_id, msg.data);
//! });
//!
//! let mut scheduler = engine.scheduler(Vec::new(), IgnorePassthrough).unwrap();
//! let seq = engine.sequencer();
//! seq.load_clip(ClipState::new(96, vec![Note::new(0, 60, 6, 100)?]), Some(DEFAULT_CLIP_ID))?;
//! seq.set_transport(TransportSnapshot::playing(120.0, 0.0))?;
//!
//! // From the render callback:
//! scheduler.process(&RenderQuantum::new(0, 128, 0.0));
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `midi-io` | Hardware MIDI through midir |

mod error;
pub use error::{Error, Result};

pub use stave_midi as midi;
pub use stave_sequencer as sequencer;

pub use stave_midi::{
    DeviceEvent, DeviceEventKind, DeviceManagerConfig, MidiDeviceManager, MidiHost, MidiMessage,
    PortId, PortInfo, PortState, PortType, VirtualMidiHost,
};

#[cfg(feature = "midi-io")]
pub use stave_midi::MidirHost;

pub use stave_sequencer::{
    Clip, ClipState, ControlMessage, IgnorePassthrough, MidiEventSink, Note, PassthroughHandler,
    RenderQuantum, ScheduledEvent, SchedulerConfig, SequencerHandle, StepScheduler,
    TransportSnapshot, DEFAULT_CLIP_ID,
};

mod builder;
mod engine;

pub use builder::StaveEngineBuilder;
pub use engine::{MidiHandle, StaveEngine};

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{MidiHandle, StaveEngine, StaveEngineBuilder};

    pub use crate::{Error, Result};

    // MIDI
    pub use crate::{
        DeviceEvent, DeviceEventKind, DeviceManagerConfig, MidiHost, MidiMessage, PortId,
        PortInfo, PortState, PortType, VirtualMidiHost,
    };

    // Sequencer
    pub use crate::{
        Clip, ClipState, IgnorePassthrough, MidiEventSink, Note, RenderQuantum, ScheduledEvent,
        SchedulerConfig, SequencerHandle, StepScheduler, TransportSnapshot, DEFAULT_CLIP_ID,
    };

    pub use std::sync::Arc;
}
