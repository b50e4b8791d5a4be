//! Piano-roll clip model and audio-rate MIDI step scheduler for Stave.
//!
//! The control thread talks to a [`StepScheduler`] through a
//! [`SequencerHandle`]; the audio thread calls [`StepScheduler::process`]
//! once per render quantum and receives note events through a
//! [`MidiEventSink`].

pub mod error;
pub use error::{Error, Result};

mod config;
pub use config::SchedulerConfig;

pub mod clip;
pub use clip::{Clip, ClipState, Note, RenderFlag, DEFAULT_CLIP_ID, DEFAULT_CLIP_LENGTH};

mod transport;
pub use transport::TransportSnapshot;

pub mod control;
pub use control::{control_channel, ControlMessage, ControlReceiver, SequencerHandle};

pub mod scheduler;
pub use scheduler::{
    channel_sink, ChannelSink, FnSink, IgnorePassthrough, MidiEventSink, PassthroughHandler,
    PendingClipChange, RenderQuantum, ScheduledEvent, ScheduledEventKind, StepScheduler,
};
