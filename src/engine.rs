//! The engine: MIDI device manager plus the sequencer's control queue.

use crate::builder::StaveEngineBuilder;
use crate::midi::{
    self, DeviceEvent, MidiDeviceManager, MidiMessage, PortId, PortInfo, Subscription,
};
use crate::sequencer::{
    ControlReceiver, MidiEventSink, PassthroughHandler, SchedulerConfig, SequencerHandle,
    StepScheduler,
};
use parking_lot::Mutex;
use tracing::{error, warn};

/// Owns the MIDI side and the control end of the sequencer.
///
/// The scheduler itself lives on the audio thread: take it once with
/// [`StaveEngine::scheduler`] and call `process` from the render callback.
pub struct StaveEngine {
    midi: Option<MidiDeviceManager>,
    midi_error: Option<midi::Error>,
    sequencer: SequencerHandle,
    receiver: Mutex<Option<ControlReceiver>>,
    scheduler_config: SchedulerConfig,
}

impl StaveEngine {
    pub fn builder() -> StaveEngineBuilder {
        StaveEngineBuilder::default()
    }

    pub(crate) fn from_parts(
        midi: Option<MidiDeviceManager>,
        midi_error: Option<midi::Error>,
        sequencer: SequencerHandle,
        receiver: ControlReceiver,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            midi,
            midi_error,
            sequencer,
            receiver: Mutex::new(Some(receiver)),
            scheduler_config,
        }
    }

    /// Get the MIDI subsystem handle.
    ///
    /// Returns a handle that works whether or not MIDI is enabled.
    /// Methods are no-ops when MIDI is disabled.
    pub fn midi(&self) -> MidiHandle {
        MidiHandle::new(self.midi.clone())
    }

    /// Why MIDI failed to come up, if it did.
    pub fn midi_error(&self) -> Option<&midi::Error> {
        self.midi_error.as_ref()
    }

    /// Control-side handle to the scheduler. Clone freely.
    pub fn sequencer(&self) -> SequencerHandle {
        self.sequencer.clone()
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler_config
    }

    /// Build the step scheduler around the engine's control queue.
    ///
    /// There is one queue, so this succeeds once; later calls return `None`.
    pub fn scheduler<S, P>(&self, sink: S, passthrough: P) -> Option<StepScheduler<S, P>>
    where
        S: MidiEventSink,
        P: PassthroughHandler,
    {
        let Some(receiver) = self.receiver.lock().take() else {
            warn!("Scheduler already taken");
            return None;
        };
        match StepScheduler::new(self.scheduler_config.clone(), receiver, sink, passthrough) {
            Ok(scheduler) => Some(scheduler),
            Err(e) => {
                error!("Failed to create scheduler: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for StaveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaveEngine")
            .field("midi", &self.midi)
            .field("midi_error", &self.midi_error)
            .field("scheduler_taken", &self.receiver.lock().is_none())
            .finish()
    }
}

/// MIDI handle that works whether or not MIDI is available.
///
/// Queries return empty results and commands do nothing when the engine
/// has no MIDI.
#[derive(Debug, Clone)]
pub struct MidiHandle {
    manager: Option<MidiDeviceManager>,
}

impl MidiHandle {
    pub fn new(manager: Option<MidiDeviceManager>) -> Self {
        Self { manager }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.manager.is_some()
    }

    pub fn manager(&self) -> Option<&MidiDeviceManager> {
        self.manager.as_ref()
    }

    pub fn inputs(&self) -> Vec<PortInfo> {
        self.manager.as_ref().map(|m| m.inputs()).unwrap_or_default()
    }

    pub fn outputs(&self) -> Vec<PortInfo> {
        self.manager.as_ref().map(|m| m.outputs()).unwrap_or_default()
    }

    pub fn port(&self, id: &PortId) -> Option<PortInfo> {
        self.manager.as_ref().and_then(|m| m.port(id))
    }

    /// Returns `Ok(false)` without MIDI.
    pub fn listen(&self, id: &PortId) -> midi::Result<bool> {
        match &self.manager {
            Some(manager) => manager.listen(id),
            None => Ok(false),
        }
    }

    pub fn stop_listening(&self, id: &PortId) -> bool {
        self.manager
            .as_ref()
            .is_some_and(|m| m.stop_listening(id))
    }

    pub fn is_listening(&self, id: &PortId) -> bool {
        self.manager.as_ref().is_some_and(|m| m.is_listening(id))
    }

    pub fn listening(&self) -> Vec<PortId> {
        self.manager
            .as_ref()
            .map(|m| m.listening())
            .unwrap_or_default()
    }

    /// Send raw bytes to output `id`. Dropped without MIDI.
    pub fn send(&self, id: &PortId, data: &[u8]) -> midi::Result<()> {
        match &self.manager {
            Some(manager) => manager.send(id, data),
            None => Ok(()),
        }
    }

    /// `None` without MIDI.
    pub fn on_midi_message<F>(&self, handler: F) -> Option<Subscription<DeviceEvent>>
    where
        F: Fn(&MidiMessage) + Send + Sync + 'static,
    {
        self.manager.as_ref().map(|m| m.on_midi_message(handler))
    }

    /// `None` without MIDI.
    pub fn on_state_change<F>(&self, handler: F) -> Option<Subscription<DeviceEvent>>
    where
        F: Fn(&PortInfo) + Send + Sync + 'static,
    {
        self.manager.as_ref().map(|m| m.on_state_change(handler))
    }
}
