//! Builder for configuring and constructing a `StaveEngine`.

use crate::midi::{DeviceManagerConfig, MidiDeviceManager, MidiHost};
use crate::sequencer::{control_channel, SchedulerConfig};
use crate::{Result, StaveEngine};
use std::sync::Arc;
use tracing::{info, warn};

/// MIDI requires explicit opt-in: pass a host with `.midi_host()`, or call
/// `.hardware_midi()` (feature `midi-io`) to use the system's ports.
///
/// A MIDI host that fails to initialize (access denied, no backend) does not
/// fail the build. The engine comes up without MIDI and the cause is kept in
/// [`StaveEngine::midi_error`].
///
/// # Example
///
/// ```ignore
/// use stave::prelude::*;
///
/// let host = Arc::new(VirtualMidiHost::new());
/// let engine = StaveEngine::builder()
///     .midi_host(host)
///     .scheduler_config(SchedulerConfig { ppqn: 96, ..Default::default() })
///     .build()?;
///
/// let scheduler = engine.scheduler(Vec::new(), IgnorePassthrough).unwrap();
/// ```
#[derive(Default)]
pub struct StaveEngineBuilder {
    midi_host: Option<Arc<dyn MidiHost>>,
    device_config: DeviceManagerConfig,
    scheduler_config: SchedulerConfig,

    #[cfg(feature = "midi-io")]
    hardware_midi: bool,
}

impl StaveEngineBuilder {
    pub fn midi_host(mut self, host: Arc<dyn MidiHost>) -> Self {
        self.midi_host = Some(host);
        self
    }

    /// Use the system's MIDI ports through midir. Ignored when a host was
    /// given with `.midi_host()`.
    #[cfg(feature = "midi-io")]
    pub fn hardware_midi(mut self) -> Self {
        self.hardware_midi = true;
        self
    }

    pub fn device_config(mut self, config: DeviceManagerConfig) -> Self {
        self.device_config = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn build(self) -> Result<StaveEngine> {
        self.scheduler_config.validate()?;

        let (midi, midi_error) = match self.resolve_host() {
            Ok(Some(host)) => match MidiDeviceManager::initialize(host, self.device_config) {
                Ok(manager) => (Some(manager), None),
                Err(e) => {
                    warn!("Continuing without MIDI: {}", e);
                    (None, Some(e))
                }
            },
            Ok(None) => (None, None),
            Err(e) => {
                warn!("Continuing without MIDI: {}", e);
                (None, Some(e))
            }
        };

        let (sequencer, receiver) = control_channel(self.scheduler_config.control_queue_capacity);

        info!(
            "Stave engine built (MIDI {}, {} PPQN)",
            if midi.is_some() { "enabled" } else { "disabled" },
            self.scheduler_config.ppqn
        );

        Ok(StaveEngine::from_parts(
            midi,
            midi_error,
            sequencer,
            receiver,
            self.scheduler_config,
        ))
    }

    #[cfg(feature = "midi-io")]
    fn resolve_host(&self) -> std::result::Result<Option<Arc<dyn MidiHost>>, crate::midi::Error> {
        if let Some(host) = &self.midi_host {
            return Ok(Some(Arc::clone(host)));
        }
        if !self.hardware_midi {
            return Ok(None);
        }
        let host = crate::midi::MidirHost::new("stave")?;
        Ok(Some(Arc::new(host)))
    }

    #[cfg(not(feature = "midi-io"))]
    fn resolve_host(&self) -> std::result::Result<Option<Arc<dyn MidiHost>>, crate::midi::Error> {
        Ok(self.midi_host.clone())
    }
}
