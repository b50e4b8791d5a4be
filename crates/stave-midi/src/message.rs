//! Raw MIDI messages as delivered by input ports.

use crate::port::PortId;
use midi_msg::MidiMsg;
use smallvec::SmallVec;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const CONTROL_CHANGE: u8 = 0xB0;

/// Message bytes; channel messages (3 bytes) stay inline.
pub type MessageBytes = SmallVec<[u8; 3]>;

/// A raw message received on an input port, forwarded untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct MidiMessage {
    pub port_id: PortId,
    /// Host timestamp in milliseconds.
    pub timestamp: f64,
    pub data: MessageBytes,
}

impl MidiMessage {
    pub fn new(port_id: impl Into<PortId>, timestamp: f64, data: &[u8]) -> Self {
        Self {
            port_id: port_id.into(),
            timestamp,
            data: SmallVec::from_slice(data),
        }
    }

    #[inline]
    pub fn status(&self) -> Option<u8> {
        self.data.first().map(|b| b & 0xF0)
    }

    #[inline]
    pub fn channel(&self) -> Option<u8> {
        self.data.first().map(|b| b & 0x0F)
    }

    /// Note-on with zero velocity counts as note-off.
    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.status() == Some(NOTE_ON) && self.data.get(2).is_some_and(|&v| v > 0)
    }

    #[inline]
    pub fn is_note_off(&self) -> bool {
        match self.status() {
            Some(NOTE_OFF) => true,
            Some(NOTE_ON) => self.data.get(2) == Some(&0),
            _ => false,
        }
    }

    #[inline]
    pub fn note(&self) -> Option<u8> {
        match self.status() {
            Some(NOTE_ON) | Some(NOTE_OFF) => self.data.get(1).copied(),
            _ => None,
        }
    }

    #[inline]
    pub fn velocity(&self) -> Option<u8> {
        match self.status() {
            Some(NOTE_ON) | Some(NOTE_OFF) => self.data.get(2).copied(),
            _ => None,
        }
    }

    /// Decode into a structured message.
    pub fn decode(&self) -> Result<MidiMsg, midi_msg::ParseError> {
        let (msg, _len) = MidiMsg::from_midi(&self.data)?;
        Ok(msg)
    }
}
