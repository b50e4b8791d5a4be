//! Centralized error type for the stave umbrella crate.
//!
//! Wraps both subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("MIDI: {0}")]
    Midi(#[from] stave_midi::Error),

    #[error("Sequencer: {0}")]
    Sequencer(#[from] stave_sequencer::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
