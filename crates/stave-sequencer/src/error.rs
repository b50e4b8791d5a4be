//! Error types for the sequencer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A clip state arrived without an id and no override id was given.
    #[error("Clip state has no id and no override id was given")]
    MissingClipId,

    #[error("Invalid clip length: {0}. Must be at least 1 tick")]
    InvalidClipLength(u32),

    #[error("Invalid note: number={number}, velocity={velocity}, duration={duration}")]
    InvalidNote {
        number: u8,
        velocity: u8,
        duration: u32,
    },

    #[error("Invalid transport: {0}")]
    InvalidTransport(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The control queue is full; the message was not sent.
    #[error("Control queue full")]
    QueueFull,

    /// The scheduler side of the control queue is gone.
    #[error("Scheduler disconnected")]
    Disconnected,

    #[error("Malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
