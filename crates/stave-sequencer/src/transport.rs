//! Transport snapshot supplied by the control side.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Read-only transport state as of the last control update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub playing: bool,
    /// Beats per minute.
    pub tempo: f64,
    #[serde(default = "default_numerator")]
    pub time_sig_numerator: u32,
    /// Render-clock time (seconds) at which `current_bar` started.
    pub current_bar_started: f64,
    #[serde(default)]
    pub current_bar: u32,
}

fn default_numerator() -> u32 {
    4
}

impl Default for TransportSnapshot {
    fn default() -> Self {
        Self {
            playing: false,
            tempo: 120.0,
            time_sig_numerator: 4,
            current_bar_started: 0.0,
            current_bar: 0,
        }
    }
}

impl TransportSnapshot {
    /// Playing at `tempo` BPM, bar 0 starting at `bar_started`.
    pub fn playing(tempo: f64, bar_started: f64) -> Self {
        Self {
            playing: true,
            tempo,
            current_bar_started: bar_started,
            ..Self::default()
        }
    }

    /// Reject snapshots the tick math can't use: a tempo that is not a
    /// positive finite number, a zero-beat bar, or a non-finite bar start.
    pub fn validate(&self) -> Result<()> {
        if !self.tempo.is_finite() || self.tempo <= 0.0 {
            return Err(Error::InvalidTransport(format!(
                "tempo {} must be a positive number of BPM",
                self.tempo
            )));
        }
        if self.time_sig_numerator == 0 {
            return Err(Error::InvalidTransport(
                "time signature numerator must be positive".into(),
            ));
        }
        if !self.current_bar_started.is_finite() {
            return Err(Error::InvalidTransport(format!(
                "current bar start {} is not a finite time",
                self.current_bar_started
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn seconds_per_tick(&self, ppqn: u32) -> f64 {
        60.0 / self.tempo / ppqn as f64
    }

    /// Beat position at render time `time`, counted from bar 0.
    #[inline]
    pub fn beat_position_at(&self, time: f64) -> f64 {
        let elapsed = time - self.current_bar_started;
        self.current_bar as f64 * self.time_sig_numerator as f64 + self.tempo / 60.0 * elapsed
    }

    /// Absolute tick position at render time `time`. `None` when the
    /// position is not a valid non-negative tick (bad tempo, time before
    /// the bar started).
    #[inline]
    pub fn tick_position_at(&self, time: f64, ppqn: u32) -> Option<u64> {
        let ticks = (self.beat_position_at(time) * ppqn as f64).floor();
        if ticks.is_finite() && ticks >= 0.0 {
            Some(ticks as u64)
        } else {
            None
        }
    }

    /// Render-clock time at which absolute tick `tick` starts. Inverse of
    /// [`tick_position_at`](Self::tick_position_at).
    #[inline]
    pub fn time_of_tick(&self, tick: u64, ppqn: u32) -> f64 {
        let beats = tick as f64 / ppqn as f64
            - self.current_bar as f64 * self.time_sig_numerator as f64;
        self.current_bar_started + beats * 60.0 / self.tempo
    }

    /// Whether the current bar has started by `horizon`.
    #[inline]
    pub fn bar_started_by(&self, horizon: f64) -> bool {
        self.current_bar_started <= horizon
    }
}
