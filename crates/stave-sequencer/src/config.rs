//! Scheduler configuration.

use crate::{Error, Result};

/// Configuration for the step scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Tick resolution, pulses per quarter note.
    pub ppqn: u32,
    /// How far ahead of the render clock events are scheduled, in seconds.
    pub lookahead: f64,
    /// Subtracted from every note-off so it never lands on the next note-on.
    pub note_off_epsilon: f64,
    pub control_queue_capacity: usize,
    /// Upper bound on control messages drained in one quantum.
    pub max_control_messages_per_quantum: usize,
    /// Capacity of the pre-allocated event buffer.
    pub max_events_per_quantum: usize,
    /// Most ticks a single quantum will fire when the render clock has moved
    /// past more than one tick since the last call. Older ticks are skipped.
    pub max_catch_up_ticks: u32,
    /// Clip slots reserved up front, so loading new clip ids on the audio
    /// thread does not grow the table until this many exist.
    pub clip_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ppqn: 24,
            lookahead: 0.050,
            note_off_epsilon: 0.001,
            control_queue_capacity: 256,
            max_control_messages_per_quantum: 64,
            max_events_per_quantum: 256,
            max_catch_up_ticks: 64,
            clip_capacity: 64,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ppqn == 0 {
            return Err(Error::InvalidConfig("ppqn must be positive".into()));
        }
        if !self.lookahead.is_finite() || self.lookahead < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "lookahead {} must be a non-negative number of seconds",
                self.lookahead
            )));
        }
        if !self.note_off_epsilon.is_finite() || self.note_off_epsilon <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "note_off_epsilon {} must be positive",
                self.note_off_epsilon
            )));
        }
        if self.control_queue_capacity == 0
            || self.max_control_messages_per_quantum == 0
            || self.max_events_per_quantum == 0
            || self.clip_capacity == 0
        {
            return Err(Error::InvalidConfig(
                "queue and buffer capacities must be positive".into(),
            ));
        }
        if self.max_catch_up_ticks == 0 {
            return Err(Error::InvalidConfig(
                "max_catch_up_ticks must be positive".into(),
            ));
        }
        Ok(())
    }
}
