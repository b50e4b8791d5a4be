//! Audio-rate step scheduler.
//!
//! [`StepScheduler::process`] runs once per render quantum on the audio
//! thread. Each call:
//!
//! 1. drains a bounded number of control messages,
//! 2. commits a pending clip change whose time has come,
//! 3. turns the transport position at `current_time + lookahead` into a tick,
//! 4. walks every tick after the last one processed up to that tick, at most
//!    `max_catch_up_ticks` of them,
//! 5. emits a note-on/note-off pair for every note starting on each of those
//!    ticks (modulo the clip length), stamped at the tick's own time.
//!
//! `process` never blocks and never calls back into control-side code.
//! Events go into a buffer allocated up front and reach the sink in one
//! `emit_events` call per quantum. Clips arrive fully built; the one a clip
//! message replaces goes back to the control side to be freed.

use crate::clip::{Clip, DEFAULT_CLIP_ID};
use crate::config::SchedulerConfig;
use crate::control::{ControlMessage, ControlReceiver};
use crate::transport::TransportSnapshot;
use crate::Result;
use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const NOTE_ON: u8 = 0x90;
pub const NOTE_OFF: u8 = 0x80;

/// One render quantum as handed over by the audio host.
///
/// Scheduling is driven by `current_time` alone. The frame range is carried
/// for sinks and logging that want it; the scheduler does not read it, so
/// hosts whose quanta vary in size need nothing extra.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderQuantum {
    pub start_frame: u64,
    pub end_frame: u64,
    /// Render clock at the start of the quantum, seconds.
    pub current_time: f64,
}

impl RenderQuantum {
    pub fn new(start_frame: u64, end_frame: u64, current_time: f64) -> Self {
        Self {
            start_frame,
            end_frame,
            current_time,
        }
    }

    pub fn frames(&self) -> u64 {
        self.end_frame.saturating_sub(self.start_frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledEventKind {
    Midi,
}

/// A timestamped 3-byte channel message, channel 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEvent {
    pub kind: ScheduledEventKind,
    /// Render-clock time, seconds.
    pub time: f64,
    pub bytes: [u8; 3],
}

impl ScheduledEvent {
    pub fn note_on(time: f64, number: u8, velocity: u8) -> Self {
        Self {
            kind: ScheduledEventKind::Midi,
            time,
            bytes: [NOTE_ON, number, velocity],
        }
    }

    pub fn note_off(time: f64, number: u8, velocity: u8) -> Self {
        Self {
            kind: ScheduledEventKind::Midi,
            time,
            bytes: [NOTE_OFF, number, velocity],
        }
    }

    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.bytes[0] & 0xF0 == NOTE_ON
    }

    #[inline]
    pub fn is_note_off(&self) -> bool {
        self.bytes[0] & 0xF0 == NOTE_OFF
    }

    #[inline]
    pub fn note(&self) -> u8 {
        self.bytes[1]
    }
}

/// Where scheduled events go. Called on the audio thread.
pub trait MidiEventSink: Send {
    fn emit_events(&mut self, events: &[ScheduledEvent]);
}

impl MidiEventSink for Vec<ScheduledEvent> {
    fn emit_events(&mut self, events: &[ScheduledEvent]) {
        self.extend_from_slice(events);
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> MidiEventSink for FnSink<F>
where
    F: FnMut(&[ScheduledEvent]) + Send,
{
    fn emit_events(&mut self, events: &[ScheduledEvent]) {
        (self.0)(events)
    }
}

/// Forwards events over a bounded channel. Never blocks: when the channel
/// is full the event is dropped and counted.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<ScheduledEvent>,
    dropped: Arc<AtomicUsize>,
}

impl ChannelSink {
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MidiEventSink for ChannelSink {
    fn emit_events(&mut self, events: &[ScheduledEvent]) {
        for event in events {
            if self.sender.try_send(*event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A [`ChannelSink`] and the receiving end for the consumer thread.
pub fn channel_sink(capacity: usize) -> (ChannelSink, Receiver<ScheduledEvent>) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity);
    (
        ChannelSink {
            sender,
            dropped: Arc::new(AtomicUsize::new(0)),
        },
        receiver,
    )
}

/// Receives control messages of a kind the scheduler doesn't handle itself.
pub trait PassthroughHandler: Send {
    fn handle(&mut self, kind: &str, payload: &Value);
}

impl<F> PassthroughHandler for F
where
    F: FnMut(&str, &Value) + Send,
{
    fn handle(&mut self, kind: &str, payload: &Value) {
        self(kind, payload)
    }
}

/// Drops passthrough messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnorePassthrough;

impl PassthroughHandler for IgnorePassthrough {
    fn handle(&mut self, kind: &str, _payload: &Value) {
        trace!("Ignoring control message of kind '{}'", kind);
    }
}

/// A clip switch waiting for the render clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingClipChange {
    pub clip_id: String,
    pub time: f64,
}

pub struct StepScheduler<S: MidiEventSink, P: PassthroughHandler = IgnorePassthrough> {
    config: SchedulerConfig,
    control: ControlReceiver,
    sink: S,
    passthrough: P,
    clips: HashMap<String, Clip>,
    active: String,
    pending: Option<PendingClipChange>,
    transport: Option<TransportSnapshot>,
    /// Absolute tick (before the loop modulo) last processed.
    last_tick: Option<u64>,
    events: Vec<ScheduledEvent>,
}

impl<S: MidiEventSink, P: PassthroughHandler> StepScheduler<S, P> {
    pub fn new(
        config: SchedulerConfig,
        control: ControlReceiver,
        sink: S,
        passthrough: P,
    ) -> Result<Self> {
        config.validate()?;
        let mut clips = HashMap::with_capacity(config.clip_capacity);
        clips.insert(DEFAULT_CLIP_ID.to_string(), Clip::default_clip());
        let events = Vec::with_capacity(config.max_events_per_quantum);

        Ok(Self {
            config,
            control,
            sink,
            passthrough,
            clips,
            active: DEFAULT_CLIP_ID.to_string(),
            pending: None,
            transport: None,
            last_tick: None,
            events,
        })
    }

    /// Run one quantum. Returns the number of events emitted.
    pub fn process(&mut self, quantum: &RenderQuantum) -> usize {
        self.drain_control();
        self.events.clear();

        if let Some(pending) = &self.pending {
            if quantum.current_time >= pending.time {
                self.commit_pending();
            }
        }

        let Some(transport) = self.transport else {
            return 0;
        };
        let Some(clip) = self.clips.get(&self.active) else {
            return 0;
        };

        if !transport.playing {
            self.last_tick = None;
            return 0;
        }

        let ppqn = self.config.ppqn;
        let schedule_time = quantum.current_time + self.config.lookahead;
        if !transport.bar_started_by(schedule_time) {
            return 0;
        }
        let Some(tick) = transport.tick_position_at(schedule_time, ppqn) else {
            return 0;
        };

        // A transport jump backwards, or a fresh start, fires the current
        // tick only.
        let mut first = match self.last_tick {
            Some(last) if last == tick => return 0,
            Some(last) if last < tick => last + 1,
            _ => tick,
        };
        let max_ticks = self.config.max_catch_up_ticks as u64;
        if tick - first >= max_ticks {
            let skipped = tick + 1 - max_ticks - first;
            warn!("Render clock jumped; skipping {} ticks before {}", skipped, tick);
            first = tick + 1 - max_ticks;
        }

        let length = clip.length() as u64;
        let seconds_per_tick = transport.seconds_per_tick(ppqn);
        'ticks: for absolute in first..=tick {
            let clip_tick = (absolute % length) as u32;
            // Ticks already behind the render clock go out now.
            let on_time = transport
                .time_of_tick(absolute, ppqn)
                .max(quantum.current_time)
                .min(schedule_time);
            for note in clip.notes_for_tick(clip_tick) {
                if self.events.len() + 2 > self.config.max_events_per_quantum {
                    warn!("Event buffer full at tick {}, dropping notes", clip_tick);
                    break 'ticks;
                }
                let off_time = on_time + note.duration() as f64 * seconds_per_tick
                    - self.config.note_off_epsilon;
                self.events
                    .push(ScheduledEvent::note_on(on_time, note.number(), note.velocity()));
                self.events
                    .push(ScheduledEvent::note_off(off_time, note.number(), note.velocity()));
            }
        }

        self.last_tick = Some(tick);
        if !self.events.is_empty() {
            trace!("Ticks {}..={}: {} events", first, tick, self.events.len());
            self.sink.emit_events(&self.events);
        }
        self.events.len()
    }

    fn drain_control(&mut self) {
        for _ in 0..self.config.max_control_messages_per_quantum {
            let Some(message) = self.control.try_recv() else {
                break;
            };
            self.apply(message);
        }
    }

    /// Apply one control message immediately.
    pub fn apply(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Clip(clip) => self.install_clip(clip),
            ControlMessage::Play { id, time } => {
                debug!("Clip '{}' pending at {:.3}s", id, time);
                self.pending = Some(PendingClipChange { clip_id: id, time });
            }
            ControlMessage::Transport(transport) => match transport.validate() {
                Ok(()) => self.transport = Some(transport),
                Err(e) => warn!("Ignoring transport update: {}", e),
            },
            ControlMessage::Passthrough { kind, payload } => {
                self.passthrough.handle(&kind, &payload);
            }
        }
    }

    /// Swap `clip` in under its id. Only a new id allocates (its key).
    fn install_clip(&mut self, mut clip: Clip) {
        match self.clips.get_mut(clip.id()) {
            Some(slot) => {
                clip.succeed(slot);
                let replaced = std::mem::replace(slot, clip);
                debug!("Replaced clip '{}'", replaced.id());
                self.control.retire(replaced);
            }
            None => {
                if self.clips.len() == self.clips.capacity() {
                    warn!("Clip table full at {}, growing", self.clips.len());
                }
                debug!("Loaded clip '{}'", clip.id());
                self.clips.insert(clip.id().to_string(), clip);
            }
        }
    }

    fn commit_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Clip '{}' now active", pending.clip_id);
            self.active = pending.clip_id;
            // The new clip gets a fresh look at the current tick.
            self.last_tick = None;
        }
    }

    pub fn active_clip_id(&self) -> &str {
        &self.active
    }

    pub fn active_clip(&self) -> Option<&Clip> {
        self.clips.get(&self.active)
    }

    pub fn clip(&self, id: &str) -> Option<&Clip> {
        self.clips.get(id)
    }

    pub fn clip_mut(&mut self, id: &str) -> Option<&mut Clip> {
        self.clips.get_mut(id)
    }

    pub fn pending(&self) -> Option<&PendingClipChange> {
        self.pending.as_ref()
    }

    pub fn transport(&self) -> Option<&TransportSnapshot> {
        self.transport.as_ref()
    }

    pub fn last_tick(&self) -> Option<u64> {
        self.last_tick
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: MidiEventSink, P: PassthroughHandler> std::fmt::Debug for StepScheduler<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScheduler")
            .field("active", &self.active)
            .field("num_clips", &self.clips.len())
            .field("pending", &self.pending)
            .field("transport", &self.transport)
            .field("last_tick", &self.last_tick)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{ClipState, Note};
    use crate::control::{control_channel, SequencerHandle};
    use approx::assert_relative_eq;

    type VecScheduler = StepScheduler<Vec<ScheduledEvent>>;

    fn scheduler() -> (SequencerHandle, VecScheduler) {
        let config = SchedulerConfig::default();
        let (handle, receiver) = control_channel(config.control_queue_capacity);
        let scheduler = StepScheduler::new(config, receiver, Vec::new(), IgnorePassthrough).unwrap();
        (handle, scheduler)
    }

    fn one_note_clip(id: &str) -> ClipState {
        ClipState::new(96, vec![Note::new(0, 60, 6, 100).unwrap()]).with_id(id)
    }

    #[test]
    fn test_starts_with_default_clip() {
        let (_, scheduler) = scheduler();
        assert_eq!(scheduler.active_clip_id(), DEFAULT_CLIP_ID);
        assert_eq!(scheduler.active_clip().unwrap().length(), 96);
    }

    #[test]
    fn test_silent_without_transport() {
        let (handle, mut scheduler) = scheduler();
        handle.load_clip(one_note_clip(DEFAULT_CLIP_ID), None).unwrap();
        assert_eq!(scheduler.process(&RenderQuantum::new(0, 128, 0.0)), 0);
        assert!(scheduler.sink().is_empty());
    }

    #[test]
    fn test_emits_note_pair_at_lookahead() {
        let (handle, mut scheduler) = scheduler();
        handle.load_clip(one_note_clip(DEFAULT_CLIP_ID), None).unwrap();
        handle.set_transport(TransportSnapshot::playing(120.0, 0.05)).unwrap();

        // Render time 0.0 + 50 ms lookahead lands exactly on the bar start.
        assert_eq!(scheduler.process(&RenderQuantum::new(0, 128, 0.0)), 2);

        let events = scheduler.sink();
        assert!(events[0].is_note_on());
        assert_eq!(events[0].bytes, [0x90, 60, 100]);
        assert_relative_eq!(events[0].time, 0.05);
        assert!(events[1].is_note_off());
        assert_eq!(events[1].bytes, [0x80, 60, 100]);
        // 6 ticks at 120 BPM / 24 PPQN = 125 ms, minus 1 ms.
        assert_relative_eq!(events[1].time, 0.05 + 0.125 - 0.001, epsilon = 1e-9);
    }

    #[test]
    fn test_same_tick_is_processed_once() {
        let (handle, mut scheduler) = scheduler();
        handle.load_clip(one_note_clip(DEFAULT_CLIP_ID), None).unwrap();
        handle.set_transport(TransportSnapshot::playing(120.0, 0.05)).unwrap();

        let quantum = RenderQuantum::new(0, 128, 0.0);
        assert_eq!(scheduler.process(&quantum), 2);
        assert_eq!(scheduler.process(&quantum), 0);
        assert_eq!(scheduler.sink().len(), 2);
    }

    #[test]
    fn test_bar_in_the_future_is_silent() {
        let (handle, mut scheduler) = scheduler();
        handle.load_clip(one_note_clip(DEFAULT_CLIP_ID), None).unwrap();
        handle.set_transport(TransportSnapshot::playing(120.0, 1.0)).unwrap();
        assert_eq!(scheduler.process(&RenderQuantum::new(0, 128, 0.5)), 0);
        assert_eq!(scheduler.last_tick(), None);
    }

    #[test]
    fn test_pending_clip_commits_on_time() {
        let (handle, mut scheduler) = scheduler();
        handle.load_clip(one_note_clip("b"), None).unwrap();
        handle.play("b", 1.0).unwrap();

        scheduler.process(&RenderQuantum::new(0, 128, 0.5));
        assert_eq!(scheduler.active_clip_id(), DEFAULT_CLIP_ID);
        assert!(scheduler.pending().is_some());

        scheduler.process(&RenderQuantum::new(128, 256, 1.0));
        assert_eq!(scheduler.active_clip_id(), "b");
        assert!(scheduler.pending().is_none());
    }

    #[test]
    fn test_play_unknown_clip_is_silent() {
        let (handle, mut scheduler) = scheduler();
        handle.set_transport(TransportSnapshot::playing(120.0, 0.0)).unwrap();
        handle.play("missing", 0.0).unwrap();
        assert_eq!(scheduler.process(&RenderQuantum::new(0, 128, 0.0)), 0);
        assert_eq!(scheduler.active_clip_id(), "missing");
    }

    #[test]
    fn test_passthrough_reaches_handler() {
        let config = SchedulerConfig::default();
        let (handle, receiver) = control_channel(8);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut scheduler = StepScheduler::new(
            config,
            receiver,
            Vec::new(),
            move |kind: &str, payload: &Value| {
                let _ = tx.send((kind.to_string(), payload.clone()));
            },
        )
        .unwrap();

        handle
            .post_json(serde_json::json!({"kind": "param", "value": 1}))
            .unwrap();
        scheduler.process(&RenderQuantum::new(0, 128, 0.0));
        let (kind, payload) = rx.try_recv().unwrap();
        assert_eq!(kind, "param");
        assert_eq!(payload["value"], 1);
    }

    #[test]
    fn test_control_drain_is_bounded() {
        let config = SchedulerConfig {
            max_control_messages_per_quantum: 2,
            ..Default::default()
        };
        let (handle, receiver) = control_channel(8);
        let mut scheduler =
            StepScheduler::new(config, receiver, Vec::new(), IgnorePassthrough).unwrap();
        for i in 0..5 {
            handle.play(format!("clip-{}", i), 100.0).unwrap();
        }

        scheduler.process(&RenderQuantum::new(0, 128, 0.0));
        assert_eq!(handle.pending(), 3);
        assert_eq!(scheduler.pending().unwrap().clip_id, "clip-1");
    }

    #[test]
    fn test_event_buffer_is_bounded() {
        let config = SchedulerConfig {
            max_events_per_quantum: 4,
            ..Default::default()
        };
        let (handle, receiver) = control_channel(8);
        let mut scheduler =
            StepScheduler::new(config, receiver, Vec::new(), IgnorePassthrough).unwrap();
        let chord: Vec<Note> = (60..64).map(|n| Note::new(0, n, 6, 100).unwrap()).collect();
        handle
            .load_clip(ClipState::new(96, chord), Some(DEFAULT_CLIP_ID))
            .unwrap();
        handle.set_transport(TransportSnapshot::playing(120.0, 0.05)).unwrap();

        assert_eq!(scheduler.process(&RenderQuantum::new(0, 128, 0.0)), 4);
    }

    fn every_tick_clip() -> ClipState {
        let notes = (0..96).map(|tick| Note::new(tick, 60, 1, 100).unwrap()).collect();
        ClipState::new(96, notes).with_id(DEFAULT_CLIP_ID)
    }

    fn note_on_times(events: &[ScheduledEvent]) -> Vec<f64> {
        events.iter().filter(|e| e.is_note_on()).map(|e| e.time).collect()
    }

    #[test]
    fn test_long_quantum_fires_every_tick_it_crossed() {
        let (handle, mut scheduler) = scheduler();
        handle.load_clip(every_tick_clip(), None).unwrap();
        handle.set_transport(TransportSnapshot::playing(120.0, 0.05)).unwrap();

        assert_eq!(scheduler.process(&RenderQuantum::new(0, 128, 0.0)), 2);
        // 0.1 s later the lookahead edge is past tick 4: ticks 1 to 4 fire.
        assert_eq!(scheduler.process(&RenderQuantum::new(4800, 4928, 0.1)), 8);
        assert_eq!(scheduler.last_tick(), Some(4));

        let times = note_on_times(scheduler.sink());
        assert_eq!(times.len(), 5);
        // Ticks 1 and 2 were already due: they go out at the render clock.
        assert_relative_eq!(times[1], 0.1);
        assert_relative_eq!(times[2], 0.1);
        assert_relative_eq!(times[3], 0.05 + 3.0 / 48.0, epsilon = 1e-9);
        assert_relative_eq!(times[4], 0.05 + 4.0 / 48.0, epsilon = 1e-9);
    }

    #[test]
    fn test_catch_up_is_capped() {
        let config = SchedulerConfig {
            max_catch_up_ticks: 4,
            ..Default::default()
        };
        let (handle, receiver) = control_channel(8);
        let mut scheduler =
            StepScheduler::new(config, receiver, Vec::new(), IgnorePassthrough).unwrap();
        handle.load_clip(every_tick_clip(), None).unwrap();
        handle.set_transport(TransportSnapshot::playing(120.0, 0.05)).unwrap();

        scheduler.process(&RenderQuantum::new(0, 128, 0.0));
        scheduler.process(&RenderQuantum::new(480_000, 480_128, 10.0));

        assert_eq!(note_on_times(scheduler.sink()).len(), 1 + 4);
        let last = scheduler.last_tick().unwrap();
        assert!(last >= 479);
    }

    #[test]
    fn test_clock_moving_backwards_fires_current_tick_only() {
        let (handle, mut scheduler) = scheduler();
        handle.load_clip(every_tick_clip(), None).unwrap();
        handle.set_transport(TransportSnapshot::playing(120.0, 0.05)).unwrap();

        assert_eq!(scheduler.process(&RenderQuantum::new(48_000, 48_128, 1.0)), 2);
        assert_eq!(scheduler.process(&RenderQuantum::new(24_000, 24_128, 0.5)), 2);
        assert_eq!(note_on_times(scheduler.sink()).len(), 2);
    }

    #[test]
    fn test_replaced_clip_is_returned_to_control_side() {
        let (handle, mut scheduler) = scheduler();
        let flag = scheduler.active_clip().unwrap().render_flag();
        flag.clear();

        handle.load_clip(one_note_clip(DEFAULT_CLIP_ID), None).unwrap();
        scheduler.process(&RenderQuantum::new(0, 128, 0.0));

        assert_eq!(scheduler.active_clip().unwrap().len(), 1);
        // The renderer's flag carries over to the new clip.
        assert!(flag.needs_render());
        assert_eq!(handle.collect_garbage(), 1);

        handle.load_clip(one_note_clip("other"), None).unwrap();
        scheduler.process(&RenderQuantum::new(128, 256, 0.0));
        assert!(scheduler.clip("other").is_some());
        assert_eq!(handle.collect_garbage(), 0);
    }

    #[test]
    fn test_invalid_transport_is_ignored() {
        let (_, mut scheduler) = scheduler();
        scheduler.apply(ControlMessage::Transport(TransportSnapshot::playing(120.0, 0.0)));
        scheduler.apply(ControlMessage::Transport(TransportSnapshot::playing(0.0, 0.0)));
        scheduler.apply(ControlMessage::Transport(TransportSnapshot {
            time_sig_numerator: 0,
            ..TransportSnapshot::playing(90.0, 0.0)
        }));
        assert_eq!(scheduler.transport().unwrap().tempo, 120.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_, receiver) = control_channel(1);
        let config = SchedulerConfig {
            ppqn: 0,
            ..Default::default()
        };
        assert!(StepScheduler::new(config, receiver, Vec::new(), IgnorePassthrough).is_err());
    }

    #[test]
    fn test_channel_sink_counts_drops() {
        let (mut sink, receiver) = channel_sink(1);
        sink.emit_events(&[
            ScheduledEvent::note_on(0.0, 60, 100),
            ScheduledEvent::note_off(0.1, 60, 100),
        ]);
        assert_eq!(receiver.len(), 1);
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_fn_sink() {
        let mut count = 0;
        {
            let mut sink = FnSink(|events: &[ScheduledEvent]| count += events.len());
            sink.emit_events(&[ScheduledEvent::note_on(0.0, 60, 100)]);
        }
        assert_eq!(count, 1);
    }
}
