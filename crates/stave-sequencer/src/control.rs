//! Control messages from the control thread into the scheduler.
//!
//! The control side posts, the scheduler drains with `try_recv` once per
//! quantum. Posting never blocks; a full queue is reported to the caller as
//! `Error::QueueFull`.
//!
//! Clips are built, validated and sorted here, on the control side. When the
//! scheduler swaps one in, the clip it replaced travels back on a second
//! queue and is freed by the next [`SequencerHandle::post`] or
//! [`SequencerHandle::collect_garbage`], off the audio thread.

use crate::clip::{Clip, ClipState};
use crate::transport::TransportSnapshot;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Create or replace the clip with this clip's id.
    Clip(Clip),
    /// Switch to clip `id` once the render clock reaches `time`.
    Play { id: String, time: f64 },
    Transport(TransportSnapshot),
    /// Any other kind, handed to the scheduler's passthrough handler.
    Passthrough { kind: String, payload: Value },
}

#[derive(Deserialize)]
struct ClipPayload {
    #[serde(default)]
    id: Option<String>,
    state: ClipState,
}

#[derive(Deserialize)]
struct PlayPayload {
    id: String,
    #[serde(default)]
    time: f64,
}

#[derive(Deserialize)]
struct TransportPayload {
    transport: TransportSnapshot,
}

impl ControlMessage {
    pub fn kind(&self) -> &str {
        match self {
            ControlMessage::Clip(_) => "clip",
            ControlMessage::Play { .. } => "play",
            ControlMessage::Transport(_) => "transport",
            ControlMessage::Passthrough { kind, .. } => kind.as_str(),
        }
    }

    /// Parse a `{"kind": ...}` message.
    ///
    /// Unknown or missing kinds become [`ControlMessage::Passthrough`]. A
    /// `clip` message takes its id from the message, else from the state;
    /// with neither it fails with `Error::MissingClipId`. A `transport`
    /// snapshot that fails [`TransportSnapshot::validate`] is an error.
    pub fn from_json(value: Value) -> Result<Self> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match kind.as_str() {
            "clip" => {
                let payload: ClipPayload = serde_json::from_value(value)?;
                let clip = Clip::from_state(payload.state, payload.id.as_deref())?;
                Ok(ControlMessage::Clip(clip))
            }
            "play" => {
                let payload: PlayPayload = serde_json::from_value(value)?;
                Ok(ControlMessage::Play {
                    id: payload.id,
                    time: payload.time,
                })
            }
            "transport" => {
                let payload: TransportPayload = serde_json::from_value(value)?;
                payload.transport.validate()?;
                Ok(ControlMessage::Transport(payload.transport))
            }
            _ => Ok(ControlMessage::Passthrough {
                kind,
                payload: value,
            }),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_json(serde_json::from_str(text)?)
    }
}

/// Control-side handle to a scheduler. Clone freely.
#[derive(Debug, Clone)]
pub struct SequencerHandle {
    sender: Sender<ControlMessage>,
    retired: Receiver<Clip>,
}

/// Scheduler-side end of the control queue.
#[derive(Debug)]
pub struct ControlReceiver {
    receiver: Receiver<ControlMessage>,
    retire: Sender<Clip>,
}

/// Bounded control queue between the control thread and the scheduler.
///
/// The return queue for replaced clips has the same capacity.
pub fn control_channel(capacity: usize) -> (SequencerHandle, ControlReceiver) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity);
    let (retire, retired) = crossbeam_channel::bounded(capacity);
    (
        SequencerHandle { sender, retired },
        ControlReceiver { receiver, retire },
    )
}

impl SequencerHandle {
    /// Build the clip from `state` and send it as a clip update.
    ///
    /// The id is `id` if given, else `state.id`. Invalid states are reported
    /// here and nothing is sent.
    pub fn load_clip(&self, state: ClipState, id: Option<&str>) -> Result<()> {
        let clip = match Clip::from_state(state, id) {
            Ok(clip) => clip,
            Err(e) => {
                debug!("Rejected clip update: {}", e);
                return Err(e);
            }
        };
        self.post(ControlMessage::Clip(clip))
    }

    /// Make clip `id` active once the render clock reaches `time` (seconds).
    pub fn play(&self, id: impl Into<String>, time: f64) -> Result<()> {
        self.post(ControlMessage::Play {
            id: id.into(),
            time,
        })
    }

    /// Send a transport update. Snapshots that fail
    /// [`TransportSnapshot::validate`] are rejected here and not sent.
    pub fn set_transport(&self, transport: TransportSnapshot) -> Result<()> {
        transport.validate()?;
        self.post(ControlMessage::Transport(transport))
    }

    /// Parse and post a JSON control message.
    pub fn post_json(&self, value: Value) -> Result<()> {
        self.post(ControlMessage::from_json(value)?)
    }

    pub fn post(&self, message: ControlMessage) -> Result<()> {
        self.collect_garbage();
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Disconnected(_) => Error::Disconnected,
        })
    }

    /// Messages posted but not yet drained.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Free clips the scheduler has swapped out. Returns how many.
    pub fn collect_garbage(&self) -> usize {
        self.retired.try_iter().count()
    }
}

impl ControlReceiver {
    /// Next message, if any. Never blocks.
    #[inline]
    pub fn try_recv(&self) -> Option<ControlMessage> {
        match self.receiver.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Hand a replaced clip back to the control side to be freed there.
    /// Never blocks: if the return queue is full the clip is freed here.
    pub fn retire(&self, clip: Clip) {
        if let Err(e) = self.retire.try_send(clip) {
            warn!("Retired clip queue full, freeing on the audio thread");
            drop(e.into_inner());
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::Note;
    use serde_json::json;

    #[test]
    fn test_from_json_clip() {
        let message = ControlMessage::from_json(json!({
            "kind": "clip",
            "id": "lead",
            "state": {"length": 48, "notes": [{"tick": 0, "number": 60, "duration": 6, "velocity": 100}]}
        }))
        .unwrap();

        match message {
            ControlMessage::Clip(clip) => {
                assert_eq!(clip.id(), "lead");
                assert_eq!(clip.length(), 48);
                assert_eq!(clip.notes(), &[Note::new(0, 60, 6, 100).unwrap()]);
            }
            other => panic!("Expected Clip, got {:?}", other),
        }
    }

    #[test]
    fn test_from_json_clip_id_from_state() {
        let message = ControlMessage::from_json(json!({
            "kind": "clip",
            "state": {"id": "pad", "length": 16}
        }))
        .unwrap();
        assert!(matches!(message, ControlMessage::Clip(ref clip) if clip.id() == "pad"));
    }

    #[test]
    fn test_from_json_clip_without_id() {
        let result = ControlMessage::from_json(json!({
            "kind": "clip",
            "state": {"notes": []}
        }));
        assert!(matches!(result, Err(Error::MissingClipId)));
    }

    #[test]
    fn test_from_json_clip_arrives_sorted() {
        let message = ControlMessage::from_json(json!({
            "kind": "clip",
            "id": "lead",
            "state": {"notes": [
                {"tick": 12, "number": 62, "duration": 1, "velocity": 100},
                {"tick": 0, "number": 60, "duration": 1, "velocity": 100},
                {"tick": 12, "number": 62, "duration": 4, "velocity": 50}
            ]}
        }))
        .unwrap();
        let ControlMessage::Clip(clip) = message else {
            panic!("Expected Clip");
        };
        let ticks: Vec<u32> = clip.notes().iter().map(|n| n.tick()).collect();
        assert_eq!(ticks, vec![0, 12]);
        assert_eq!(clip.notes()[1].duration(), 1);
    }

    #[test]
    fn test_from_json_clip_with_invalid_note() {
        let result = ControlMessage::from_json(json!({
            "kind": "clip",
            "id": "lead",
            "state": {"notes": [{"tick": 0, "number": 60, "duration": 0, "velocity": 100}]}
        }));
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_invalid_transport_is_rejected() {
        let result = ControlMessage::from_json(json!({
            "kind": "transport",
            "transport": {"playing": true, "tempo": 0.0, "currentBarStarted": 0.0}
        }));
        assert!(matches!(result, Err(Error::InvalidTransport(_))));

        let result = ControlMessage::from_json(json!({
            "kind": "transport",
            "transport": {"playing": true, "tempo": 120.0, "timeSigNumerator": 0, "currentBarStarted": 0.0}
        }));
        assert!(matches!(result, Err(Error::InvalidTransport(_))));

        let (handle, receiver) = control_channel(4);
        let result = handle.set_transport(TransportSnapshot::playing(f64::NAN, 0.0));
        assert!(matches!(result, Err(Error::InvalidTransport(_))));
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_retired_clips_are_freed_by_the_handle() {
        let (handle, receiver) = control_channel(2);
        receiver.retire(Clip::new("a", 4).unwrap());
        receiver.retire(Clip::new("b", 4).unwrap());
        // Full: freed in place instead of blocking.
        receiver.retire(Clip::new("c", 4).unwrap());

        assert_eq!(handle.collect_garbage(), 2);
        assert_eq!(handle.collect_garbage(), 0);

        receiver.retire(Clip::new("d", 4).unwrap());
        handle.play("a", 0.0).unwrap();
        assert_eq!(handle.collect_garbage(), 0);
    }

    #[test]
    fn test_from_json_play_and_transport() {
        let play = ControlMessage::from_json(json!({"kind": "play", "id": "b", "time": 2.5})).unwrap();
        assert_eq!(
            play,
            ControlMessage::Play {
                id: "b".into(),
                time: 2.5
            }
        );

        let transport = ControlMessage::from_json(json!({
            "kind": "transport",
            "transport": {"playing": true, "tempo": 100.0, "currentBarStarted": 1.0}
        }))
        .unwrap();
        match transport {
            ControlMessage::Transport(t) => {
                assert!(t.playing);
                assert_eq!(t.time_sig_numerator, 4);
            }
            other => panic!("Expected Transport, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let value = json!({"kind": "param", "name": "cutoff", "value": 0.3});
        let message = ControlMessage::from_json(value.clone()).unwrap();
        assert_eq!(message.kind(), "param");
        assert_eq!(
            message,
            ControlMessage::Passthrough {
                kind: "param".into(),
                payload: value
            }
        );
    }

    #[test]
    fn test_malformed_known_kind_is_an_error() {
        let result = ControlMessage::from_json(json!({"kind": "play"}));
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_load_clip_rejects_without_sending() {
        let (handle, receiver) = control_channel(4);
        let result = handle.load_clip(ClipState::new(96, vec![]), None);
        assert!(matches!(result, Err(Error::MissingClipId)));
        assert!(receiver.is_empty());

        handle.load_clip(ClipState::new(96, vec![]), Some("a")).unwrap();
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn test_full_queue_never_blocks() {
        let (handle, receiver) = control_channel(1);
        handle.play("a", 0.0).unwrap();
        assert!(matches!(handle.play("b", 0.0), Err(Error::QueueFull)));

        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_none());

        drop(receiver);
        assert!(matches!(handle.play("c", 0.0), Err(Error::Disconnected)));
    }
}
