//! Piano-roll clip model.
//!
//! A clip is one loop cycle of notes kept in ascending tick order. Notes
//! live behind an `Arc`: mutations go through `Arc::make_mut`, so a reader
//! holding a [`snapshot`](Clip::snapshot) keeps a consistent view while the
//! clip moves on.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEFAULT_CLIP_ID: &str = "default";
pub const DEFAULT_CLIP_LENGTH: u32 = 96;

/// A timed note inside a clip. `tick` and `duration` are in scheduler ticks.
///
/// Always valid: number and velocity fit in 7 bits and the duration is at
/// least one tick. Deserializing an invalid note fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "NoteFields")]
pub struct Note {
    tick: u32,
    number: u8,
    duration: u32,
    velocity: u8,
}

#[derive(Deserialize)]
struct NoteFields {
    tick: u32,
    number: u8,
    duration: u32,
    velocity: u8,
}

impl TryFrom<NoteFields> for Note {
    type Error = Error;

    fn try_from(fields: NoteFields) -> Result<Self> {
        Note::new(fields.tick, fields.number, fields.duration, fields.velocity)
    }
}

impl Note {
    pub fn new(tick: u32, number: u8, duration: u32, velocity: u8) -> Result<Self> {
        if number > 127 || velocity > 127 || duration == 0 {
            return Err(Error::InvalidNote {
                number,
                velocity,
                duration,
            });
        }
        Ok(Self {
            tick,
            number,
            duration,
            velocity,
        })
    }

    #[inline]
    pub fn tick(&self) -> u32 {
        self.tick
    }

    #[inline]
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Length in ticks, at least 1.
    #[inline]
    pub fn duration(&self) -> u32 {
        self.duration
    }

    #[inline]
    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    /// First tick after the note.
    #[inline]
    pub fn end(&self) -> u64 {
        self.tick as u64 + self.duration as u64
    }

    /// Whether `[tick, tick + duration)` overlaps `[start, end)`.
    #[inline]
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.tick < end && self.end() > start as u64
    }

    #[inline]
    fn same_slot(&self, other: &Note) -> bool {
        self.tick == other.tick && self.number == other.number
    }
}

fn default_length() -> u32 {
    DEFAULT_CLIP_LENGTH
}

/// Serializable clip contents, as carried by `clip` control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_length")]
    pub length: u32,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl ClipState {
    pub fn new(length: u32, notes: Vec<Note>) -> Self {
        Self {
            id: None,
            length,
            notes,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Resolve the clip id (the override wins) and check the length.
    pub(crate) fn resolve(&self, id_override: Option<&str>) -> Result<String> {
        let id = id_override
            .map(str::to_string)
            .or_else(|| self.id.clone())
            .ok_or(Error::MissingClipId)?;
        if self.length == 0 {
            return Err(Error::InvalidClipLength(self.length));
        }
        Ok(id)
    }
}

/// Shared "needs render" signal.
///
/// Set by every clip mutation, cleared only by the renderer, so an update
/// landing between two polls is never lost.
#[derive(Debug, Clone, Default)]
pub struct RenderFlag(Arc<AtomicBool>);

impl RenderFlag {
    fn new(dirty: bool) -> Self {
        Self(Arc::new(AtomicBool::new(dirty)))
    }

    #[inline]
    pub fn needs_render(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consume the signal. Returns whether it was set.
    #[inline]
    pub fn clear(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    #[inline]
    fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct Clip {
    id: String,
    length: u32,
    notes: Arc<Vec<Note>>,
    dirty: RenderFlag,
}

impl Clip {
    pub fn new(id: impl Into<String>, length: u32) -> Result<Self> {
        if length == 0 {
            return Err(Error::InvalidClipLength(length));
        }
        Ok(Self {
            id: id.into(),
            length,
            notes: Arc::new(Vec::new()),
            dirty: RenderFlag::new(true),
        })
    }

    /// The empty clip the scheduler starts with.
    pub fn default_clip() -> Self {
        Self {
            id: DEFAULT_CLIP_ID.to_string(),
            length: DEFAULT_CLIP_LENGTH,
            notes: Arc::new(Vec::new()),
            dirty: RenderFlag::new(true),
        }
    }

    /// Build a clip from a state payload. See [`set_state`](Self::set_state)
    /// for the id rules.
    pub fn from_state(state: ClipState, id_override: Option<&str>) -> Result<Self> {
        let mut clip = Self::default_clip();
        clip.set_state(state, id_override)?;
        Ok(clip)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn set_length(&mut self, length: u32) -> Result<()> {
        if length == 0 {
            return Err(Error::InvalidClipLength(length));
        }
        self.length = length;
        self.dirty.mark();
        Ok(())
    }

    /// Notes in ascending tick order.
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// Current notes as an immutable snapshot; later mutations don't affect it.
    pub fn snapshot(&self) -> Arc<Vec<Note>> {
        Arc::clone(&self.notes)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Insert `note` after any notes on the same tick. A note already at
    /// the same tick and number wins: returns `false` and changes nothing.
    pub fn add_note(&mut self, note: Note) -> bool {
        if self.notes.iter().any(|n| n.same_slot(&note)) {
            return false;
        }
        let index = self
            .notes
            .iter()
            .position(|n| n.tick > note.tick)
            .unwrap_or(self.notes.len());
        Arc::make_mut(&mut self.notes).insert(index, note);
        self.dirty.mark();
        true
    }

    pub fn remove_note(&mut self, tick: u32, number: u8) -> Option<Note> {
        let index = self
            .notes
            .iter()
            .position(|n| n.tick == tick && n.number == number)?;
        let removed = Arc::make_mut(&mut self.notes).remove(index);
        self.dirty.mark();
        Some(removed)
    }

    /// Replace every note. Order and duplicate rules are the same as
    /// repeated [`add_note`](Self::add_note) calls.
    pub fn replace_notes(&mut self, notes: impl IntoIterator<Item = Note>) {
        let mut seen = HashSet::new();
        let mut sorted: Vec<Note> = notes
            .into_iter()
            .filter(|n| seen.insert((n.tick, n.number)))
            .collect();
        // Stable, so notes sharing a tick keep arrival order.
        sorted.sort_by_key(|n| n.tick);
        self.notes = Arc::new(sorted);
        self.dirty.mark();
    }

    /// Notes starting exactly at `tick`.
    pub fn notes_for_tick(&self, tick: u32) -> impl Iterator<Item = &Note> + '_ {
        let start = self.notes.partition_point(|n| n.tick < tick);
        self.notes[start..].iter().take_while(move |n| n.tick == tick)
    }

    /// Notes of `number` sounding anywhere in `[start, end)`.
    pub fn notes_in_tick_range(
        &self,
        start: u32,
        end: u32,
        number: u8,
    ) -> impl Iterator<Item = &Note> + '_ {
        self.notes
            .iter()
            .take_while(move |n| n.tick < end)
            .filter(move |n| n.number == number && n.overlaps(start, end))
    }

    pub fn state(&self) -> ClipState {
        ClipState {
            id: Some(self.id.clone()),
            length: self.length,
            notes: self.notes.to_vec(),
        }
    }

    /// Replace the clip wholesale.
    ///
    /// The id comes from `id_override` if given, else from `state.id`. With
    /// neither, returns `Error::MissingClipId` and leaves the clip untouched;
    /// the same goes for an invalid length or note.
    pub fn set_state(&mut self, state: ClipState, id_override: Option<&str>) -> Result<()> {
        let id = state.resolve(id_override)?;
        self.id = id;
        self.length = state.length;
        self.replace_notes(state.notes);
        Ok(())
    }

    pub fn needs_render(&self) -> bool {
        self.dirty.needs_render()
    }

    /// Returns whether the flag was set.
    pub fn clear_dirty(&self) -> bool {
        self.dirty.clear()
    }

    /// Handle a renderer can keep polling after the clip moves elsewhere.
    pub fn render_flag(&self) -> RenderFlag {
        self.dirty.clone()
    }

    /// Take over `previous`'s render flag and mark it, so a renderer polling
    /// the old clip's flag sees this one land.
    pub(crate) fn succeed(&mut self, previous: &mut Clip) {
        std::mem::swap(&mut self.dirty, &mut previous.dirty);
        self.dirty.mark();
    }
}

impl PartialEq for Clip {
    /// Same id, length and notes. The render flag is not compared.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.length == other.length && self.notes == other.notes
    }
}

impl Clone for Clip {
    /// The clone shares the note snapshot but gets its own render flag.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            length: self.length,
            notes: Arc::clone(&self.notes),
            dirty: RenderFlag::new(self.dirty.needs_render()),
        }
    }
}

impl Default for Clip {
    fn default() -> Self {
        Self::default_clip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn note(tick: u32, number: u8, duration: u32, velocity: u8) -> Note {
        Note::new(tick, number, duration, velocity).unwrap()
    }

    #[test]
    fn test_note_validation() {
        assert!(Note::new(0, 128, 1, 100).is_err());
        assert!(Note::new(0, 60, 1, 128).is_err());
        assert!(matches!(
            Note::new(0, 60, 0, 100),
            Err(Error::InvalidNote { duration: 0, .. })
        ));
        assert!(Note::new(0, 127, 1, 0).is_ok());
    }

    #[test]
    fn test_clip_length_must_be_positive() {
        assert!(matches!(Clip::new("a", 0), Err(Error::InvalidClipLength(0))));
        let mut clip = Clip::new("a", 4).unwrap();
        assert!(clip.set_length(0).is_err());
        assert_eq!(clip.length(), 4);
    }

    #[test]
    fn test_first_writer_wins() {
        let mut clip = Clip::default_clip();
        assert!(clip.add_note(note(0, 60, 6, 100)));
        assert!(!clip.add_note(note(0, 60, 12, 50)));
        assert_eq!(clip.notes(), &[note(0, 60, 6, 100)]);
    }

    #[test]
    fn test_stable_insert_order() {
        let mut clip = Clip::default_clip();
        clip.add_note(note(12, 60, 1, 100));
        clip.add_note(note(0, 64, 1, 100));
        clip.add_note(note(12, 62, 1, 100));
        clip.add_note(note(0, 60, 1, 100));

        let order: Vec<(u32, u8)> = clip.notes().iter().map(|n| (n.tick, n.number)).collect();
        assert_eq!(order, vec![(0, 64), (0, 60), (12, 60), (12, 62)]);
    }

    #[test]
    fn test_notes_for_tick_is_exact() {
        let mut clip = Clip::default_clip();
        clip.add_note(note(0, 60, 24, 100));
        clip.add_note(note(6, 62, 1, 100));
        clip.add_note(note(6, 64, 1, 100));

        let at_six: Vec<u8> = clip.notes_for_tick(6).map(|n| n.number).collect();
        assert_eq!(at_six, vec![62, 64]);
        assert_eq!(clip.notes_for_tick(3).count(), 0);
    }

    #[test]
    fn test_notes_in_tick_range_finds_held_notes() {
        let mut clip = Clip::default_clip();
        clip.add_note(note(0, 60, 24, 100));
        clip.add_note(note(24, 60, 6, 100));
        clip.add_note(note(10, 62, 4, 100));

        let held: Vec<u32> = clip.notes_in_tick_range(12, 13, 60).map(|n| n.tick).collect();
        assert_eq!(held, vec![0]);
        // Half-open: a note ending at 24 doesn't overlap [24, 30).
        let later: Vec<u32> = clip.notes_in_tick_range(24, 30, 60).map(|n| n.tick).collect();
        assert_eq!(later, vec![24]);
    }

    #[test]
    fn test_remove_note() {
        let mut clip = Clip::default_clip();
        clip.add_note(note(0, 60, 6, 100));
        clip.clear_dirty();

        assert_eq!(clip.remove_note(0, 61), None);
        assert!(!clip.needs_render());
        assert_eq!(clip.remove_note(0, 60), Some(note(0, 60, 6, 100)));
        assert!(clip.needs_render());
        assert!(clip.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let mut clip = Clip::default_clip();
        clip.add_note(note(0, 60, 6, 100));
        let snapshot = clip.snapshot();

        clip.add_note(note(6, 62, 6, 100));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(clip.len(), 2);
    }

    #[test]
    fn test_set_state_without_id_is_rejected() {
        let mut clip = Clip::new("lead", 48).unwrap();
        clip.add_note(note(0, 60, 6, 100));

        let result = clip.set_state(ClipState::new(96, vec![note(3, 70, 1, 1)]), None);
        assert!(matches!(result, Err(Error::MissingClipId)));
        assert_eq!(clip.id(), "lead");
        assert_eq!(clip.length(), 48);
        assert_eq!(clip.notes(), &[note(0, 60, 6, 100)]);
    }

    #[test]
    fn test_set_state_override_wins() {
        let mut clip = Clip::default_clip();
        let state = ClipState::new(32, vec![]).with_id("from-payload");
        clip.set_state(state, Some("override")).unwrap();
        assert_eq!(clip.id(), "override");
        assert_eq!(clip.length(), 32);
    }

    #[test]
    fn test_invalid_notes_fail_to_deserialize() {
        for bad in [
            r#"{"tick":0,"number":200,"duration":1,"velocity":1}"#,
            r#"{"tick":0,"number":60,"duration":1,"velocity":128}"#,
            r#"{"tick":0,"number":60,"duration":0,"velocity":100}"#,
        ] {
            assert!(serde_json::from_str::<Note>(bad).is_err(), "{} should be rejected", bad);
        }

        let state = serde_json::from_str::<ClipState>(
            r#"{"id":"x","notes":[{"tick":0,"number":60,"duration":0,"velocity":100}]}"#,
        );
        assert!(state.is_err());

        let note: Note =
            serde_json::from_str(r#"{"tick":3,"number":60,"duration":2,"velocity":90}"#).unwrap();
        assert_eq!(
            (note.tick(), note.number(), note.duration(), note.velocity()),
            (3, 60, 2, 90)
        );
    }

    #[test]
    fn test_clip_equality_ignores_render_flag() {
        let mut a = Clip::new("a", 16).unwrap();
        a.add_note(note(0, 60, 1, 100));
        let b = Clip::from_state(a.state(), None).unwrap();
        b.clear_dirty();
        assert_eq!(a, b);

        let c = Clip::from_state(a.state(), Some("c")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_succeed_keeps_renderer_flag() {
        let mut old = Clip::new("a", 16).unwrap();
        let flag = old.render_flag();
        flag.clear();

        let mut new = Clip::new("a", 32).unwrap();
        new.succeed(&mut old);
        assert!(flag.needs_render());
        assert!(flag.clear());
        new.add_note(note(0, 60, 1, 100));
        assert!(flag.needs_render());
    }

    #[test]
    fn test_state_round_trip() {
        let mut clip = Clip::new("bass", 64).unwrap();
        clip.add_note(note(0, 36, 6, 110));
        clip.add_note(note(32, 38, 3, 90));

        let restored = Clip::from_state(clip.state(), None).unwrap();
        assert_eq!(restored.id(), "bass");
        assert_eq!(restored.length(), 64);
        assert_eq!(restored.notes(), clip.notes());
    }

    #[test]
    fn test_state_json_defaults() {
        let state: ClipState =
            serde_json::from_str(r#"{"notes":[{"tick":0,"number":60,"duration":6,"velocity":100}]}"#)
                .unwrap();
        assert_eq!(state.id, None);
        assert_eq!(state.length, DEFAULT_CLIP_LENGTH);
        assert_eq!(state.notes.len(), 1);
    }

    #[test]
    fn test_dirty_flag_survives_between_polls() {
        let mut clip = Clip::default_clip();
        let flag = clip.render_flag();
        assert!(flag.clear());
        assert!(!flag.needs_render());

        clip.add_note(note(0, 60, 1, 1));
        clip.add_note(note(1, 60, 1, 1));
        assert!(flag.needs_render());
        assert!(flag.clear());
        assert!(!clip.needs_render());
    }

    #[test]
    fn test_replace_notes_handles_large_input() {
        let mut clip = Clip::default_clip();
        let notes: Vec<Note> = (0..20_000u32)
            .rev()
            .map(|i| note(i % 96, (i % 128) as u8, 1, 100))
            .collect();
        clip.replace_notes(notes);
        assert!(clip.notes().windows(2).all(|w| w[0].tick() <= w[1].tick()));
        let mut slots: Vec<(u32, u8)> = clip.notes().iter().map(|n| (n.tick(), n.number())).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), clip.len());
    }

    #[test]
    fn test_replace_notes_dedups_and_sorts() {
        let mut clip = Clip::default_clip();
        clip.replace_notes(vec![
            note(6, 60, 1, 1),
            note(0, 60, 1, 1),
            note(6, 60, 9, 9),
        ]);
        assert_eq!(clip.notes(), &[note(0, 60, 1, 1), note(6, 60, 1, 1)]);
    }

    proptest! {
        #[test]
        fn prop_range_query_matches_overlap(
            notes in proptest::collection::vec((0u32..96, 58u8..62, 1u32..32), 0..24),
            start in 0u32..128,
            len in 0u32..32,
            number in 58u8..62,
        ) {
            let end = start + len;
            let mut clip = Clip::default_clip();
            for (tick, n, duration) in notes {
                clip.add_note(note(tick, n, duration, 100));
            }

            let found: Vec<Note> = clip.notes_in_tick_range(start, end, number).copied().collect();
            let expected: Vec<Note> = clip
                .notes()
                .iter()
                .filter(|n| {
                    n.number == number && n.tick < end && n.tick as u64 + n.duration as u64 > start as u64
                })
                .copied()
                .collect();
            prop_assert_eq!(found, expected);
        }

        #[test]
        fn prop_add_keeps_first_and_sorted(
            notes in proptest::collection::vec((0u32..48, 60u8..64, 1u32..8, 1u8..128), 0..40),
        ) {
            let mut clip = Clip::default_clip();
            let mut first: std::collections::HashMap<(u32, u8), Note> = Default::default();
            for (tick, number, duration, velocity) in notes {
                let n = note(tick, number, duration, velocity);
                let added = clip.add_note(n);
                prop_assert_eq!(added, !first.contains_key(&(tick, number)));
                first.entry((tick, number)).or_insert(n);
            }

            prop_assert_eq!(clip.len(), first.len());
            prop_assert!(clip.notes().windows(2).all(|w| w[0].tick <= w[1].tick));
            for n in clip.notes() {
                prop_assert_eq!(first[&(n.tick, n.number)], *n);
            }
        }
    }
}
