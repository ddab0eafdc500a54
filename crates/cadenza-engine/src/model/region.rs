use serde::{Deserialize, Serialize};

use crate::automation::{AutomationCurve, FadeCurve};
use crate::ids::{ClipId, IdAllocator, NoteId, RegionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    Audio,
    Midi,
    Chord,
    Automation,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Fade {
    pub length: u64,
    pub curve: FadeCurve,
}

impl Fade {
    pub fn new(length: u64, curve: FadeCurve) -> Self {
        Self { length, curve }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiNote {
    pub id: NoteId,
    /// Content position in samples.
    pub start: u64,
    pub length: u64,
    pub pitch: u8,
    pub velocity: u8,
}

impl MidiNote {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChordKind {
    Major,
    Minor,
    Diminished,
    Augmented,
    Sus2,
    Sus4,
    Dominant7,
    Major7,
    Minor7,
}

impl ChordKind {
    /// Semitone offsets from the root.
    pub fn intervals(self) -> &'static [u8] {
        match self {
            ChordKind::Major => &[0, 4, 7],
            ChordKind::Minor => &[0, 3, 7],
            ChordKind::Diminished => &[0, 3, 6],
            ChordKind::Augmented => &[0, 4, 8],
            ChordKind::Sus2 => &[0, 2, 7],
            ChordKind::Sus4 => &[0, 5, 7],
            ChordKind::Dominant7 => &[0, 4, 7, 10],
            ChordKind::Major7 => &[0, 4, 7, 11],
            ChordKind::Minor7 => &[0, 3, 7, 10],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChordObject {
    pub position: u64,
    pub length: u64,
    /// MIDI note number of the root.
    pub root: u8,
    pub kind: ChordKind,
}

impl ChordObject {
    pub fn pitches(&self) -> impl Iterator<Item = u8> + '_ {
        self.kind
            .intervals()
            .iter()
            .filter_map(|interval| self.root.checked_add(*interval))
            .filter(|pitch| *pitch < 128)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionContent {
    Audio { clip: ClipId, gain: f32 },
    Midi { notes: Vec<MidiNote> },
    Chord { chords: Vec<ChordObject> },
    Automation { curve: AutomationCurve },
}

impl RegionContent {
    pub fn kind(&self) -> RegionKind {
        match self {
            RegionContent::Audio { .. } => RegionKind::Audio,
            RegionContent::Midi { .. } => RegionKind::Midi,
            RegionContent::Chord { .. } => RegionKind::Chord,
            RegionContent::Automation { .. } => RegionKind::Automation,
        }
    }
}

/// A clip placed on the timeline.
///
/// `position` and `length` are timeline samples. Content is addressed in
/// content samples: region-local frame `x` plays content `clip_start + x`,
/// which wraps back into `[loop_start, loop_end)` once it reaches `loop_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub position: u64,
    pub length: u64,
    pub clip_start: u64,
    pub loop_start: u64,
    pub loop_end: u64,
    #[serde(default)]
    pub fade_in: Fade,
    #[serde(default)]
    pub fade_out: Fade,
    #[serde(default)]
    pub muted: bool,
    pub content: RegionContent,
}

impl Region {
    pub fn new(id: RegionId, position: u64, length: u64, content: RegionContent) -> Self {
        Self {
            id,
            name: String::new(),
            position,
            length,
            clip_start: 0,
            loop_start: 0,
            loop_end: length,
            fade_in: Fade::default(),
            fade_out: Fade::default(),
            muted: false,
            content,
        }
    }

    pub fn audio(id: RegionId, position: u64, length: u64, clip: ClipId) -> Self {
        Self::new(id, position, length, RegionContent::Audio { clip, gain: 1.0 })
    }

    pub fn midi(id: RegionId, position: u64, length: u64) -> Self {
        Self::new(id, position, length, RegionContent::Midi { notes: Vec::new() })
    }

    pub fn chord(id: RegionId, position: u64, length: u64) -> Self {
        Self::new(id, position, length, RegionContent::Chord { chords: Vec::new() })
    }

    pub fn automation(id: RegionId, position: u64, length: u64) -> Self {
        Self::new(
            id,
            position,
            length,
            RegionContent::Automation {
                curve: AutomationCurve::new(),
            },
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_loop(mut self, loop_start: u64, loop_end: u64) -> Self {
        self.loop_start = loop_start;
        self.loop_end = loop_end;
        self
    }

    pub fn with_clip_start(mut self, clip_start: u64) -> Self {
        let extends_to_end = self.loop_end == self.clip_start + self.length;
        self.clip_start = clip_start;
        if extends_to_end {
            self.loop_end = clip_start + self.length;
        }
        self
    }

    pub fn kind(&self) -> RegionKind {
        self.content.kind()
    }

    pub fn end(&self) -> u64 {
        self.position + self.length
    }

    pub fn contains(&self, position: u64) -> bool {
        position >= self.position && position < self.end()
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.position < end && start < self.end()
    }

    pub fn is_looped(&self) -> bool {
        self.loop_end > self.loop_start && self.loop_end < self.clip_start + self.length
    }

    /// Content position played at region-local frame `local`.
    pub fn content_position(&self, local: u64) -> u64 {
        let position = self.clip_start + local;
        if self.loop_end > self.loop_start && position >= self.loop_end {
            let span = self.loop_end - self.loop_start;
            self.loop_start + (position - self.loop_end) % span
        } else {
            position
        }
    }

    /// Fade gain at region-local frame `local`.
    pub fn fade_gain(&self, local: u64) -> f32 {
        let mut gain = 1.0;
        if self.fade_in.length > 0 && local < self.fade_in.length {
            gain *= self
                .fade_in
                .curve
                .gain_in(local as f32 / self.fade_in.length as f32);
        }
        let fade_out_start = self.length.saturating_sub(self.fade_out.length);
        if self.fade_out.length > 0 && local >= fade_out_start {
            let progress = (local - fade_out_start) as f32 / self.fade_out.length as f32;
            gain *= self.fade_out.curve.gain_out(progress);
        }
        gain
    }

    /// Changes the length, keeping an unlooped region's loop end on its
    /// content end.
    pub fn resize(&mut self, length: u64) {
        let extends_to_end = self.loop_end == self.clip_start + self.length;
        self.length = length;
        if extends_to_end {
            self.loop_end = self.clip_start + length;
        }
        self.fade_in.length = self.fade_in.length.min(length);
        self.fade_out.length = self.fade_out.length.min(length);
    }

    /// Moves the start of the region to `position` without moving its
    /// content on the timeline.
    pub fn trim_start(&mut self, position: u64) {
        if position <= self.position || position >= self.end() {
            return;
        }
        let cut = position - self.position;
        let clip_start = self.content_position(cut);
        let extends_to_end = self.loop_end == self.clip_start + self.length;
        self.position = position;
        self.length -= cut;
        self.clip_start = clip_start;
        if extends_to_end {
            self.loop_end = clip_start + self.length;
        }
        self.fade_in = Fade::default();
    }

    /// Cuts the region at timeline `position`. `self` keeps the left part and
    /// the right part is returned with a fresh id.
    pub fn split_at(&mut self, position: u64, ids: &mut IdAllocator) -> Option<Region> {
        if position <= self.position || position >= self.end() {
            return None;
        }
        let mut right = self.clone();
        right.id = ids.region();
        right.trim_start(position);
        self.resize(position - self.position);
        self.fade_out = Fade::default();
        Some(right)
    }

    pub fn notes(&self) -> Option<&[MidiNote]> {
        match &self.content {
            RegionContent::Midi { notes } => Some(notes),
            _ => None,
        }
    }

    pub fn notes_mut(&mut self) -> Option<&mut Vec<MidiNote>> {
        match &mut self.content {
            RegionContent::Midi { notes } => Some(notes),
            _ => None,
        }
    }

    /// Inserts a note keeping notes sorted by start.
    pub fn insert_note(&mut self, note: MidiNote) -> bool {
        let Some(notes) = self.notes_mut() else {
            return false;
        };
        let index = notes.partition_point(|existing| existing.start <= note.start);
        notes.insert(index, note);
        true
    }

    pub fn curve(&self) -> Option<&AutomationCurve> {
        match &self.content {
            RegionContent::Automation { curve } => Some(curve),
            _ => None,
        }
    }

    pub fn curve_mut(&mut self) -> Option<&mut AutomationCurve> {
        match &mut self.content {
            RegionContent::Automation { curve } => Some(curve),
            _ => None,
        }
    }

    /// Automation value at timeline `position`, if the region covers it.
    pub fn automation_value(&self, position: u64) -> Option<f32> {
        if !self.contains(position) || self.muted {
            return None;
        }
        self.curve()?
            .value_at(self.content_position(position - self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{AutomationPoint, CurveKind};

    #[test]
    fn content_wraps_inside_the_loop() {
        let region = Region::midi(RegionId(0), 100, 40).with_loop(0, 10);
        assert!(region.is_looped());
        assert_eq!(region.content_position(5), 5);
        assert_eq!(region.content_position(10), 0);
        assert_eq!(region.content_position(27), 7);

        let offset = Region::midi(RegionId(1), 0, 40)
            .with_clip_start(4)
            .with_loop(2, 10);
        assert_eq!(offset.content_position(0), 4);
        assert_eq!(offset.content_position(6), 2);
    }

    #[test]
    fn split_keeps_content_on_the_timeline() {
        let mut ids = IdAllocator::default();
        let mut left = Region::audio(ids.region(), 100, 50, ClipId(0));
        let at_cut = left.content_position(20);
        let right = left.split_at(120, &mut ids).unwrap();
        assert_eq!((left.position, left.length), (100, 20));
        assert_eq!((right.position, right.length, right.clip_start), (120, 30, 20));
        assert_ne!(left.id, right.id);
        assert_eq!(right.content_position(0), at_cut);
        assert_eq!(right.content_position(29), 49);
        assert!(left.split_at(100, &mut ids).is_none());
    }

    #[test]
    fn fades_shape_the_edges() {
        let mut region = Region::audio(RegionId(0), 0, 100, ClipId(0));
        region.fade_in = Fade::new(10, FadeCurve::Linear);
        region.fade_out = Fade::new(10, FadeCurve::Linear);
        assert_eq!(region.fade_gain(0), 0.0);
        assert!((region.fade_gain(5) - 0.5).abs() < 1e-6);
        assert_eq!(region.fade_gain(50), 1.0);
        assert!((region.fade_gain(95) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn automation_value_uses_region_local_time() {
        let mut region = Region::automation(RegionId(0), 1_000, 200);
        let curve = region.curve_mut().unwrap();
        curve.add_point(AutomationPoint::new(0, 0.0, CurveKind::Linear));
        curve.add_point(AutomationPoint::new(100, 1.0, CurveKind::Linear));
        assert_eq!(region.automation_value(999), None);
        assert!((region.automation_value(1_050).unwrap() - 0.5).abs() < 1e-6);
    }
}
