//! Turning captured takes into project edits.

use std::any::Any;
use std::sync::Arc;

use cadenza_graph::MidiMessage;

use super::capture::CapturedMidi;
use super::RecordingMode;
use crate::actions::{Action, ActionContext, ActionOutcome, Effects};
use crate::error::ActionError;
use crate::ids::{ClipId, ObjectId, TrackId};
use crate::model::{AudioClip, Lane, MidiNote, ProjectState, Region, RegionContent, RegionKind};

/// A note closed from captured note-on/off pairs. `offset` is relative to
/// the take start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedNote {
    pub offset: u64,
    pub length: u64,
    pub pitch: u8,
    pub velocity: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TakeContent {
    Audio(Arc<Vec<Vec<f32>>>),
    Midi(Vec<RecordedNote>),
}

/// Pairs note-ons with their note-offs inside `[start, end)`. Notes still
/// open at `end` are closed there.
pub fn pair_notes(events: &[CapturedMidi], pass: u64, start: u64, end: u64) -> Vec<RecordedNote> {
    let mut open: [Option<(u64, u8)>; 128] = [None; 128];
    let mut notes = Vec::new();
    let close = |open: &mut [Option<(u64, u8)>; 128], pitch: usize, at: u64, notes: &mut Vec<RecordedNote>| {
        if let Some((from, velocity)) = open[pitch].take() {
            notes.push(RecordedNote {
                offset: from - start,
                length: (at - from).max(1),
                pitch: pitch as u8,
                velocity,
            });
        }
    };
    for event in events
        .iter()
        .filter(|e| e.pass == pass && (start..end).contains(&e.position))
    {
        match event.message {
            MidiMessage::NoteOn { note, velocity, .. } if velocity > 0 => {
                let pitch = usize::from(note.min(127));
                close(&mut open, pitch, event.position, &mut notes);
                open[pitch] = Some((event.position, velocity));
            }
            MidiMessage::NoteOn { note, .. } | MidiMessage::NoteOff { note, .. } => {
                close(&mut open, usize::from(note.min(127)), event.position, &mut notes);
            }
            MidiMessage::AllNotesOff { .. } => {
                for pitch in 0..open.len() {
                    close(&mut open, pitch, event.position, &mut notes);
                }
            }
            _ => {}
        }
    }
    for pitch in 0..open.len() {
        close(&mut open, pitch, end, &mut notes);
    }
    notes.sort_by_key(|note| (note.offset, note.pitch));
    notes
}

/// Replaces the lanes of a track and edits the audio pool in one step.
struct SwapLanes {
    track: TrackId,
    lanes: Vec<Lane>,
    add_clips: Vec<AudioClip>,
    remove_clips: Vec<ClipId>,
}

impl Action for SwapLanes {
    fn describe(&self) -> String {
        format!("Record on {}", self.track)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let track = project.require_track_mut(self.track)?;
        let previous = std::mem::replace(&mut track.lanes, self.lanes.clone());
        let removed: Vec<AudioClip> = self
            .remove_clips
            .iter()
            .filter_map(|id| project.pool.remove(*id))
            .collect();
        for clip in &self.add_clips {
            project.pool.insert(clip.clone());
        }
        Ok(ActionOutcome::new(
            SwapLanes {
                track: self.track,
                lanes: previous,
                add_clips: removed,
                remove_clips: self.add_clips.iter().map(|clip| clip.id).collect(),
            },
            Effects::content(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Commits one captured take to a track according to its recording mode.
pub struct RecordTake {
    pub track: TrackId,
    pub start: u64,
    pub length: u64,
    pub content: TakeContent,
    pub mode: RecordingMode,
}

impl RecordTake {
    fn kind(&self) -> RegionKind {
        match self.content {
            TakeContent::Audio(_) => RegionKind::Audio,
            TakeContent::Midi(_) => RegionKind::Midi,
        }
    }

    fn end(&self) -> u64 {
        self.start + self.length
    }
}

impl Action for RecordTake {
    fn describe(&self) -> String {
        format!("Record on {}", self.track)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        if self.length == 0 {
            return Err(ActionError::invalid("empty take"));
        }
        let project = &mut *ctx.project;
        let track = project.require_track(self.track)?;
        if track.kind.region_kind() != Some(self.kind()) {
            return Err(ActionError::invalid(format!("{} cannot record {:?}", self.track, self.kind())));
        }
        let mut lanes = track.lanes.clone();
        if lanes.is_empty() {
            lanes.push(Lane::new("Lane 1"));
        }
        let mut clips = Vec::new();
        let mut replaced = Vec::new();
        let region = match self.mode {
            RecordingMode::Overwrite | RecordingMode::Merge => {
                let lane = &mut lanes[0];
                let overlapping: Vec<Region> = lane
                    .regions
                    .iter()
                    .filter(|region| region.overlaps(self.start, self.end()))
                    .cloned()
                    .collect();
                for region in &overlapping {
                    lane.remove(region.id);
                }
                let region = self.combine(project, &overlapping, &mut clips);
                lanes[0].insert_unchecked(region.clone());
                replaced = overlapping;
                region
            }
            RecordingMode::CreateTakes | RecordingMode::CreateTakesMuted => {
                if self.mode == RecordingMode::CreateTakesMuted {
                    for lane in &mut lanes {
                        for region in lane.regions.iter_mut().filter(|r| r.overlaps(self.start, self.end())) {
                            region.muted = true;
                        }
                    }
                }
                let region = self.combine(project, &[], &mut clips);
                let mut lane = Lane::new(format!("Take {}", lanes.len()));
                lane.insert_unchecked(region.clone());
                lanes.push(lane);
                region
            }
        };
        let remove_clips = orphaned_clips(project, self.track, &lanes, &replaced);
        let swap = SwapLanes {
            track: self.track,
            lanes,
            add_clips: clips.clone(),
            remove_clips,
        };
        let mut outcome = swap.perform(ctx)?.with_created(ObjectId::Region(region.id));
        for clip in clips {
            outcome = outcome.with_created(ObjectId::Clip(clip.id));
        }
        Ok(outcome)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RecordTake {
    /// Builds the committed region spanning the take and every region in
    /// `under`. Overwrite replaces their content inside the take range,
    /// Merge layers the take on top.
    fn combine(&self, project: &mut ProjectState, under: &[Region], clips: &mut Vec<AudioClip>) -> Region {
        let start = under.iter().map(|r| r.position).fold(self.start, u64::min);
        let end = under.iter().map(Region::end).fold(self.end(), u64::max);
        let replace = self.mode != RecordingMode::Merge;
        let id = project.ids.region();
        match &self.content {
            TakeContent::Audio(take) => {
                let channels = if under.is_empty() {
                    Vec::clone(take)
                } else {
                    let mut mixed = vec![vec![0.0f32; (end - start) as usize]; take.len().max(2)];
                    for region in under {
                        render_region(project, region, start, &mut mixed);
                    }
                    let offset = (self.start - start) as usize;
                    for (channel, samples) in mixed.iter_mut().enumerate() {
                        let Some(source) = take.get(channel).or_else(|| take.first()) else { continue };
                        for (out, sample) in samples[offset..].iter_mut().zip(source) {
                            *out = if replace { *sample } else { *out + sample };
                        }
                    }
                    mixed
                };
                let clip = AudioClip::new(
                    project.ids.clip(),
                    format!("Recording {}", id.0),
                    project.sample_rate,
                    channels,
                );
                let region = Region::audio(id, start, end - start, clip.id).with_name(clip.name.clone());
                clips.push(clip);
                region
            }
            TakeContent::Midi(recorded) => {
                let mut region = Region::midi(id, start, end - start).with_name(format!("Recording {}", id.0));
                for old in under {
                    for note in old.notes().unwrap_or_default() {
                        let Some(at) = timeline_start(old, note) else { continue };
                        if replace && (self.start..self.end()).contains(&at) {
                            continue;
                        }
                        region.insert_note(MidiNote {
                            start: at - start,
                            ..*note
                        });
                    }
                }
                for note in recorded {
                    let note = MidiNote {
                        id: project.ids.note(),
                        start: self.start + note.offset - start,
                        length: note.length,
                        pitch: note.pitch,
                        velocity: note.velocity,
                    };
                    region.insert_note(note);
                }
                region
            }
        }
    }
}

/// Clips of `replaced` regions that nothing plays once `track` holds
/// `lanes`.
fn orphaned_clips(project: &ProjectState, track: TrackId, lanes: &[Lane], replaced: &[Region]) -> Vec<ClipId> {
    let clip_of = |region: &Region| match region.content {
        RegionContent::Audio { clip, .. } => Some(clip),
        _ => None,
    };
    let mut orphans: Vec<ClipId> = replaced.iter().filter_map(clip_of).collect();
    orphans.sort_unstable();
    orphans.dedup();
    let remaining = project
        .tracks
        .iter()
        .filter(|other| other.id != track)
        .flat_map(|other| other.regions())
        .chain(lanes.iter().flat_map(|lane| lane.regions.iter()));
    for region in remaining {
        if let Some(clip) = clip_of(region) {
            orphans.retain(|id| *id != clip);
        }
    }
    orphans
}

/// Timeline position of a note of an unlooped region, if it is audible.
fn timeline_start(region: &Region, note: &MidiNote) -> Option<u64> {
    let local = note.start.checked_sub(region.clip_start)?;
    (local < region.length).then_some(region.position + local)
}

/// Mixes what `region` plays into `out`, which starts at timeline `origin`.
fn render_region(project: &ProjectState, region: &Region, origin: u64, out: &mut [Vec<f32>]) {
    let RegionContent::Audio { clip, gain } = region.content else { return };
    let Some(clip) = project.pool.get(clip) else { return };
    let offset = (region.position - origin) as usize;
    for (channel, samples) in out.iter_mut().enumerate() {
        for local in 0..region.length {
            let Some(slot) = samples.get_mut(offset + local as usize) else { break };
            let source = region.content_position(local) as usize;
            *slot += clip.sample(channel, source) * gain * region.fade_gain(local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::run;
    use crate::actions::{AddRegion, CreateTrack};
    use crate::ids::RegionId;
    use crate::model::TrackKind;

    fn audio_track() -> (ProjectState, TrackId) {
        let mut project = ProjectState::new("rec", 48_000);
        run(&mut project, &CreateTrack::new(TrackKind::Audio, "A")).unwrap();
        let track = project.tracks[1].id;
        (project, track)
    }

    fn take(track: TrackId, start: u64, values: Vec<f32>, mode: RecordingMode) -> RecordTake {
        RecordTake {
            track,
            start,
            length: values.len() as u64,
            content: TakeContent::Audio(Arc::new(vec![values.clone(), values])),
            mode,
        }
    }

    fn existing(project: &mut ProjectState, track: TrackId) -> RegionId {
        let clip = project.ids.clip();
        project
            .pool
            .insert(AudioClip::new(clip, "old", 48_000, vec![vec![1.0; 40]; 2]));
        let outcome = run(project, &AddRegion::new(track, 0, Region::audio(RegionId(0), 10, 40, clip))).unwrap();
        match outcome.created[0] {
            ObjectId::Region(id) => id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overwrite_inside_a_region_commits_one_region() {
        let (mut project, track) = audio_track();
        existing(&mut project, track);
        let before = project.clone();
        let outcome = run(&mut project, &take(track, 20, vec![0.5; 20], RecordingMode::Overwrite)).unwrap();

        let lane = &project.track(track).unwrap().lanes[0];
        assert_eq!(lane.regions.len(), 1);
        let region = &lane.regions[0];
        assert_eq!((region.position, region.end()), (10, 50));
        let RegionContent::Audio { clip, .. } = region.content else {
            panic!("not audio");
        };
        let clip = project.pool.get(clip).unwrap();
        assert_eq!(clip.sample(0, 0), 1.0);
        assert_eq!(clip.sample(0, 10), 0.5);
        assert_eq!(clip.sample(0, 29), 0.5);
        assert_eq!(clip.sample(1, 30), 1.0);
        assert!(project.ensure_invariants().is_ok());

        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project.tracks, before.tracks);
        assert_eq!(project.pool, before.pool);
    }

    #[test]
    fn overwrite_drops_the_replaced_clip_until_undo() {
        let (mut project, track) = audio_track();
        let old = existing(&mut project, track);
        let RegionContent::Audio { clip: old_clip, .. } = project.region(old).unwrap().content else {
            panic!("not audio");
        };
        let before = project.clone();
        let outcome = run(&mut project, &take(track, 20, vec![0.5; 20], RecordingMode::Overwrite)).unwrap();
        assert!(!project.pool.contains(old_clip));
        assert_eq!(project.pool.len(), 1);

        run(&mut project, &*outcome.inverse).unwrap();
        assert!(project.pool.contains(old_clip));
        assert_eq!(project.pool, before.pool);
    }

    #[test]
    fn shared_clips_stay_in_the_pool() {
        let (mut project, track) = audio_track();
        let old = existing(&mut project, track);
        let RegionContent::Audio { clip, .. } = project.region(old).unwrap().content else {
            panic!("not audio");
        };
        run(&mut project, &CreateTrack::new(TrackKind::Audio, "B")).unwrap();
        let other = project.tracks[2].id;
        run(&mut project, &AddRegion::new(other, 0, Region::audio(RegionId(0), 0, 40, clip))).unwrap();

        run(&mut project, &take(track, 20, vec![0.5; 20], RecordingMode::Overwrite)).unwrap();
        assert!(project.pool.contains(clip));
        assert!(project.ensure_invariants().is_ok());
    }

    #[test]
    fn merge_layers_the_take() {
        let (mut project, track) = audio_track();
        existing(&mut project, track);
        run(&mut project, &take(track, 20, vec![0.5; 20], RecordingMode::Merge)).unwrap();
        let region = &project.track(track).unwrap().lanes[0].regions[0];
        let RegionContent::Audio { clip, .. } = region.content else {
            panic!("not audio");
        };
        assert_eq!(project.pool.get(clip).unwrap().sample(0, 15), 1.5);
    }

    #[test]
    fn takes_go_to_new_lanes() {
        let (mut project, track) = audio_track();
        let old = existing(&mut project, track);
        run(&mut project, &take(track, 20, vec![0.5; 20], RecordingMode::CreateTakesMuted)).unwrap();
        let lanes = &project.track(track).unwrap().lanes;
        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes[1].name, "Take 1");
        assert!(project.region(old).unwrap().muted);
        assert!(project.ensure_invariants().is_ok());
    }

    #[test]
    fn notes_pair_and_close_at_the_end() {
        let on = |position, note| CapturedMidi {
            position,
            pass: 0,
            message: MidiMessage::NoteOn {
                channel: 0,
                note,
                velocity: 90,
            },
        };
        let off = |position, note| CapturedMidi {
            position,
            pass: 0,
            message: MidiMessage::NoteOff {
                channel: 0,
                note,
                velocity: 0,
            },
        };
        let events = [on(100, 60), on(120, 64), off(150, 60), on(900, 67)];
        let notes = pair_notes(&events, 0, 100, 1_000);
        assert_eq!(
            notes,
            vec![
                RecordedNote {
                    offset: 0,
                    length: 50,
                    pitch: 60,
                    velocity: 90
                },
                RecordedNote {
                    offset: 20,
                    length: 880,
                    pitch: 64,
                    velocity: 90
                },
                RecordedNote {
                    offset: 800,
                    length: 100,
                    pitch: 67,
                    velocity: 90
                },
            ]
        );
    }

    #[test]
    fn midi_overwrite_keeps_notes_outside_the_take() {
        let mut project = ProjectState::new("rec", 48_000);
        run(&mut project, &CreateTrack::new(TrackKind::Midi, "M")).unwrap();
        let track = project.tracks[1].id;
        let mut old = Region::midi(RegionId(0), 0, 1_000);
        for (start, pitch) in [(100, 60), (500, 62)] {
            old.insert_note(MidiNote {
                id: crate::ids::NoteId(0),
                start,
                length: 50,
                pitch,
                velocity: 80,
            });
        }
        run(&mut project, &AddRegion::new(track, 0, old)).unwrap();
        let recorded = RecordTake {
            track,
            start: 400,
            length: 200,
            content: TakeContent::Midi(vec![RecordedNote {
                offset: 10,
                length: 20,
                pitch: 72,
                velocity: 100,
            }]),
            mode: RecordingMode::Overwrite,
        };
        run(&mut project, &recorded).unwrap();
        let region = &project.track(track).unwrap().lanes[0].regions[0];
        let pitches: Vec<u8> = region.notes().unwrap().iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![60, 72]);
        assert_eq!(region.notes().unwrap()[1].start, 410);
    }
}
