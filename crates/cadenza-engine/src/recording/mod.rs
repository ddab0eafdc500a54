//! Recording: the capture hand-off from the audio thread and the commit of
//! captured material into the project when recording stops.

pub mod capture;
pub mod commit;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use capture::{capture_channel, AutomationSample, CaptureReader, CaptureWriter, CapturedMidi, Take};
pub use commit::{pair_notes, RecordTake, RecordedNote, TakeContent};

use crate::actions::{CompositeAction, ReplaceAutomationLane};
use crate::automation::{AutomationMode, AutomationPoint, AutomationRecorder, AutomationTrack, CurveKind};
use crate::error::RecordingError;
use crate::model::{ParamAddress, ProjectState, Region, RegionKind};

/// How a take is combined with material already on the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecordingMode {
    /// The take replaces what it overlaps.
    #[default]
    Overwrite,
    /// The take is layered onto what it overlaps.
    Merge,
    /// Each take goes to a new lane.
    CreateTakes,
    /// Like `CreateTakes`, muting overlapped regions on other lanes.
    CreateTakesMuted,
}

/// Control-domain side of a recording pass.
pub struct RecordingManager {
    reader: CaptureReader,
    takes: Vec<Take>,
    midi: Vec<CapturedMidi>,
    recorders: HashMap<ParamAddress, AutomationRecorder>,
    active: bool,
}

impl RecordingManager {
    pub fn new(reader: CaptureReader) -> Self {
        Self {
            reader,
            takes: Vec::new(),
            midi: Vec::new(),
            recorders: HashMap::new(),
            active: false,
        }
    }

    /// Starts a pass, discarding anything left in the capture rings.
    pub fn begin(&mut self, project: &ProjectState) {
        self.reader.clear();
        self.reader.reset_overflow();
        self.takes.clear();
        self.midi.clear();
        self.recorders = project
            .tracks
            .iter()
            .flat_map(|track| track.automation.iter())
            .filter(|lane| lane.mode != AutomationMode::Read)
            .map(|lane| (lane.target, AutomationRecorder::new(lane.mode)))
            .collect();
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Marks a parameter as grabbed by the user. Returns whether its value is
    /// now being recorded.
    pub fn touch(&mut self, address: ParamAddress) -> bool {
        match self.recorders.get_mut(&address) {
            Some(recorder) => {
                recorder.begin_touch();
                recorder.can_write()
            }
            None => false,
        }
    }

    /// Returns whether the parameter is still being recorded after release.
    pub fn release(&mut self, address: ParamAddress) -> bool {
        match self.recorders.get_mut(&address) {
            Some(recorder) => {
                recorder.end_touch();
                recorder.can_write()
            }
            None => false,
        }
    }

    /// Drains the capture rings. Automation values are handed to their
    /// recorders right away so touch state applies as of now.
    pub fn poll(&mut self) -> Result<(), RecordingError> {
        if !self.active {
            self.reader.clear();
            return Ok(());
        }
        let mut automation = Vec::new();
        self.reader.drain(&mut self.takes, &mut self.midi, &mut automation);
        for sample in automation {
            if let Some(recorder) = self.recorders.get_mut(&sample.target) {
                recorder.record(sample.position, sample.value);
            }
        }
        match self.reader.reset_overflow() {
            0 => Ok(()),
            lost => Err(RecordingError::Overflow(lost)),
        }
    }

    /// Ends the pass and turns everything captured into one composite
    /// action. Returns `None` when nothing was recorded.
    pub fn finish(&mut self, project: &mut ProjectState) -> Result<Option<CompositeAction>, RecordingError> {
        if !self.active {
            return Err(RecordingError::NotRecording);
        }
        if let Err(err) = self.poll() {
            warn!(%err, "committing an incomplete recording");
        }
        self.active = false;
        let takes = std::mem::take(&mut self.takes);
        let midi = std::mem::take(&mut self.midi);
        let mut recorders = std::mem::take(&mut self.recorders);

        let mut commit = CompositeAction::new("Record");
        for track in project.tracks.iter().filter(|t| t.armed && t.kind.can_record()) {
            for take in takes.iter().filter(|take| take.frames() > 0) {
                let content = match track.kind.region_kind() {
                    Some(RegionKind::Audio) => TakeContent::Audio(Arc::new(take.channels.clone())),
                    Some(RegionKind::Midi) => {
                        let notes = pair_notes(&midi, take.pass, take.start, take.end());
                        if notes.is_empty() {
                            continue;
                        }
                        TakeContent::Midi(notes)
                    }
                    _ => continue,
                };
                commit.push(RecordTake {
                    track: track.id,
                    start: take.start,
                    length: take.frames() as u64,
                    content,
                    mode: track.recording_mode,
                });
            }
        }

        let mut targets: Vec<ParamAddress> = recorders.keys().copied().collect();
        targets.sort();
        for target in targets {
            let Some(points) = recorders.get_mut(&target).map(AutomationRecorder::take_points) else {
                continue;
            };
            let Some(owner) = project.param_owner(target) else { continue };
            let Some(lane) = recorded_lane(project, target, &points) else { continue };
            commit.push(ReplaceAutomationLane::new(owner, target, Some(lane)));
        }

        debug!(
            takes = takes.len(),
            actions = commit.len(),
            "recording finished"
        );
        Ok((!commit.is_empty()).then_some(commit))
    }

    /// Drops the pass without committing anything.
    pub fn abort(&mut self) {
        self.active = false;
        self.takes.clear();
        self.midi.clear();
        self.recorders.clear();
        self.reader.clear();
    }
}

/// The automation lane of `target` with `points` written in. Regions the
/// recorded range touches are folded into one region covering all of them;
/// their points inside the range are replaced.
fn recorded_lane(project: &mut ProjectState, target: ParamAddress, points: &[(u64, f32)]) -> Option<AutomationTrack> {
    let (&(first, _), &(last, _)) = (points.first()?, points.last()?);
    let record_end = last + 1;
    let owner = project.param_owner(target)?;
    let mut lane = project
        .track(owner)?
        .automation
        .iter()
        .find(|lane| lane.target == target)
        .cloned()
        .unwrap_or_else(|| AutomationTrack::new(target));

    let (under, kept): (Vec<Region>, Vec<Region>) = lane
        .regions
        .drain(..)
        .partition(|region| region.overlaps(first, record_end));
    lane.regions = kept;
    let start = under.iter().map(|r| r.position).fold(first, u64::min);
    let end = under.iter().map(Region::end).fold(record_end, u64::max);

    let mut region = Region::automation(project.ids.region(), start, end - start)
        .with_name(format!("{target} automation"));
    if let Some(curve) = region.curve_mut() {
        for old in &under {
            let Some(old_curve) = old.curve() else { continue };
            for point in old_curve.points() {
                let Some(local) = point.position.checked_sub(old.clip_start) else { continue };
                let at = old.position + local;
                if local >= old.length || (first..record_end).contains(&at) {
                    continue;
                }
                curve.add_point(AutomationPoint { position: at - start, ..*point });
            }
        }
        for &(position, value) in points {
            curve.add_point(AutomationPoint::new(position - start, value, CurveKind::Linear));
        }
    }
    lane.insert(region).ok()?;
    Some(lane)
}
