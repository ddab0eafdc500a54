//! Region, note and automation edits.
//!
//! Edits that only change one region build the new region and swap it in
//! with [`ReplaceRegion`], whose inverse is the swap back. Structural edits
//! (add, delete, move, split) carry their own inverses.

use std::any::Any;

use super::{Action, ActionContext, ActionOutcome, Effects};
use crate::automation::{AutomationMode, AutomationPoint, AutomationTrack};
use crate::error::ActionError;
use crate::ids::{NoteId, ObjectId, RegionId, TrackId};
use crate::model::{Fade, MidiNote, ParamAddress, ProjectState, Region, RegionLocation, RegionOwner};

fn effects_for(owner: RegionOwner) -> Effects {
    match owner {
        RegionOwner::Lane(_) => Effects::content(),
        RegionOwner::Automation(_) => Effects::automation(),
    }
}

fn locate(project: &ProjectState, region: RegionId) -> Result<RegionLocation, ActionError> {
    project
        .find_region(region)
        .ok_or_else(|| ActionError::not_found("region", region))
}

fn take(project: &mut ProjectState, location: RegionLocation, id: RegionId) -> Result<Region, ActionError> {
    let track = project.require_track_mut(location.track)?;
    let taken = match location.owner {
        RegionOwner::Lane(lane) => track.lanes.get_mut(lane).and_then(|lane| lane.remove(id)),
        RegionOwner::Automation(target) => track
            .automation
            .iter_mut()
            .find(|lane| lane.target == target)
            .and_then(|lane| lane.remove(id)),
    };
    taken.ok_or_else(|| ActionError::not_found("region", id))
}

/// Places `region` into its container, checking kind and overlaps.
fn place(project: &mut ProjectState, location: RegionLocation, region: Region) -> Result<(), ActionError> {
    if region.length == 0 {
        return Err(ActionError::invalid(format!("{} has no length", region.id)));
    }
    if let RegionOwner::Automation(target) = location.owner {
        if project.param_owner(target) != Some(location.track) {
            return Err(ActionError::invalid(format!("{target} is not automated on {}", location.track)));
        }
    }
    let track = project.require_track_mut(location.track)?;
    match location.owner {
        RegionOwner::Lane(index) => {
            if track.kind.region_kind() != Some(region.kind()) {
                return Err(ActionError::invalid(format!(
                    "{:?} region does not fit {:?} track {}",
                    region.kind(),
                    track.kind,
                    track.id
                )));
            }
            let lane = track
                .lanes
                .get_mut(index)
                .ok_or_else(|| ActionError::not_found("lane", index))?;
            lane.insert(region).map(|_| ())
        }
        RegionOwner::Automation(target) => track
            .automation
            .iter_mut()
            .find(|lane| lane.target == target)
            .ok_or_else(|| ActionError::not_found("automation lane", target))?
            .insert(region),
    }
}

/// Builds the replacement of region `id` and swaps it in.
fn edit_region(
    ctx: &mut ActionContext<'_>,
    id: RegionId,
    edit: impl FnOnce(&mut Region) -> Result<(), ActionError>,
) -> Result<ActionOutcome, ActionError> {
    let mut region = ctx
        .project
        .region(id)
        .cloned()
        .ok_or_else(|| ActionError::not_found("region", id))?;
    edit(&mut region)?;
    ReplaceRegion::new(region).perform(ctx)
}

pub struct AddRegion {
    track: TrackId,
    owner: RegionOwner,
    region: Region,
}

impl AddRegion {
    /// Adds `region` to lane `lane` of `track`. The region gets a fresh id.
    pub fn new(track: TrackId, lane: usize, region: Region) -> Self {
        Self {
            track,
            owner: RegionOwner::Lane(lane),
            region,
        }
    }

    /// Adds an automation region for `target`, creating its lane if needed.
    pub fn automation(track: TrackId, target: ParamAddress, region: Region) -> Self {
        Self {
            track,
            owner: RegionOwner::Automation(target),
            region,
        }
    }
}

impl Action for AddRegion {
    fn describe(&self) -> String {
        format!("Add region to {}", self.track)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let mut region = self.region.clone();
        region.id = project.ids.region();
        if let Some(notes) = region.notes_mut() {
            for note in notes.iter_mut() {
                note.id = project.ids.note();
            }
        }
        let id = region.id;
        let location = RegionLocation {
            track: self.track,
            owner: self.owner,
        };
        let mut created_lane = false;
        if let RegionOwner::Automation(target) = self.owner {
            let track = project.require_track_mut(self.track)?;
            if !track.automation.iter().any(|lane| lane.target == target) {
                track.automation.push(AutomationTrack::new(target));
                created_lane = true;
            }
        }
        if let Err(err) = place(project, location, region) {
            if created_lane {
                if let Some(track) = project.track_mut(self.track) {
                    track.automation.pop();
                }
            }
            return Err(err);
        }
        Ok(ActionOutcome::new(
            DeleteRegion {
                region: id,
                drop_empty_lane: created_lane,
            },
            effects_for(self.owner),
        )
        .with_created(ObjectId::Region(id)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DeleteRegion {
    region: RegionId,
    /// Also remove the automation lane when it ends up empty.
    drop_empty_lane: bool,
}

impl DeleteRegion {
    pub fn new(region: RegionId) -> Self {
        Self {
            region,
            drop_empty_lane: false,
        }
    }
}

impl Action for DeleteRegion {
    fn describe(&self) -> String {
        format!("Delete {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let location = locate(project, self.region)?;
        let region = take(project, location, self.region)?;
        let mut lane = None;
        if let (RegionOwner::Automation(target), true) = (location.owner, self.drop_empty_lane) {
            let track = project.require_track_mut(location.track)?;
            if let Some(index) = track
                .automation
                .iter()
                .position(|lane| lane.target == target && lane.regions.is_empty())
            {
                lane = Some((index, track.automation.remove(index)));
            }
        }
        Ok(ActionOutcome::new(
            RestoreRegion {
                location,
                region,
                lane,
            },
            effects_for(location.owner),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RestoreRegion {
    location: RegionLocation,
    region: Region,
    lane: Option<(usize, AutomationTrack)>,
}

impl Action for RestoreRegion {
    fn describe(&self) -> String {
        format!("Restore {}", self.region.id)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        if project.find_region(self.region.id).is_some() {
            return Err(ActionError::invalid(format!("{} already exists", self.region.id)));
        }
        if let Some((index, lane)) = &self.lane {
            let track = project.require_track_mut(self.location.track)?;
            let index = (*index).min(track.automation.len());
            track.automation.insert(index, lane.clone());
        }
        if let Err(err) = place(project, self.location, self.region.clone()) {
            if let (Some((_, lane)), Some(track)) = (&self.lane, project.track_mut(self.location.track)) {
                track.automation.retain(|existing| existing.target != lane.target);
            }
            return Err(err);
        }
        Ok(ActionOutcome::new(
            DeleteRegion {
                region: self.region.id,
                drop_empty_lane: self.lane.is_some(),
            },
            effects_for(self.location.owner),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Moves a region in time, and for lane regions optionally to another lane
/// or another track of the same kind.
pub struct MoveRegion {
    region: RegionId,
    position: u64,
    track: Option<TrackId>,
    lane: Option<usize>,
}

impl MoveRegion {
    pub fn new(region: RegionId, position: u64) -> Self {
        Self {
            region,
            position,
            track: None,
            lane: None,
        }
    }

    pub fn to_lane(mut self, track: TrackId, lane: usize) -> Self {
        self.track = Some(track);
        self.lane = Some(lane);
        self
    }
}

impl Action for MoveRegion {
    fn describe(&self) -> String {
        format!("Move {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let from = locate(project, self.region)?;
        let to = match from.owner {
            RegionOwner::Lane(lane) => RegionLocation {
                track: self.track.unwrap_or(from.track),
                owner: RegionOwner::Lane(self.lane.unwrap_or(lane)),
            },
            RegionOwner::Automation(_) => from,
        };
        let original = take(project, from, self.region)?;
        let mut moved = original.clone();
        moved.position = self.position;
        if let Err(err) = place(project, to, moved) {
            place(project, from, original)?;
            return Err(err);
        }
        let back = MoveRegion {
            region: self.region,
            position: original.position,
            track: Some(from.track),
            lane: match from.owner {
                RegionOwner::Lane(lane) => Some(lane),
                RegionOwner::Automation(_) => None,
            },
        };
        let mut effects = effects_for(from.owner);
        if to.track != from.track {
            effects = effects | Effects::content();
        }
        Ok(ActionOutcome::new(back, effects))
    }

    fn should_merge(&self, previous: &dyn Action) -> bool {
        previous
            .as_any()
            .downcast_ref::<MoveRegion>()
            .is_some_and(|p| p.region == self.region)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Swaps a region for a new version with the same id.
pub struct ReplaceRegion {
    region: Region,
}

impl ReplaceRegion {
    pub fn new(region: Region) -> Self {
        Self { region }
    }
}

impl Action for ReplaceRegion {
    fn describe(&self) -> String {
        format!("Edit {}", self.region.id)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let location = locate(project, self.region.id)?;
        let previous = take(project, location, self.region.id)?;
        if previous.kind() != self.region.kind() {
            place(project, location, previous)?;
            return Err(ActionError::invalid("a region cannot change its kind"));
        }
        if let Err(err) = place(project, location, self.region.clone()) {
            place(project, location, previous)?;
            return Err(err);
        }
        Ok(ActionOutcome::new(ReplaceRegion::new(previous), effects_for(location.owner)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ResizeRegion {
    region: RegionId,
    length: u64,
}

impl ResizeRegion {
    pub fn new(region: RegionId, length: u64) -> Self {
        Self { region, length }
    }
}

impl Action for ResizeRegion {
    fn describe(&self) -> String {
        format!("Resize {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let length = self.length;
        edit_region(ctx, self.region, |region| {
            if length == 0 {
                return Err(ActionError::invalid("regions cannot be empty"));
            }
            region.resize(length);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SetRegionMuted {
    region: RegionId,
    muted: bool,
}

impl SetRegionMuted {
    pub fn new(region: RegionId, muted: bool) -> Self {
        Self { region, muted }
    }
}

impl Action for SetRegionMuted {
    fn describe(&self) -> String {
        if self.muted {
            format!("Mute {}", self.region)
        } else {
            format!("Unmute {}", self.region)
        }
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let muted = self.muted;
        edit_region(ctx, self.region, |region| {
            region.muted = muted;
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sets both fades. Fade lengths are limited to the region length.
pub struct SetRegionFades {
    region: RegionId,
    fade_in: Fade,
    fade_out: Fade,
}

impl SetRegionFades {
    pub fn new(region: RegionId, fade_in: Fade, fade_out: Fade) -> Self {
        Self {
            region,
            fade_in,
            fade_out,
        }
    }
}

impl Action for SetRegionFades {
    fn describe(&self) -> String {
        format!("Set fades of {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let (fade_in, fade_out) = (self.fade_in, self.fade_out);
        edit_region(ctx, self.region, |region| {
            if region.curve().is_some() {
                return Err(ActionError::invalid("automation regions have no fades"));
            }
            region.fade_in = Fade::new(fade_in.length.min(region.length), fade_in.curve);
            region.fade_out = Fade::new(fade_out.length.min(region.length), fade_out.curve);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Cuts a region in two at a timeline position.
pub struct SplitRegion {
    region: RegionId,
    position: u64,
}

impl SplitRegion {
    pub fn new(region: RegionId, position: u64) -> Self {
        Self { region, position }
    }
}

impl Action for SplitRegion {
    fn describe(&self) -> String {
        format!("Split {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let original = project
            .region(self.region)
            .cloned()
            .ok_or_else(|| ActionError::not_found("region", self.region))?;
        let mut left = original.clone();
        let right = left
            .split_at(self.position, &mut project.ids)
            .ok_or_else(|| ActionError::invalid(format!("{} does not span {}", self.region, self.position)))?;
        let right_id = right.id;
        let outcome = ApplySplit { left, right }.perform(ctx)?;
        Ok(ActionOutcome::new(
            Unsplit {
                original,
                right: right_id,
            },
            outcome.effects,
        )
        .with_created(ObjectId::Region(right_id)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ApplySplit {
    left: Region,
    right: Region,
}

impl Action for ApplySplit {
    fn describe(&self) -> String {
        format!("Split {}", self.left.id)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let location = locate(project, self.left.id)?;
        let original = take(project, location, self.left.id)?;
        place(project, location, self.left.clone())?;
        if let Err(err) = place(project, location, self.right.clone()) {
            take(project, location, self.left.id)?;
            place(project, location, original)?;
            return Err(err);
        }
        Ok(ActionOutcome::new(
            Unsplit {
                original,
                right: self.right.id,
            },
            effects_for(location.owner),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Unsplit {
    original: Region,
    right: RegionId,
}

impl Action for Unsplit {
    fn describe(&self) -> String {
        format!("Join {}", self.original.id)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let location = locate(project, self.original.id)?;
        let right_location = locate(project, self.right)?;
        let right = take(project, right_location, self.right)?;
        let left = take(project, location, self.original.id)?;
        place(project, location, self.original.clone())?;
        Ok(ActionOutcome::new(ApplySplit { left, right }, effects_for(location.owner)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Note placement in region content samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteSpec {
    pub start: u64,
    pub length: u64,
    pub pitch: u8,
    pub velocity: u8,
}

fn check_note(pitch: u8, velocity: u8, length: u64) -> Result<(), ActionError> {
    if pitch > 127 || !(1..=127).contains(&velocity) || length == 0 {
        return Err(ActionError::invalid(format!(
            "note pitch {pitch} velocity {velocity} length {length} is out of range"
        )));
    }
    Ok(())
}

fn note_index(region: &Region, note: NoteId) -> Result<usize, ActionError> {
    region
        .notes()
        .ok_or_else(|| ActionError::invalid(format!("{} holds no notes", region.id)))?
        .iter()
        .position(|n| n.id == note)
        .ok_or_else(|| ActionError::not_found("note", note))
}

pub struct AddNote {
    region: RegionId,
    note: NoteSpec,
}

impl AddNote {
    pub fn new(region: RegionId, note: NoteSpec) -> Self {
        Self { region, note }
    }
}

impl Action for AddNote {
    fn describe(&self) -> String {
        format!("Add note to {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let NoteSpec {
            start,
            length,
            pitch,
            velocity,
        } = self.note;
        check_note(pitch, velocity, length)?;
        let id = ctx.project.ids.note();
        let note = MidiNote {
            id,
            start,
            length,
            pitch,
            velocity,
        };
        let outcome = edit_region(ctx, self.region, |region| {
            if region.insert_note(note) {
                Ok(())
            } else {
                Err(ActionError::invalid(format!("{} holds no notes", region.id)))
            }
        })?;
        Ok(outcome.with_created(ObjectId::Note(id)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MoveNote {
    region: RegionId,
    note: NoteId,
    start: u64,
    pitch: u8,
}

impl MoveNote {
    pub fn new(region: RegionId, note: NoteId, start: u64, pitch: u8) -> Self {
        Self {
            region,
            note,
            start,
            pitch,
        }
    }
}

impl Action for MoveNote {
    fn describe(&self) -> String {
        format!("Move {}", self.note)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let (id, start, pitch) = (self.note, self.start, self.pitch);
        edit_region(ctx, self.region, |region| {
            let index = note_index(region, id)?;
            let notes = region
                .notes_mut()
                .ok_or_else(|| ActionError::invalid("region holds no notes"))?;
            let mut note = notes.remove(index);
            check_note(pitch, note.velocity, note.length)?;
            note.start = start;
            note.pitch = pitch;
            region.insert_note(note);
            Ok(())
        })
    }

    fn should_merge(&self, previous: &dyn Action) -> bool {
        previous
            .as_any()
            .downcast_ref::<MoveNote>()
            .is_some_and(|p| p.region == self.region && p.note == self.note)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DeleteNote {
    region: RegionId,
    note: NoteId,
}

impl DeleteNote {
    pub fn new(region: RegionId, note: NoteId) -> Self {
        Self { region, note }
    }
}

impl Action for DeleteNote {
    fn describe(&self) -> String {
        format!("Delete {}", self.note)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let id = self.note;
        edit_region(ctx, self.region, |region| {
            let index = note_index(region, id)?;
            if let Some(notes) = region.notes_mut() {
                notes.remove(index);
            }
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn curve_of(region: &mut Region) -> Result<&mut crate::automation::AutomationCurve, ActionError> {
    let id = region.id;
    region
        .curve_mut()
        .ok_or_else(|| ActionError::invalid(format!("{id} is not an automation region")))
}

/// Adds a point at a region-local position, replacing any point already
/// there.
pub struct AddAutomationPoint {
    region: RegionId,
    point: AutomationPoint,
}

impl AddAutomationPoint {
    pub fn new(region: RegionId, point: AutomationPoint) -> Self {
        Self { region, point }
    }
}

impl Action for AddAutomationPoint {
    fn describe(&self) -> String {
        format!("Add automation point to {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let point = self.point;
        edit_region(ctx, self.region, |region| {
            curve_of(region)?.add_point(point);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MoveAutomationPoint {
    region: RegionId,
    index: usize,
    position: u64,
    value: f32,
}

impl MoveAutomationPoint {
    pub fn new(region: RegionId, index: usize, position: u64, value: f32) -> Self {
        Self {
            region,
            index,
            position,
            value,
        }
    }
}

impl Action for MoveAutomationPoint {
    fn describe(&self) -> String {
        format!("Move automation point of {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let (index, position, value) = (self.index, self.position, self.value);
        edit_region(ctx, self.region, |region| {
            let curve = curve_of(region)?;
            let point = curve
                .remove_point(index)
                .ok_or_else(|| ActionError::not_found("automation point", index))?;
            let moved = AutomationPoint::new(position, value, point.curve).with_curviness(point.curviness);
            curve.add_point(moved);
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DeleteAutomationPoint {
    region: RegionId,
    index: usize,
}

impl DeleteAutomationPoint {
    pub fn new(region: RegionId, index: usize) -> Self {
        Self { region, index }
    }
}

impl Action for DeleteAutomationPoint {
    fn describe(&self) -> String {
        format!("Delete automation point of {}", self.region)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let index = self.index;
        edit_region(ctx, self.region, |region| {
            curve_of(region)?
                .remove_point(index)
                .map(|_| ())
                .ok_or_else(|| ActionError::not_found("automation point", index))
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Swaps the whole automation lane of `target` on `track`. `None` removes
/// the lane.
pub struct ReplaceAutomationLane {
    track: TrackId,
    target: ParamAddress,
    lane: Option<AutomationTrack>,
    index: Option<usize>,
}

impl ReplaceAutomationLane {
    pub fn new(track: TrackId, target: ParamAddress, lane: Option<AutomationTrack>) -> Self {
        Self {
            track,
            target,
            lane,
            index: None,
        }
    }
}

impl Action for ReplaceAutomationLane {
    fn describe(&self) -> String {
        format!("Edit automation of {}", self.target)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        if let Some(lane) = &self.lane {
            if lane.target != self.target {
                return Err(ActionError::invalid("lane target mismatch"));
            }
            if project.param_owner(self.target) != Some(self.track) {
                return Err(ActionError::invalid(format!("{} is not automated on {}", self.target, self.track)));
            }
        }
        let track = project.require_track_mut(self.track)?;
        let existing = track.automation.iter().position(|lane| lane.target == self.target);
        let (previous, index) = match (existing, &self.lane) {
            (Some(index), Some(lane)) => (
                Some(std::mem::replace(&mut track.automation[index], lane.clone())),
                index,
            ),
            (Some(index), None) => (Some(track.automation.remove(index)), index),
            (None, Some(lane)) => {
                let index = self.index.unwrap_or(track.automation.len()).min(track.automation.len());
                track.automation.insert(index, lane.clone());
                (None, index)
            }
            (None, None) => (None, self.index.unwrap_or(track.automation.len())),
        };
        Ok(ActionOutcome::new(
            ReplaceAutomationLane {
                track: self.track,
                target: self.target,
                lane: previous,
                index: Some(index),
            },
            Effects::automation(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sets the automation mode of a parameter, creating its lane if needed.
pub struct SetAutomationMode {
    target: ParamAddress,
    mode: AutomationMode,
}

impl SetAutomationMode {
    pub fn new(target: ParamAddress, mode: AutomationMode) -> Self {
        Self { target, mode }
    }
}

impl Action for SetAutomationMode {
    fn describe(&self) -> String {
        format!("Set {} automation to {:?}", self.target, self.mode)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let track = ctx
            .project
            .param_owner(self.target)
            .ok_or_else(|| ActionError::not_found("parameter", self.target))?;
        let mut lane = ctx
            .project
            .track(track)
            .and_then(|t| t.automation.iter().find(|lane| lane.target == self.target))
            .cloned()
            .unwrap_or_else(|| AutomationTrack::new(self.target));
        lane.mode = self.mode;
        ReplaceAutomationLane::new(track, self.target, Some(lane)).perform(ctx)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::run;
    use crate::actions::CreateTrack;
    use crate::automation::CurveKind;
    use crate::ids::ClipId;
    use crate::model::{AudioClip, TrackKind};

    fn project_with(kind: TrackKind) -> (ProjectState, TrackId) {
        let mut project = ProjectState::new("p", 48_000);
        run(&mut project, &CreateTrack::new(kind, "T")).unwrap();
        let track = project.tracks[1].id;
        (project, track)
    }

    fn add(project: &mut ProjectState, action: AddRegion) -> RegionId {
        let outcome = run(project, &action).unwrap();
        match outcome.created[0] {
            ObjectId::Region(id) => id,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn audio_project() -> (ProjectState, TrackId, ClipId) {
        let (mut project, track) = project_with(TrackKind::Audio);
        let clip = project.ids.clip();
        project
            .pool
            .insert(AudioClip::new(clip, "clip", 48_000, vec![vec![0.0; 1_000]; 2]));
        (project, track, clip)
    }

    #[test]
    fn regions_reject_overlap_and_wrong_kind() {
        let (mut project, track, clip) = audio_project();
        add(&mut project, AddRegion::new(track, 0, Region::audio(RegionId(0), 0, 100, clip)));
        assert!(run(&mut project, &AddRegion::new(track, 0, Region::audio(RegionId(0), 50, 100, clip))).is_err());
        assert!(run(&mut project, &AddRegion::new(track, 0, Region::midi(RegionId(0), 200, 100))).is_err());
        assert!(project.ensure_invariants().is_ok());
    }

    #[test]
    fn move_reverts_when_the_target_is_taken() {
        let (mut project, track, clip) = audio_project();
        let a = add(&mut project, AddRegion::new(track, 0, Region::audio(RegionId(0), 0, 100, clip)));
        add(&mut project, AddRegion::new(track, 0, Region::audio(RegionId(0), 200, 100, clip)));
        let before = project.clone();
        assert!(run(&mut project, &MoveRegion::new(a, 150)).is_err());
        assert_eq!(project, before);

        let outcome = run(&mut project, &MoveRegion::new(a, 400)).unwrap();
        assert_eq!(project.region(a).unwrap().position, 400);
        run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project, before);
    }

    #[test]
    fn split_and_join() {
        let (mut project, track, clip) = audio_project();
        let id = add(&mut project, AddRegion::new(track, 0, Region::audio(RegionId(0), 100, 400, clip)));
        let before = project.clone();
        let outcome = run(&mut project, &SplitRegion::new(id, 300)).unwrap();
        let ObjectId::Region(right) = outcome.created[0] else {
            panic!("split created nothing");
        };
        assert_eq!(project.region(id).unwrap().end(), 300);
        let right_region = project.region(right).unwrap();
        assert_eq!((right_region.position, right_region.clip_start), (300, 200));
        assert!(project.ensure_invariants().is_ok());

        let redo = run(&mut project, &*outcome.inverse).unwrap();
        assert_eq!(project.tracks, before.tracks);
        // Joining does not hand the right half's id back.
        assert_ne!(project.ids, before.ids);
        run(&mut project, &*redo.inverse).unwrap();
        assert!(project.region(right).is_some());
        assert!(run(&mut project, &SplitRegion::new(id, 100)).is_err());
    }

    #[test]
    fn notes_are_added_moved_and_removed() {
        let (mut project, track) = project_with(TrackKind::Midi);
        let region = add(&mut project, AddRegion::new(track, 0, Region::midi(RegionId(0), 0, 960)));
        let spec = NoteSpec {
            start: 480,
            length: 120,
            pitch: 60,
            velocity: 100,
        };
        let added = run(&mut project, &AddNote::new(region, spec)).unwrap();
        let ObjectId::Note(note) = added.created[0] else {
            panic!("no note");
        };
        let first = NoteSpec { start: 0, ..spec };
        run(&mut project, &AddNote::new(region, first)).unwrap();
        let starts: Vec<_> = project.region(region).unwrap().notes().unwrap().iter().map(|n| n.start).collect();
        assert_eq!(starts, vec![0, 480]);

        let moved = run(&mut project, &MoveNote::new(region, note, 10, 64)).unwrap();
        assert_eq!(project.region(region).unwrap().notes().unwrap()[1].pitch, 64);
        run(&mut project, &*moved.inverse).unwrap();
        assert_eq!(project.region(region).unwrap().notes().unwrap()[1].start, 480);

        run(&mut project, &DeleteNote::new(region, note)).unwrap();
        assert_eq!(project.region(region).unwrap().notes().unwrap().len(), 1);
        assert!(run(&mut project, &AddNote::new(region, NoteSpec { pitch: 200, ..spec })).is_err());
    }

    #[test]
    fn automation_lane_lifecycle() {
        let (mut project, track) = project_with(TrackKind::Audio);
        let target = ParamAddress::amp(track);
        let before = project.clone();
        let mut region = Region::automation(RegionId(0), 0, 100);
        region
            .curve_mut()
            .unwrap()
            .add_point(AutomationPoint::new(0, 0.0, CurveKind::Linear));
        let outcome = run(&mut project, &AddRegion::automation(track, target, region)).unwrap();
        let ObjectId::Region(id) = outcome.created[0] else {
            panic!("no region");
        };
        run(
            &mut project,
            &AddAutomationPoint::new(id, AutomationPoint::new(100, 1.0, CurveKind::Linear)),
        )
        .unwrap();
        let lane = &project.track(track).unwrap().automation[0];
        assert_eq!(lane.value_at(50), Some(0.5));
        assert!(project.ensure_invariants().is_ok());

        run(&mut project, &MoveAutomationPoint::new(id, 1, 50, 0.5)).unwrap();
        assert_eq!(project.region(id).unwrap().curve().unwrap().points()[1].position, 50);
        run(&mut project, &DeleteAutomationPoint::new(id, 1)).unwrap();
        assert_eq!(project.region(id).unwrap().curve().unwrap().len(), 1);

        let mode = run(&mut project, &SetAutomationMode::new(target, AutomationMode::Latch)).unwrap();
        assert_eq!(project.track(track).unwrap().automation[0].mode, AutomationMode::Latch);
        run(&mut project, &*mode.inverse).unwrap();

        let removed = run(&mut project, &DeleteRegion { region: id, drop_empty_lane: true }).unwrap();
        assert_eq!(project.tracks, before.tracks);
        run(&mut project, &*removed.inverse).unwrap();
        assert_eq!(project.track(track).unwrap().automation.len(), 1);
    }

    #[test]
    fn fades_are_limited_to_the_region() {
        let (mut project, track, clip) = audio_project();
        let id = add(&mut project, AddRegion::new(track, 0, Region::audio(RegionId(0), 0, 100, clip)));
        let fade = Fade::new(500, crate::automation::FadeCurve::default());
        run(&mut project, &SetRegionFades::new(id, fade, Fade::default())).unwrap();
        assert_eq!(project.region(id).unwrap().fade_in.length, 100);
        let muted = run(&mut project, &SetRegionMuted::new(id, true)).unwrap();
        assert!(project.region(id).unwrap().muted);
        run(&mut project, &*muted.inverse).unwrap();
        assert!(!project.region(id).unwrap().muted);
        assert!(run(&mut project, &ResizeRegion::new(id, 0)).is_err());
    }
}
