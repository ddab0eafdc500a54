use std::any::Any;
use std::collections::HashSet;

use super::{
    capture_plugin_state, detach_lanes, detach_nodes, detach_sends, reattach_lanes, reattach_nodes,
    reattach_sends, removal_reversibility, track_nodes, Action, ActionContext, ActionOutcome,
    Detached, DetachedLanes, DetachedSends, Effects, PluginStates, Reversibility,
};
use crate::error::ActionError;
use crate::graph::NodeRef;
use crate::ids::{ObjectId, PluginId, TrackId};
use crate::model::{ParamAddress, ProjectState, SendTarget, Track, TrackKind};
use crate::recording::RecordingMode;

pub struct CreateTrack {
    kind: TrackKind,
    name: String,
    index: Option<usize>,
    recording_mode: Option<RecordingMode>,
}

impl CreateTrack {
    pub fn new(kind: TrackKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            index: None,
            recording_mode: None,
        }
    }

    /// Position in the track list. Index 0 is reserved for the master.
    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_recording_mode(mut self, mode: RecordingMode) -> Self {
        self.recording_mode = Some(mode);
        self
    }
}

impl Action for CreateTrack {
    fn describe(&self) -> String {
        format!("Create track \"{}\"", self.name)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        if self.kind == TrackKind::Master {
            return Err(ActionError::invalid("a project has exactly one master track"));
        }
        let project = &mut *ctx.project;
        let master = project
            .master_id()
            .ok_or_else(|| ActionError::invariant("project has no master"))?;
        let id = project.ids.track();
        let mut track = Track::new(id, self.name.clone(), self.kind);
        if let Some(mode) = self.recording_mode {
            track.recording_mode = mode;
        }
        if let Some(channel) = track.channel_mut() {
            channel.direct_out = Some(master);
        }
        let index = self
            .index
            .unwrap_or(project.tracks.len())
            .clamp(1, project.tracks.len());
        project.tracks.insert(index, track);
        Ok(
            ActionOutcome::new(DeleteTrack::new(id), Effects::graph() | Effects::params())
                .with_created(ObjectId::Track(id)),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Removes a track along with everything routed into it: direct outputs
/// of other channels are cleared and sends targeting the track or its
/// plugins are dropped.
pub struct DeleteTrack {
    track: TrackId,
}

impl DeleteTrack {
    pub fn new(track: TrackId) -> Self {
        Self { track }
    }
}

impl Action for DeleteTrack {
    fn describe(&self) -> String {
        format!("Delete {}", self.track)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let index = project
            .track_index(self.track)
            .ok_or_else(|| ActionError::not_found("track", self.track))?;
        if project.tracks[index].is_master() {
            return Err(ActionError::invalid("the master track cannot be deleted"));
        }
        let owned: HashSet<PluginId> = project.tracks[index]
            .channel()
            .map(|channel| channel.plugins().map(|(_, _, slot)| slot.id).collect())
            .unwrap_or_default();

        let mut routes = Vec::new();
        for other in project.tracks.iter_mut() {
            let other_id = other.id;
            let Some(channel) = other.channel_mut() else { continue };
            if channel.direct_out == Some(self.track) {
                channel.direct_out = None;
                routes.push(other_id);
            }
        }
        let track = self.track;
        let sends = detach_sends(project, |target| match target {
            SendTarget::Track(target) => target == track,
            SendTarget::Sidechain { plugin, .. } => owned.contains(&plugin),
        });

        let dropped: HashSet<_> = sends.iter().map(|(_, _, send)| send.id).collect();
        let lanes = detach_lanes(project, |target| {
            matches!(target, ParamAddress::Send { send } if dropped.contains(&send))
        });
        let mut nodes = track_nodes(&project.tracks[index]);
        nodes.extend(sends.iter().map(|(_, _, send)| NodeRef::Send(send.id)));
        let connections = detach_nodes(project, nodes);

        let mut track = project.tracks.remove(index);
        if let Some(channel) = track.channel_mut() {
            for slot in channel.plugins_mut() {
                capture_plugin_state(ctx.plugins, slot);
            }
        }
        Ok(ActionOutcome::new(
            RestoreTrack {
                index,
                track,
                routes,
                sends,
                lanes,
                connections,
            },
            Effects::graph() | Effects::content() | Effects::params() | Effects::automation(),
        ))
    }

    fn reversibility(&self, project: &ProjectState, plugins: &dyn PluginStates) -> Reversibility {
        let Some(channel) = project.track(self.track).and_then(Track::channel) else {
            return Reversibility::FullyReversible;
        };
        removal_reversibility(plugins, channel.plugins().map(|(_, _, slot)| slot))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RestoreTrack {
    index: usize,
    track: Track,
    routes: Vec<TrackId>,
    sends: DetachedSends,
    lanes: DetachedLanes,
    connections: Detached,
}

impl Action for RestoreTrack {
    fn describe(&self) -> String {
        format!("Restore track \"{}\"", self.track.name)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        if project.track(self.track.id).is_some() {
            return Err(ActionError::invalid(format!("{} already exists", self.track.id)));
        }
        let index = self.index.clamp(1, project.tracks.len());
        project.tracks.insert(index, self.track.clone());
        reattach_sends(project, &self.sends);
        for owner in &self.routes {
            if let Some(channel) = project.track_mut(*owner).and_then(Track::channel_mut) {
                channel.direct_out = Some(self.track.id);
            }
        }
        reattach_lanes(project, &self.lanes);
        reattach_nodes(project, &self.connections);
        Ok(ActionOutcome::new(
            DeleteTrack::new(self.track.id),
            Effects::graph() | Effects::content() | Effects::params() | Effects::automation(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackProperty {
    Name(String),
    /// `0xRRGGBB`.
    Color(u32),
    Muted(bool),
    Soloed(bool),
    Enabled(bool),
    Armed(bool),
    RecordingMode(RecordingMode),
}

pub struct SetTrackProperty {
    track: TrackId,
    property: TrackProperty,
}

impl SetTrackProperty {
    pub fn new(track: TrackId, property: TrackProperty) -> Self {
        Self { track, property }
    }
}

impl Action for SetTrackProperty {
    fn describe(&self) -> String {
        match &self.property {
            TrackProperty::Name(name) => format!("Rename {} to \"{name}\"", self.track),
            TrackProperty::Color(_) => format!("Recolor {}", self.track),
            TrackProperty::Muted(on) => toggle("Mute", *on, self.track),
            TrackProperty::Soloed(on) => toggle("Solo", *on, self.track),
            TrackProperty::Enabled(on) => toggle("Enable", *on, self.track),
            TrackProperty::Armed(on) => toggle("Arm", *on, self.track),
            TrackProperty::RecordingMode(mode) => format!("Set {} recording mode to {mode:?}", self.track),
        }
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let track = ctx.project.require_track_mut(self.track)?;
        let (previous, effects) = match &self.property {
            TrackProperty::Name(name) => (
                TrackProperty::Name(std::mem::replace(&mut track.name, name.clone())),
                Effects::graph(),
            ),
            TrackProperty::Color(color) => (
                TrackProperty::Color(std::mem::replace(&mut track.color, *color)),
                Effects::NONE,
            ),
            TrackProperty::Muted(on) => (
                TrackProperty::Muted(std::mem::replace(&mut track.muted, *on)),
                Effects::params(),
            ),
            TrackProperty::Soloed(on) => (
                TrackProperty::Soloed(std::mem::replace(&mut track.soloed, *on)),
                Effects::params(),
            ),
            TrackProperty::Enabled(on) => {
                if track.is_master() && !on {
                    return Err(ActionError::invalid("the master track cannot be disabled"));
                }
                (
                    TrackProperty::Enabled(std::mem::replace(&mut track.enabled, *on)),
                    Effects::params(),
                )
            }
            TrackProperty::Armed(on) => {
                if *on && !track.kind.can_record() {
                    return Err(ActionError::invalid(format!(
                        "{:?} tracks cannot be armed",
                        track.kind
                    )));
                }
                (
                    TrackProperty::Armed(std::mem::replace(&mut track.armed, *on)),
                    Effects::params(),
                )
            }
            TrackProperty::RecordingMode(mode) => (
                TrackProperty::RecordingMode(std::mem::replace(&mut track.recording_mode, *mode)),
                Effects::NONE,
            ),
        };
        Ok(ActionOutcome::new(SetTrackProperty::new(self.track, previous), effects))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn toggle(verb: &str, on: bool, track: TrackId) -> String {
    if on {
        format!("{verb} {track}")
    } else {
        format!("Un{} {track}", verb.to_lowercase())
    }
}

/// Moves a track within the list. The master stays first.
pub struct MoveTrack {
    track: TrackId,
    index: usize,
}

impl MoveTrack {
    pub fn new(track: TrackId, index: usize) -> Self {
        Self { track, index }
    }
}

impl Action for MoveTrack {
    fn describe(&self) -> String {
        format!("Move {}", self.track)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let from = project
            .track_index(self.track)
            .ok_or_else(|| ActionError::not_found("track", self.track))?;
        if from == 0 {
            return Err(ActionError::invalid("the master track cannot be moved"));
        }
        let to = self.index.clamp(1, project.tracks.len() - 1);
        let track = project.tracks.remove(from);
        project.tracks.insert(to, track);
        Ok(ActionOutcome::new(MoveTrack::new(self.track, from), Effects::NONE))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
