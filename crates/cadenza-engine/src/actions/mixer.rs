use std::any::Any;

use cadenza_plugin_host::PluginDescriptor;

use super::{
    capture_plugin_state, check_routing, detach_lanes, detach_nodes, detach_sends, reattach_lanes,
    reattach_nodes, reattach_sends, removal_reversibility, Action, ActionContext, ActionOutcome,
    Detached, DetachedLanes, DetachedSends, Effects, PluginStates, Reversibility,
};
use crate::error::ActionError;
use crate::graph::NodeRef;
use crate::ids::{ObjectId, PluginId, SendId, TrackId};
use crate::model::{
    ChannelSend, ParamAddress, PluginLocation, PluginSlot, ProjectState, SendTarget, SlotKind, Track,
};

/// Checks that `slot` on `track` can take one more plugin of `descriptor`.
/// `moving` is the plugin being relocated, which does not count against
/// the capacity of its own list.
fn check_slot(
    project: &ProjectState,
    track: TrackId,
    slot: SlotKind,
    descriptor: &PluginDescriptor,
    moving: Option<PluginId>,
) -> Result<(), ActionError> {
    let owner = project.require_track(track)?;
    let channel = owner
        .channel()
        .ok_or_else(|| ActionError::invalid(format!("{track} has no mixer strip")))?;
    if !slot.accepts(descriptor.category) {
        return Err(ActionError::Plugin(format!(
            "{} ({:?}) cannot go into the {slot:?} slot",
            descriptor.name, descriptor.category
        )));
    }
    if slot != SlotKind::Insert && !owner.kind.is_midi_based() {
        return Err(ActionError::invalid(format!("{track} does not carry MIDI")));
    }
    let occupied = channel
        .slots(slot)
        .iter()
        .filter(|plugin| Some(plugin.id) != moving)
        .count();
    if occupied >= slot.capacity() {
        return Err(ActionError::invalid(format!("{slot:?} slots of {track} are full")));
    }
    Ok(())
}

fn require_location(project: &ProjectState, plugin: PluginId) -> Result<PluginLocation, ActionError> {
    project
        .find_plugin(plugin)
        .ok_or_else(|| ActionError::not_found("plugin", plugin))
}

pub struct AddPlugin {
    track: TrackId,
    slot: SlotKind,
    index: usize,
    descriptor: PluginDescriptor,
}

impl AddPlugin {
    pub fn new(track: TrackId, slot: SlotKind, index: usize, descriptor: PluginDescriptor) -> Self {
        Self {
            track,
            slot,
            index,
            descriptor,
        }
    }
}

impl Action for AddPlugin {
    fn describe(&self) -> String {
        format!("Add {} to {}", self.descriptor.name, self.track)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        check_slot(project, self.track, self.slot, &self.descriptor, None)?;
        let id = project.ids.plugin();
        let channel = project
            .require_track_mut(self.track)?
            .channel_mut()
            .ok_or_else(|| ActionError::invalid(format!("{} has no mixer strip", self.track)))?;
        channel.insert_plugin(self.slot, self.index, PluginSlot::new(id, self.descriptor.clone()));
        Ok(
            ActionOutcome::new(RemovePlugin::new(id), Effects::graph() | Effects::params())
                .with_created(ObjectId::Plugin(id)),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Removes a plugin with its sidechain sends, automation lanes and port
/// connections. The instance state is saved into the undo entry when the
/// plugin allows it.
pub struct RemovePlugin {
    plugin: PluginId,
}

impl RemovePlugin {
    pub fn new(plugin: PluginId) -> Self {
        Self { plugin }
    }
}

impl Action for RemovePlugin {
    fn describe(&self) -> String {
        format!("Remove {}", self.plugin)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let location = require_location(project, self.plugin)?;
        let plugin = self.plugin;
        let sends = detach_sends(project, |target| {
            matches!(target, SendTarget::Sidechain { plugin: target, .. } if target == plugin)
        });
        let lanes = detach_lanes(project, |target| match target {
            ParamAddress::Plugin { plugin: target, .. } => target == plugin,
            ParamAddress::Send { send } => sends.iter().any(|(_, _, s)| s.id == send),
            _ => false,
        });
        let nodes = std::iter::once(NodeRef::Plugin(plugin))
            .chain(sends.iter().map(|(_, _, send)| NodeRef::Send(send.id)));
        let connections = detach_nodes(project, nodes.collect::<Vec<_>>());

        let mut slot = project
            .require_track_mut(location.track)?
            .channel_mut()
            .and_then(|channel| channel.remove_plugin(location.slot, location.index))
            .ok_or_else(|| ActionError::not_found("plugin", plugin))?;
        capture_plugin_state(ctx.plugins, &mut slot);
        Ok(ActionOutcome::new(
            RestorePlugin {
                location,
                slot,
                sends,
                lanes,
                connections,
            },
            Effects::graph() | Effects::params() | Effects::automation(),
        ))
    }

    fn reversibility(&self, project: &ProjectState, plugins: &dyn PluginStates) -> Reversibility {
        match project.plugin(self.plugin) {
            Some(slot) => removal_reversibility(plugins, [slot]),
            None => Reversibility::FullyReversible,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RestorePlugin {
    location: PluginLocation,
    slot: PluginSlot,
    sends: DetachedSends,
    lanes: DetachedLanes,
    connections: Detached,
}

impl Action for RestorePlugin {
    fn describe(&self) -> String {
        format!("Restore {}", self.slot.descriptor.name)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        if project.plugin(self.slot.id).is_some() {
            return Err(ActionError::invalid(format!("{} already exists", self.slot.id)));
        }
        check_slot(project, self.location.track, self.location.slot, &self.slot.descriptor, None)?;
        if let Some(channel) = project.require_track_mut(self.location.track)?.channel_mut() {
            channel.insert_plugin(self.location.slot, self.location.index, self.slot.clone());
        }
        reattach_sends(project, &self.sends);
        reattach_lanes(project, &self.lanes);
        reattach_nodes(project, &self.connections);
        Ok(ActionOutcome::new(
            RemovePlugin::new(self.slot.id),
            Effects::graph() | Effects::params() | Effects::automation(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reorders a plugin or moves it to another strip. Automation of the
/// plugin follows it.
pub struct MovePlugin {
    plugin: PluginId,
    to: PluginLocation,
    /// Positions for the moved lanes in the destination track.
    lane_positions: Vec<usize>,
}

impl MovePlugin {
    pub fn new(plugin: PluginId, track: TrackId, slot: SlotKind, index: usize) -> Self {
        Self {
            plugin,
            to: PluginLocation { track, slot, index },
            lane_positions: Vec::new(),
        }
    }

    fn relocate(&self, project: &mut ProjectState, from: PluginLocation) -> Result<Vec<usize>, ActionError> {
        let slot = project
            .track_mut(from.track)
            .and_then(Track::channel_mut)
            .and_then(|channel| channel.remove_plugin(from.slot, from.index))
            .ok_or_else(|| ActionError::not_found("plugin", self.plugin))?;
        if let Some(channel) = project.track_mut(self.to.track).and_then(Track::channel_mut) {
            channel.insert_plugin(self.to.slot, self.to.index, slot);
        }
        if from.track == self.to.track {
            return Ok(Vec::new());
        }
        let plugin = self.plugin;
        let lanes = detach_lanes(project, |target| {
            matches!(target, ParamAddress::Plugin { plugin: target, .. } if target == plugin)
        });
        let mut positions = Vec::with_capacity(lanes.len());
        if let Some(track) = project.track_mut(self.to.track) {
            for (i, (_, position, lane)) in lanes.into_iter().enumerate() {
                positions.push(position);
                let at = self
                    .lane_positions
                    .get(i)
                    .copied()
                    .unwrap_or(track.automation.len())
                    .min(track.automation.len());
                track.automation.insert(at, lane);
            }
        }
        Ok(positions)
    }
}

impl Action for MovePlugin {
    fn describe(&self) -> String {
        format!("Move {}", self.plugin)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let from = require_location(project, self.plugin)?;
        let descriptor = project
            .plugin(self.plugin)
            .map(|slot| slot.descriptor.clone())
            .ok_or_else(|| ActionError::not_found("plugin", self.plugin))?;
        check_slot(project, self.to.track, self.to.slot, &descriptor, Some(self.plugin))?;

        let positions = self.relocate(project, from)?;
        let landed = require_location(project, self.plugin)?;
        let back = MovePlugin {
            plugin: self.plugin,
            to: from,
            lane_positions: positions,
        };
        if let Err(err) = check_routing(project) {
            back.relocate(project, landed)?;
            return Err(err);
        }
        Ok(ActionOutcome::new(back, Effects::graph() | Effects::params() | Effects::automation()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SetPluginEnabled {
    plugin: PluginId,
    enabled: bool,
}

impl SetPluginEnabled {
    pub fn new(plugin: PluginId, enabled: bool) -> Self {
        Self { plugin, enabled }
    }
}

impl Action for SetPluginEnabled {
    fn describe(&self) -> String {
        if self.enabled {
            format!("Enable {}", self.plugin)
        } else {
            format!("Bypass {}", self.plugin)
        }
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let slot = ctx
            .project
            .plugin_mut(self.plugin)
            .ok_or_else(|| ActionError::not_found("plugin", self.plugin))?;
        let previous = std::mem::replace(&mut slot.enabled, self.enabled);
        Ok(ActionOutcome::new(
            SetPluginEnabled::new(self.plugin, previous),
            Effects::params(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn check_send_target(project: &ProjectState, track: TrackId, target: SendTarget) -> Result<(), ActionError> {
    match target {
        SendTarget::Track(target) => {
            let dest = project.require_track(target)?;
            if target == track || !dest.kind.accepts_routing() {
                return Err(ActionError::invalid(format!("{target} cannot receive a send from {track}")));
            }
        }
        SendTarget::Sidechain { plugin, first_input } => {
            let slot = project
                .plugin(plugin)
                .ok_or_else(|| ActionError::not_found("plugin", plugin))?;
            if first_input.saturating_add(2) > slot.descriptor.audio_inputs {
                return Err(ActionError::invalid(format!(
                    "{plugin} has no input pair at {first_input}"
                )));
            }
        }
    }
    Ok(())
}

pub struct AddSend {
    track: TrackId,
    target: SendTarget,
    amount: f32,
    pre_fader: bool,
}

impl AddSend {
    pub fn new(track: TrackId, target: SendTarget) -> Self {
        Self {
            track,
            target,
            amount: 1.0,
            pre_fader: false,
        }
    }

    pub fn with_amount(mut self, amount: f32) -> Self {
        self.amount = amount;
        self
    }

    pub fn pre_fader(mut self, pre_fader: bool) -> Self {
        self.pre_fader = pre_fader;
        self
    }
}

impl Action for AddSend {
    fn describe(&self) -> String {
        format!("Add send on {}", self.track)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        check_send_target(project, self.track, self.target)?;
        if project.require_track(self.track)?.channel().is_none() {
            return Err(ActionError::invalid(format!("{} has no mixer strip", self.track)));
        }
        let ids = project.ids.clone();
        let id = project.ids.send();
        let mut send = ChannelSend::new(id, self.target);
        send.amount = ChannelSend::amount_range().clamp(self.amount);
        send.pre_fader = self.pre_fader;
        if let Some(channel) = project.track_mut(self.track).and_then(Track::channel_mut) {
            channel.sends.push(send);
        }
        if let Err(err) = check_routing(project) {
            if let Some(channel) = project.track_mut(self.track).and_then(Track::channel_mut) {
                channel.sends.retain(|send| send.id != id);
            }
            // A rejected send never consumed its id.
            project.ids = ids;
            return Err(err);
        }
        Ok(ActionOutcome::new(RemoveSend::new(id), Effects::graph() | Effects::params())
            .with_created(ObjectId::Send(id)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct RemoveSend {
    send: SendId,
}

impl RemoveSend {
    pub fn new(send: SendId) -> Self {
        Self { send }
    }
}

impl Action for RemoveSend {
    fn describe(&self) -> String {
        format!("Remove {}", self.send)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let (track, _) = project
            .find_send(self.send)
            .ok_or_else(|| ActionError::not_found("send", self.send))?;
        let id = self.send;
        let lanes = detach_lanes(project, |target| target == ParamAddress::Send { send: id });
        let connections = detach_nodes(project, [NodeRef::Send(id)]);
        let channel = project
            .require_track_mut(track)?
            .channel_mut()
            .ok_or_else(|| ActionError::not_found("send", id))?;
        let index = channel
            .sends
            .iter()
            .position(|send| send.id == id)
            .ok_or_else(|| ActionError::not_found("send", id))?;
        let send = channel.sends.remove(index);
        Ok(ActionOutcome::new(
            RestoreSend {
                sends: vec![(track, index, send)],
                lanes,
                connections,
            },
            Effects::graph() | Effects::params() | Effects::automation(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RestoreSend {
    sends: DetachedSends,
    lanes: DetachedLanes,
    connections: Detached,
}

impl Action for RestoreSend {
    fn describe(&self) -> String {
        "Restore send".to_owned()
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let (_, _, send) = self
            .sends
            .first()
            .ok_or_else(|| ActionError::invalid("nothing to restore"))?;
        if project.find_send(send.id).is_some() {
            return Err(ActionError::invalid(format!("{} already exists", send.id)));
        }
        let id = send.id;
        reattach_sends(project, &self.sends);
        reattach_lanes(project, &self.lanes);
        reattach_nodes(project, &self.connections);
        Ok(ActionOutcome::new(
            RemoveSend::new(id),
            Effects::graph() | Effects::params() | Effects::automation(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Replaces a send's target, amount, tap point and enable flag at once.
pub struct UpdateSend {
    send: ChannelSend,
}

impl UpdateSend {
    pub fn new(send: ChannelSend) -> Self {
        Self { send }
    }
}

impl Action for UpdateSend {
    fn describe(&self) -> String {
        format!("Edit {}", self.send.id)
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let (track, _) = project
            .find_send(self.send.id)
            .ok_or_else(|| ActionError::not_found("send", self.send.id))?;
        check_send_target(project, track, self.send.target)?;
        let mut update = self.send;
        update.amount = ChannelSend::amount_range().clamp(update.amount);
        let slot = project
            .track_mut(track)
            .and_then(Track::channel_mut)
            .and_then(|channel| channel.send_mut(update.id))
            .ok_or_else(|| ActionError::not_found("send", update.id))?;
        let previous = std::mem::replace(slot, update);
        let rewired = previous.target != update.target || previous.pre_fader != update.pre_fader;
        if rewired {
            if let Err(err) = check_routing(project) {
                if let Some(slot) = project
                    .track_mut(track)
                    .and_then(Track::channel_mut)
                    .and_then(|channel| channel.send_mut(update.id))
                {
                    *slot = previous;
                }
                return Err(err);
            }
        }
        let effects = if rewired {
            Effects::graph() | Effects::params()
        } else {
            Effects::params()
        };
        Ok(ActionOutcome::new(UpdateSend::new(previous), effects))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sets the channel receiving a track's post-fader signal.
pub struct SetDirectOut {
    track: TrackId,
    target: Option<TrackId>,
}

impl SetDirectOut {
    pub fn new(track: TrackId, target: Option<TrackId>) -> Self {
        Self { track, target }
    }
}

impl Action for SetDirectOut {
    fn describe(&self) -> String {
        match self.target {
            Some(target) => format!("Route {} to {target}", self.track),
            None => format!("Unroute {}", self.track),
        }
    }

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let project = &mut *ctx.project;
        let source = project.require_track(self.track)?;
        if source.is_master() {
            return Err(ActionError::invalid("the master track has no direct output"));
        }
        if let Some(target) = self.target {
            let dest = project.require_track(target)?;
            if target == self.track || !dest.kind.accepts_routing() {
                return Err(ActionError::invalid(format!("{target} cannot receive {}", self.track)));
            }
        }
        let channel = project
            .require_track_mut(self.track)?
            .channel_mut()
            .ok_or_else(|| ActionError::invalid(format!("{} has no mixer strip", self.track)))?;
        let previous = std::mem::replace(&mut channel.direct_out, self.target);
        if let Err(err) = check_routing(project) {
            if let Some(channel) = project.track_mut(self.track).and_then(Track::channel_mut) {
                channel.direct_out = previous;
            }
            return Err(err);
        }
        Ok(ActionOutcome::new(SetDirectOut::new(self.track, previous), Effects::graph()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
