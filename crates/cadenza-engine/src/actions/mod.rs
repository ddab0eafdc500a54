//! Undoable edits of the project document.
//!
//! Every mutation is an [`Action`]. Performing an action returns its inverse,
//! and performing the inverse returns the action again, so the
//! [`UndoStack`] never needs to snapshot the project. Actions report which
//! parts of the live runtime they invalidated through [`Effects`].

pub mod arranger;
pub mod composite;
pub mod mixer;
pub mod port;
pub mod stack;
pub mod tracklist;
pub mod transport;

use std::any::Any;
use std::ops::BitOr;

use cadenza_graph::{GraphError, PortConnection};

use crate::error::{ActionError, PortError};
use crate::graph::{GraphPlan, NodeRef};
use crate::automation::AutomationTrack;
use crate::ids::{ObjectId, PluginId, TrackId};
use crate::model::{ChannelSend, ParamAddress, ProjectState, SendTarget, Track};

pub use arranger::{
    AddAutomationPoint, AddNote, AddRegion, DeleteAutomationPoint, DeleteNote, DeleteRegion,
    MoveAutomationPoint, MoveNote, MoveRegion, NoteSpec, ReplaceAutomationLane, ReplaceRegion,
    ResizeRegion, SetAutomationMode, SetRegionFades, SetRegionMuted, SplitRegion,
};
pub use composite::CompositeAction;
pub use mixer::{
    AddPlugin, AddSend, MovePlugin, RemovePlugin, RemoveSend, SetDirectOut, SetPluginEnabled, UpdateSend,
};
pub use port::{Connect, Disconnect, SetConnectionEnabled, SetConnectionMultiplier, SetControlValue};
pub use stack::{Applied, UndoStack};
pub use tracklist::{CreateTrack, DeleteTrack, MoveTrack, SetTrackProperty, TrackProperty};
pub use transport::{EditTransport, TransportEdit};

/// How an action interacts with the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reversibility {
    FullyReversible,
    /// The action destroys state it cannot restore. It must be confirmed
    /// and it empties the undo history.
    HistoryClearing,
}

/// Parts of the live runtime an action invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    /// Nodes or connections changed; the graph must be rebuilt.
    pub graph: bool,
    /// Regions or clips changed.
    pub content: bool,
    pub params: bool,
    pub transport: bool,
    pub automation: bool,
}

impl Effects {
    pub const NONE: Effects = Effects {
        graph: false,
        content: false,
        params: false,
        transport: false,
        automation: false,
    };

    pub fn graph() -> Self {
        Self {
            graph: true,
            ..Self::NONE
        }
    }

    pub fn content() -> Self {
        Self {
            content: true,
            ..Self::NONE
        }
    }

    pub fn params() -> Self {
        Self {
            params: true,
            ..Self::NONE
        }
    }

    pub fn transport() -> Self {
        Self {
            transport: true,
            ..Self::NONE
        }
    }

    pub fn automation() -> Self {
        Self {
            automation: true,
            ..Self::NONE
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

impl BitOr for Effects {
    type Output = Effects;

    fn bitor(self, rhs: Effects) -> Effects {
        Effects {
            graph: self.graph || rhs.graph,
            content: self.content || rhs.content,
            params: self.params || rhs.params,
            transport: self.transport || rhs.transport,
            automation: self.automation || rhs.automation,
        }
    }
}

/// State of a live plugin instance as seen by an action deciding whether it
/// can be removed reversibly.
#[derive(Debug, Clone, PartialEq)]
pub enum SavedPlugin {
    Saved(Vec<u8>),
    Unsavable,
    /// No instance exists.
    Missing,
}

/// Access to live plugin state from actions.
pub trait PluginStates {
    fn saved_state(&self, plugin: PluginId) -> SavedPlugin;
}

/// Plugin lookup for projects without live instances.
pub struct NoPlugins;

impl PluginStates for NoPlugins {
    fn saved_state(&self, _plugin: PluginId) -> SavedPlugin {
        SavedPlugin::Missing
    }
}

pub struct ActionContext<'a> {
    pub project: &'a mut ProjectState,
    pub plugins: &'a dyn PluginStates,
}

impl<'a> ActionContext<'a> {
    pub fn new(project: &'a mut ProjectState, plugins: &'a dyn PluginStates) -> Self {
        Self { project, plugins }
    }
}

pub struct ActionOutcome {
    pub inverse: Box<dyn Action>,
    pub effects: Effects,
    /// Objects the action brought into the project.
    pub created: Vec<ObjectId>,
}

impl ActionOutcome {
    pub fn new(inverse: impl Action, effects: Effects) -> Self {
        Self {
            inverse: Box::new(inverse),
            effects,
            created: Vec::new(),
        }
    }

    pub fn with_created(mut self, id: ObjectId) -> Self {
        self.created.push(id);
        self
    }
}

pub trait Action: Send + Sync + 'static {
    fn describe(&self) -> String;

    fn perform(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutcome, ActionError>;

    fn reversibility(&self, _project: &ProjectState, _plugins: &dyn PluginStates) -> Reversibility {
        Reversibility::FullyReversible
    }

    /// Whether this action continues `previous` and should share its
    /// history entry.
    fn should_merge(&self, _previous: &dyn Action) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// Whether removing `slot` could be undone, recording its state in `state`
/// when the instance can save it.
pub(crate) fn capture_plugin_state(
    plugins: &dyn PluginStates,
    slot: &mut crate::model::PluginSlot,
) -> Reversibility {
    match plugins.saved_state(slot.id) {
        SavedPlugin::Saved(blob) => {
            slot.state = Some(blob);
            Reversibility::FullyReversible
        }
        SavedPlugin::Unsavable => Reversibility::HistoryClearing,
        SavedPlugin::Missing if slot.state.is_some() => Reversibility::FullyReversible,
        SavedPlugin::Missing => Reversibility::HistoryClearing,
    }
}

/// Reversibility of removing the given plugin slots.
pub(crate) fn removal_reversibility<'a>(
    plugins: &dyn PluginStates,
    slots: impl IntoIterator<Item = &'a crate::model::PluginSlot>,
) -> Reversibility {
    let clearing = slots.into_iter().any(|slot| {
        let mut probe = slot.clone();
        capture_plugin_state(plugins, &mut probe) == Reversibility::HistoryClearing
    });
    if clearing {
        Reversibility::HistoryClearing
    } else {
        Reversibility::FullyReversible
    }
}

/// User connections removed together with a set of nodes, one batch per
/// node in removal order.
pub(crate) type Detached = Vec<Vec<(usize, PortConnection)>>;

pub(crate) fn detach_nodes(project: &mut ProjectState, nodes: impl IntoIterator<Item = NodeRef>) -> Detached {
    nodes
        .into_iter()
        .map(|node| project.connections.remove_node(node.key()))
        .filter(|removed| !removed.is_empty())
        .collect()
}

pub(crate) fn reattach_nodes(project: &mut ProjectState, detached: &Detached) {
    for removed in detached.iter().rev() {
        project.connections.restore(removed);
    }
}

/// Sends removed because their target went away.
pub(crate) type DetachedSends = Vec<(TrackId, usize, ChannelSend)>;

pub(crate) fn detach_sends(
    project: &mut ProjectState,
    mut targets: impl FnMut(SendTarget) -> bool,
) -> DetachedSends {
    let mut detached = Vec::new();
    for track in &mut project.tracks {
        let owner = track.id;
        let Some(channel) = track.channel_mut() else { continue };
        let mut original = 0;
        let mut position = 0;
        while position < channel.sends.len() {
            if targets(channel.sends[position].target) {
                detached.push((owner, original, channel.sends.remove(position)));
            } else {
                position += 1;
            }
            original += 1;
        }
    }
    detached
}

pub(crate) fn reattach_sends(project: &mut ProjectState, detached: &DetachedSends) {
    for (owner, position, send) in detached {
        if let Some(channel) = project.track_mut(*owner).and_then(Track::channel_mut) {
            let position = (*position).min(channel.sends.len());
            channel.sends.insert(position, *send);
        }
    }
}

/// Automation lanes removed with the parameters they targeted.
pub(crate) type DetachedLanes = Vec<(TrackId, usize, AutomationTrack)>;

pub(crate) fn detach_lanes(
    project: &mut ProjectState,
    mut targets: impl FnMut(ParamAddress) -> bool,
) -> DetachedLanes {
    let mut detached = Vec::new();
    for track in &mut project.tracks {
        let mut original = 0;
        let mut position = 0;
        while position < track.automation.len() {
            if targets(track.automation[position].target) {
                detached.push((track.id, original, track.automation.remove(position)));
            } else {
                position += 1;
            }
            original += 1;
        }
    }
    detached
}

pub(crate) fn reattach_lanes(project: &mut ProjectState, detached: &DetachedLanes) {
    for (owner, position, lane) in detached {
        if let Some(track) = project.track_mut(*owner) {
            let position = (*position).min(track.automation.len());
            track.automation.insert(position, lane.clone());
        }
    }
}

/// Graph nodes owned by a track.
pub(crate) fn track_nodes(track: &Track) -> Vec<NodeRef> {
    let mut nodes: Vec<NodeRef> = (0..track.macros.len())
        .map(|index| NodeRef::Macro(track.id, index as u8))
        .collect();
    if let Some(channel) = track.channel() {
        nodes.push(NodeRef::TrackProcessor(track.id));
        nodes.extend(channel.plugins().map(|(_, _, slot)| NodeRef::Plugin(slot.id)));
        nodes.extend(channel.sends.iter().map(|send| NodeRef::Send(send.id)));
        nodes.push(NodeRef::Fader(track.id));
    }
    nodes
}

/// Rebuilds the plan after a routing edit, reporting cycles as
/// [`ActionError::WouldCycle`].
pub(crate) fn check_routing(project: &ProjectState) -> Result<(), ActionError> {
    match GraphPlan::build(project) {
        Ok(_) => Ok(()),
        Err(GraphError::Cycle(_) | GraphError::WouldCycle { .. }) => Err(ActionError::WouldCycle),
        Err(err) => Err(ActionError::Port(PortError::Graph(err))),
    }
}
