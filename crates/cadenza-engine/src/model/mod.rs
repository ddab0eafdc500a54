//! The project document: tracks, their lanes and channels, the audio pool,
//! user port connections and transport settings.

pub mod channel;
pub mod pool;
pub mod region;
pub mod routing;
pub mod track;

use std::collections::{HashMap, HashSet};

use cadenza_graph::{ConnectionSet, PortFlags, PortRange};
use serde::{Deserialize, Serialize};

pub use channel::{
    Channel, ChannelSend, FaderState, PluginLocation, PluginSlot, SendTarget, SlotKind, STRIP_SLOTS,
};
pub use pool::{AudioClip, AudioPool};
pub use region::{ChordKind, ChordObject, Fade, MidiNote, Region, RegionContent, RegionKind};
pub use routing::{FaderControl, ParamAddress};
pub use track::{Lane, Track, TrackKind, MACRO_COUNT};

use crate::error::ActionError;
use crate::graph::GraphPlan;
use crate::ids::{IdAllocator, PluginId, RegionId, SendId, TrackId};
use crate::transport::TransportSettings;

/// Container holding a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionOwner {
    Lane(usize),
    Automation(ParamAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLocation {
    pub track: TrackId,
    pub owner: RegionOwner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub name: String,
    pub sample_rate: u32,
    /// Master is always first.
    pub tracks: Vec<Track>,
    pub transport: TransportSettings,
    #[serde(default)]
    pub pool: AudioPool,
    /// Connections made explicitly between ports, on top of the implicit
    /// channel wiring.
    #[serde(default)]
    pub connections: ConnectionSet,
    pub ids: IdAllocator,
}

impl ProjectState {
    pub fn new(name: impl Into<String>, sample_rate: u32) -> Self {
        let mut ids = IdAllocator::default();
        let master = Track::new(ids.track(), "Master", TrackKind::Master);
        Self {
            name: name.into(),
            sample_rate,
            tracks: vec![master],
            transport: TransportSettings::new(sample_rate),
            pool: AudioPool::new(),
            connections: ConnectionSet::new(),
            ids,
        }
    }

    pub fn master_id(&self) -> Option<TrackId> {
        self.tracks.first().filter(|t| t.is_master()).map(|t| t.id)
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id == id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|track| track.id == id)
    }

    pub fn track_index(&self, id: TrackId) -> Option<usize> {
        self.tracks.iter().position(|track| track.id == id)
    }

    pub fn require_track(&self, id: TrackId) -> Result<&Track, ActionError> {
        self.track(id).ok_or_else(|| ActionError::not_found("track", id))
    }

    pub fn require_track_mut(&mut self, id: TrackId) -> Result<&mut Track, ActionError> {
        self.track_mut(id).ok_or_else(|| ActionError::not_found("track", id))
    }

    pub fn find_plugin(&self, id: PluginId) -> Option<PluginLocation> {
        self.tracks.iter().find_map(|track| {
            let (slot, index, _) = track.channel()?.plugin(id)?;
            Some(PluginLocation {
                track: track.id,
                slot,
                index,
            })
        })
    }

    pub fn plugin(&self, id: PluginId) -> Option<&PluginSlot> {
        self.tracks
            .iter()
            .find_map(|track| track.channel()?.plugin(id).map(|(_, _, slot)| slot))
    }

    pub fn plugin_mut(&mut self, id: PluginId) -> Option<&mut PluginSlot> {
        self.tracks
            .iter_mut()
            .find_map(|track| track.channel_mut()?.plugin_mut(id))
    }

    pub fn plugins(&self) -> impl Iterator<Item = (TrackId, &PluginSlot)> {
        self.tracks.iter().flat_map(|track| {
            track
                .channel()
                .into_iter()
                .flat_map(|channel| channel.plugins().map(|(_, _, slot)| slot))
                .map(move |slot| (track.id, slot))
        })
    }

    pub fn find_send(&self, id: SendId) -> Option<(TrackId, &ChannelSend)> {
        self.tracks
            .iter()
            .find_map(|track| track.channel()?.send(id).map(|send| (track.id, send)))
    }

    pub fn find_region(&self, id: RegionId) -> Option<RegionLocation> {
        self.tracks.iter().find_map(|track| {
            if let Some((lane, _)) = track.find_region(id) {
                return Some(RegionLocation {
                    track: track.id,
                    owner: RegionOwner::Lane(lane),
                });
            }
            track
                .automation
                .iter()
                .find(|lane| lane.regions.iter().any(|r| r.id == id))
                .map(|lane| RegionLocation {
                    track: track.id,
                    owner: RegionOwner::Automation(lane.target),
                })
        })
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        let location = self.find_region(id)?;
        let track = self.track(location.track)?;
        match location.owner {
            RegionOwner::Lane(lane) => track.lanes.get(lane)?.region(id),
            RegionOwner::Automation(target) => track
                .automation
                .iter()
                .find(|lane| lane.target == target)?
                .regions
                .iter()
                .find(|r| r.id == id),
        }
    }

    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        let location = self.find_region(id)?;
        let track = self.track_mut(location.track)?;
        match location.owner {
            RegionOwner::Lane(lane) => track.lanes.get_mut(lane)?.region_mut(id),
            RegionOwner::Automation(target) => track
                .automation
                .iter_mut()
                .find(|lane| lane.target == target)?
                .regions
                .iter_mut()
                .find(|r| r.id == id),
        }
    }

    /// Track whose automation lanes hold automation for `address`.
    pub fn param_owner(&self, address: ParamAddress) -> Option<TrackId> {
        match address {
            ParamAddress::Fader { track, .. } | ParamAddress::Macro { track, .. } => {
                self.track(track).map(|t| t.id)
            }
            ParamAddress::Send { send } => self.find_send(send).map(|(track, _)| track),
            ParamAddress::Plugin { plugin, .. } => self.find_plugin(plugin).map(|loc| loc.track),
        }
    }

    pub fn param_range(&self, address: ParamAddress) -> Option<(PortRange, PortFlags)> {
        match address {
            ParamAddress::Fader { track, control } => {
                self.track(track)?.channel()?;
                Some(control.range())
            }
            ParamAddress::Send { send } => {
                self.find_send(send)?;
                Some((ChannelSend::amount_range(), PortFlags::automatable()))
            }
            ParamAddress::Plugin { plugin, index } => {
                self.plugin(plugin)?.param_range(index as usize)
            }
            ParamAddress::Macro { track, index } => {
                let track = self.track(track)?;
                (usize::from(index) < track.macros.len())
                    .then(|| (PortRange::unit(), PortFlags::automatable()))
            }
        }
    }

    pub fn param_value(&self, address: ParamAddress) -> Option<f32> {
        match address {
            ParamAddress::Fader { track, control } => {
                let track = self.track(track)?;
                let fader = track.channel()?.fader;
                Some(match control {
                    FaderControl::Amp => fader.amp,
                    FaderControl::Balance => fader.balance,
                    FaderControl::Mute => f32::from(u8::from(track.muted)),
                })
            }
            ParamAddress::Send { send } => self.find_send(send).map(|(_, send)| send.amount),
            ParamAddress::Plugin { plugin, index } => {
                self.plugin(plugin)?.params.get(index as usize).copied()
            }
            ParamAddress::Macro { track, index } => {
                self.track(track)?.macros.get(usize::from(index)).copied()
            }
        }
    }

    /// Stores a clamped value and returns the previous one.
    pub fn set_param_value(&mut self, address: ParamAddress, value: f32) -> Result<f32, ActionError> {
        let (range, flags) = self
            .param_range(address)
            .ok_or_else(|| ActionError::not_found("parameter", address))?;
        let value = range.snap(value, flags);
        let missing = || ActionError::not_found("parameter", address);
        let previous = match address {
            ParamAddress::Fader { track, control } => {
                let track = self.track_mut(track).ok_or_else(missing)?;
                match control {
                    FaderControl::Mute => {
                        let previous = f32::from(u8::from(track.muted));
                        track.muted = value >= 0.5;
                        previous
                    }
                    FaderControl::Amp | FaderControl::Balance => {
                        let fader = &mut track.channel_mut().ok_or_else(missing)?.fader;
                        let slot = if control == FaderControl::Amp {
                            &mut fader.amp
                        } else {
                            &mut fader.balance
                        };
                        std::mem::replace(slot, value)
                    }
                }
            }
            ParamAddress::Send { send } => {
                let (track, _) = self.find_send(send).ok_or_else(missing)?;
                let send = self
                    .track_mut(track)
                    .and_then(Track::channel_mut)
                    .and_then(|channel| channel.send_mut(send))
                    .ok_or_else(missing)?;
                std::mem::replace(&mut send.amount, value)
            }
            ParamAddress::Plugin { plugin, index } => {
                let slot = self
                    .plugin_mut(plugin)
                    .and_then(|p| p.params.get_mut(index as usize))
                    .ok_or_else(missing)?;
                std::mem::replace(slot, value)
            }
            ParamAddress::Macro { track, index } => {
                let slot = self
                    .track_mut(track)
                    .and_then(|t| t.macros.get_mut(usize::from(index)))
                    .ok_or_else(missing)?;
                std::mem::replace(slot, value)
            }
        };
        Ok(previous)
    }

    /// Track-level signal edges from direct outputs and sends.
    pub fn track_edges(&self) -> Vec<(TrackId, TrackId)> {
        let mut edges = Vec::new();
        for track in &self.tracks {
            let Some(channel) = track.channel() else { continue };
            if let Some(target) = channel.direct_out {
                edges.push((track.id, target));
            }
            for send in &channel.sends {
                let target = match send.target {
                    SendTarget::Track(target) => Some(target),
                    SendTarget::Sidechain { plugin, .. } => self.find_plugin(plugin).map(|l| l.track),
                };
                if let Some(target) = target {
                    edges.push((track.id, target));
                }
            }
        }
        edges
    }

    /// Tracks silenced because another track is soloed. A track stays
    /// audible when it is soloed itself, feeds a soloed track, or is fed by
    /// one.
    pub fn implied_mutes(&self) -> HashSet<TrackId> {
        let soloed: Vec<TrackId> = self.tracks.iter().filter(|t| t.soloed).map(|t| t.id).collect();
        if soloed.is_empty() {
            return HashSet::new();
        }
        let edges = self.track_edges();
        let mut forward: HashMap<TrackId, Vec<TrackId>> = HashMap::new();
        let mut backward: HashMap<TrackId, Vec<TrackId>> = HashMap::new();
        for (from, to) in &edges {
            forward.entry(*from).or_default().push(*to);
            backward.entry(*to).or_default().push(*from);
        }
        let mut audible: HashSet<TrackId> = HashSet::new();
        for adjacency in [&forward, &backward] {
            let mut stack = soloed.clone();
            let mut seen = HashSet::new();
            while let Some(track) = stack.pop() {
                if !seen.insert(track) {
                    continue;
                }
                audible.insert(track);
                if let Some(next) = adjacency.get(&track) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        self.tracks
            .iter()
            .filter(|t| !t.is_master() && !audible.contains(&t.id))
            .map(|t| t.id)
            .collect()
    }

    /// Moves the id counters past every id in the document.
    pub fn observe_ids(&mut self) {
        let mut ids = self.ids.clone();
        for track in &self.tracks {
            ids.observe_track(track.id);
            for region in track.regions().chain(track.automation_regions()) {
                ids.observe_region(region.id);
                if let Some(notes) = region.notes() {
                    for note in notes {
                        ids.observe_note(note.id);
                    }
                }
            }
            if let Some(channel) = track.channel() {
                for (_, _, plugin) in channel.plugins() {
                    ids.observe_plugin(plugin.id);
                }
                for send in &channel.sends {
                    ids.observe_send(send.id);
                }
            }
        }
        for clip in self.pool.iter() {
            ids.observe_clip(clip.id);
        }
        self.ids = ids;
    }

    pub fn ensure_invariants(&self) -> Result<(), ActionError> {
        self.validate_tracks()?;
        self.validate_channels()?;
        self.validate_regions()?;
        self.validate_automation()?;
        GraphPlan::build(self).map_err(|err| ActionError::invariant(format!("routing: {err}")))?;
        Ok(())
    }

    fn validate_tracks(&self) -> Result<(), ActionError> {
        let masters = self.tracks.iter().filter(|t| t.is_master()).count();
        if masters != 1 || self.master_id().is_none() {
            return Err(ActionError::invariant("exactly one master track must come first"));
        }
        let mut seen = HashSet::new();
        for track in &self.tracks {
            if !seen.insert(track.id) {
                return Err(ActionError::invariant(format!("duplicate {}", track.id)));
            }
            if track.kind.has_channel() != track.channel.is_some() {
                return Err(ActionError::invariant(format!("{} has the wrong strip", track.id)));
            }
            if track.kind.region_kind().is_none() && track.regions().next().is_some() {
                return Err(ActionError::invariant(format!("{} cannot hold regions", track.id)));
            }
        }
        Ok(())
    }

    fn validate_channels(&self) -> Result<(), ActionError> {
        let mut plugins = HashSet::new();
        let mut sends = HashSet::new();
        for track in &self.tracks {
            let Some(channel) = track.channel() else { continue };
            if channel.midi_fx.len() > STRIP_SLOTS || channel.inserts.len() > STRIP_SLOTS {
                return Err(ActionError::invariant(format!("{} has too many plugins", track.id)));
            }
            for (slot, _, plugin) in channel.plugins() {
                if !plugins.insert(plugin.id) {
                    return Err(ActionError::invariant(format!("duplicate {}", plugin.id)));
                }
                if !slot.accepts(plugin.descriptor.category) {
                    return Err(ActionError::invariant(format!("{} is in the wrong slot", plugin.id)));
                }
                if plugin.params.len() != plugin.descriptor.params.len() {
                    return Err(ActionError::invariant(format!("{} parameter count", plugin.id)));
                }
            }
            if let Some(target) = channel.direct_out {
                if track.is_master() {
                    return Err(ActionError::invariant("master has no direct output"));
                }
                self.check_route_target(track.id, target)?;
            }
            for send in &channel.sends {
                if !sends.insert(send.id) {
                    return Err(ActionError::invariant(format!("duplicate {}", send.id)));
                }
                match send.target {
                    SendTarget::Track(target) => self.check_route_target(track.id, target)?,
                    SendTarget::Sidechain { plugin, first_input } => {
                        let slot = self
                            .plugin(plugin)
                            .ok_or_else(|| ActionError::invariant(format!("{} targets missing {plugin}", send.id)))?;
                        if first_input.saturating_add(2) > slot.descriptor.audio_inputs {
                            return Err(ActionError::invariant(format!(
                                "{} targets inputs {first_input}.. of {plugin}",
                                send.id
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_route_target(&self, from: TrackId, target: TrackId) -> Result<(), ActionError> {
        if from == target {
            return Err(ActionError::invariant(format!("{from} routes into itself")));
        }
        let track = self
            .track(target)
            .ok_or_else(|| ActionError::invariant(format!("{from} routes into missing {target}")))?;
        if !track.kind.accepts_routing() {
            return Err(ActionError::invariant(format!("{target} does not accept routing")));
        }
        Ok(())
    }

    fn validate_regions(&self) -> Result<(), ActionError> {
        let mut regions = HashSet::new();
        for track in &self.tracks {
            for lane in &track.lanes {
                if !lane.is_non_overlapping() {
                    return Err(ActionError::invariant(format!(
                        "overlapping regions in {} lane \"{}\"",
                        track.id, lane.name
                    )));
                }
                for region in &lane.regions {
                    if Some(region.kind()) != track.kind.region_kind() {
                        return Err(ActionError::invariant(format!("{} does not fit {}", region.id, track.id)));
                    }
                    if let RegionContent::Audio { clip, .. } = region.content {
                        if !self.pool.contains(clip) {
                            return Err(ActionError::invariant(format!("{} references missing {clip}", region.id)));
                        }
                    }
                    check_region(region, &mut regions)?;
                }
            }
            for region in track.automation_regions() {
                check_region(region, &mut regions)?;
            }
        }
        Ok(())
    }

    fn validate_automation(&self) -> Result<(), ActionError> {
        for track in &self.tracks {
            let mut targets = HashSet::new();
            for lane in &track.automation {
                if !targets.insert(lane.target) {
                    return Err(ActionError::invariant(format!("duplicate lane for {}", lane.target)));
                }
                if self.param_owner(lane.target) != Some(track.id) {
                    return Err(ActionError::invariant(format!("{} is not owned by {}", lane.target, track.id)));
                }
                if !lane.is_non_overlapping() {
                    return Err(ActionError::invariant(format!("overlapping automation for {}", lane.target)));
                }
                for region in &lane.regions {
                    match region.curve() {
                        Some(curve) if curve.is_strictly_ordered() => {}
                        Some(_) => {
                            return Err(ActionError::invariant(format!("{} points are not ordered", region.id)))
                        }
                        None => {
                            return Err(ActionError::invariant(format!("{} is not automation", region.id)))
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_region(region: &Region, seen: &mut HashSet<RegionId>) -> Result<(), ActionError> {
    if !seen.insert(region.id) {
        return Err(ActionError::invariant(format!("duplicate {}", region.id)));
    }
    if region.length == 0 {
        return Err(ActionError::invariant(format!("{} is empty", region.id)));
    }
    Ok(())
}
