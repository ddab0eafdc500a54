//! Live objects shared between the control domain and the graph.
//!
//! Everything here survives graph rebuilds: control cells keep their values,
//! region snapshots are republished without touching the topology, and
//! plugin instances keep their adapters. The project document stays the
//! source of truth; [`Runtime::sync`] pushes it into these objects after
//! every action.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadenza_graph::{ControlCell, PortFlags, PortRange};
use cadenza_plugin_host::{PluginError, PluginHost, PluginInstance, PluginState};
use cadenza_rt::{MeterCell, MeterReading, SnapshotCell};

use crate::actions::{PluginStates, SavedPlugin};
use crate::automation::{AutomationMode, AutomationTrack};
use crate::ids::{ClipId, PluginId, SendId, TrackId};
use crate::model::{
    AudioClip, AudioPool, ChannelSend, FaderControl, ParamAddress, ProjectState, Region, Track,
    TrackKind,
};

/// Regions a track processor renders, with the clips they reference.
#[derive(Debug, Clone, Default)]
pub struct TrackContent {
    /// Regions of unmuted lanes, sorted by position.
    pub regions: Vec<Region>,
    pub clips: Vec<AudioClip>,
}

impl TrackContent {
    pub fn from_track(track: &Track, pool: &AudioPool) -> Self {
        let mut regions: Vec<Region> = track
            .lanes
            .iter()
            .filter(|lane| !lane.muted)
            .flat_map(|lane| lane.regions.iter())
            .filter(|region| !region.muted)
            .cloned()
            .collect();
        regions.sort_by_key(|region| region.position);
        let mut clips: Vec<AudioClip> = Vec::new();
        for region in &regions {
            if let crate::model::RegionContent::Audio { clip, .. } = region.content {
                if clips.iter().all(|c| c.id != clip) {
                    if let Some(found) = pool.get(clip) {
                        clips.push(found.clone());
                    }
                }
            }
        }
        Self { regions, clips }
    }

    pub fn clip(&self, id: ClipId) -> Option<&AudioClip> {
        self.clips.iter().find(|clip| clip.id == id)
    }

    /// Cheap comparison: clips match by identity of their sample storage.
    fn same_as(&self, other: &TrackContent) -> bool {
        self.regions == other.regions
            && self.clips.len() == other.clips.len()
            && self
                .clips
                .iter()
                .zip(&other.clips)
                .all(|(a, b)| a.id == b.id && Arc::ptr_eq(&a.channels, &b.channels))
    }
}

/// Live state of one track.
pub struct TrackRuntime {
    pub id: TrackId,
    pub kind: TrackKind,
    content: SnapshotCell<TrackContent>,
    pub amp: ControlCell,
    pub balance: ControlCell,
    pub mute: ControlCell,
    pub macros: Vec<ControlCell>,
    enabled: AtomicBool,
    armed: AtomicBool,
    implied_mute: AtomicBool,
    meters: [MeterCell; 2],
}

fn fader_cell(control: FaderControl) -> ControlCell {
    let (range, flags) = control.range();
    ControlCell::new(range, flags)
}

impl TrackRuntime {
    pub fn new(track: &Track, pool: &AudioPool) -> Self {
        let runtime = Self {
            id: track.id,
            kind: track.kind,
            content: SnapshotCell::new(TrackContent::from_track(track, pool)),
            amp: fader_cell(FaderControl::Amp),
            balance: fader_cell(FaderControl::Balance),
            mute: fader_cell(FaderControl::Mute),
            macros: track
                .macros
                .iter()
                .map(|_| ControlCell::new(PortRange::unit(), PortFlags::automatable()))
                .collect(),
            enabled: AtomicBool::new(track.enabled),
            armed: AtomicBool::new(track.armed),
            implied_mute: AtomicBool::new(false),
            meters: [MeterCell::new(), MeterCell::new()],
        };
        runtime.sync_values(track, false);
        runtime
    }

    fn sync_values(&self, track: &Track, implied_mute: bool) {
        if let Some(channel) = track.channel() {
            self.amp.set(channel.fader.amp);
            self.balance.set(channel.fader.balance);
        }
        self.mute.set(if track.muted { 1.0 } else { 0.0 });
        for (cell, value) in self.macros.iter().zip(&track.macros) {
            cell.set(*value);
        }
        self.enabled.store(track.enabled, Ordering::Release);
        self.armed.store(track.armed, Ordering::Release);
        self.implied_mute.store(implied_mute, Ordering::Release);
    }

    /// Pushes the document values into the live cells and republishes the
    /// region snapshot when it changed. Returns the replaced snapshot.
    pub fn sync(&self, track: &Track, pool: &AudioPool, implied_mute: bool) -> Option<Arc<TrackContent>> {
        self.sync_values(track, implied_mute);
        let next = TrackContent::from_track(track, pool);
        if self.content.load().same_as(&next) {
            return None;
        }
        Some(self.content.publish(Arc::new(next)))
    }

    pub fn content(&self) -> arc_swap::Guard<Arc<TrackContent>> {
        self.content.load()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Silenced by another track's solo.
    pub fn is_implied_muted(&self) -> bool {
        self.implied_mute.load(Ordering::Acquire)
    }

    pub fn meter(&self, channel: usize) -> Option<&MeterCell> {
        self.meters.get(channel)
    }

    pub fn meter_readings(&self) -> [MeterReading; 2] {
        [self.meters[0].read(), self.meters[1].read()]
    }
}

/// Live state of one send.
pub struct SendRuntime {
    pub id: SendId,
    pub amount: ControlCell,
    enabled: AtomicBool,
}

impl SendRuntime {
    pub fn new(send: &ChannelSend) -> Self {
        let runtime = Self {
            id: send.id,
            amount: ControlCell::new(ChannelSend::amount_range(), PortFlags::automatable()),
            enabled: AtomicBool::new(send.enabled),
        };
        runtime.sync(send);
        runtime
    }

    fn sync(&self, send: &ChannelSend) {
        self.amount.set(send.amount);
        self.enabled.store(send.enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Lookup from parameter addresses to the cells that back them.
#[derive(Debug, Clone, Default)]
pub struct ParamTable {
    cells: BTreeMap<ParamAddress, ControlCell>,
}

impl ParamTable {
    pub fn get(&self, address: &ParamAddress) -> Option<&ControlCell> {
        self.cells.get(address)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamAddress, &ControlCell)> {
        self.cells.iter()
    }
}

/// One automated parameter as the audio thread sees it.
#[derive(Debug, Clone)]
pub struct AutomationLane {
    pub target: ParamAddress,
    pub cell: ControlCell,
    pub track: AutomationTrack,
    /// Set while the recorder owns the parameter; playback then leaves the
    /// cell alone.
    pub writing: Arc<AtomicBool>,
}

impl AutomationLane {
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AutomationSnapshot {
    pub lanes: Vec<AutomationLane>,
}

/// What happened to plugin instances during a sync.
#[derive(Debug, Default)]
pub struct PluginSyncReport {
    pub created: Vec<PluginId>,
    pub released: Vec<PluginId>,
    pub failed: Vec<(PluginId, PluginError)>,
}

/// Every live object of the open project.
#[derive(Default)]
pub struct Runtime {
    tracks: HashMap<TrackId, Arc<TrackRuntime>>,
    sends: HashMap<SendId, Arc<SendRuntime>>,
    plugins: HashMap<PluginId, Arc<PluginInstance>>,
    writing: HashMap<ParamAddress, Arc<AtomicBool>>,
    retired: Vec<Arc<TrackContent>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, id: TrackId) -> Option<&Arc<TrackRuntime>> {
        self.tracks.get(&id)
    }

    pub fn send(&self, id: SendId) -> Option<&Arc<SendRuntime>> {
        self.sends.get(&id)
    }

    pub fn plugin(&self, id: PluginId) -> Option<&Arc<PluginInstance>> {
        self.plugins.get(&id)
    }

    pub fn plugins(&self) -> impl Iterator<Item = (&PluginId, &Arc<PluginInstance>)> {
        self.plugins.iter()
    }

    /// Flag telling playback to leave `address` to the automation recorder.
    pub fn writing_flag(&mut self, address: ParamAddress) -> Arc<AtomicBool> {
        Arc::clone(
            self.writing
                .entry(address)
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Creates, updates and drops track and send runtimes to match `project`.
    pub fn sync_tracks(&mut self, project: &ProjectState) {
        let implied = project.implied_mutes();
        self.tracks.retain(|id, _| project.track(*id).is_some());
        for track in &project.tracks {
            let implied_mute = implied.contains(&track.id);
            match self.tracks.get(&track.id) {
                Some(runtime) if runtime.kind == track.kind => {
                    if let Some(old) = runtime.sync(track, &project.pool, implied_mute) {
                        self.retired.push(old);
                    }
                }
                _ => {
                    let runtime = TrackRuntime::new(track, &project.pool);
                    runtime.sync_values(track, implied_mute);
                    self.tracks.insert(track.id, Arc::new(runtime));
                }
            }
        }

        let sends: Vec<&ChannelSend> = project
            .tracks
            .iter()
            .filter_map(Track::channel)
            .flat_map(|channel| channel.sends.iter())
            .collect();
        self.sends
            .retain(|id, _| sends.iter().any(|send| send.id == *id));
        for send in sends {
            match self.sends.get(&send.id) {
                Some(runtime) => runtime.sync(send),
                None => {
                    self.sends.insert(send.id, Arc::new(SendRuntime::new(send)));
                }
            }
        }
    }

    /// Matches plugin instances to the plugin slots of `project`. New slots
    /// get an instance restored from their saved state; removed slots are
    /// released. With `instantiate` set, every instance still in
    /// [`PluginState::Created`] is loaded and activated.
    pub fn sync_plugins(
        &mut self,
        project: &ProjectState,
        host: &PluginHost,
        sample_rate: u32,
        max_block: usize,
        instantiate: bool,
    ) -> PluginSyncReport {
        let mut report = PluginSyncReport::default();
        let slots: HashMap<PluginId, _> = project.plugins().map(|(_, slot)| (slot.id, slot)).collect();

        let removed: Vec<PluginId> = self
            .plugins
            .keys()
            .filter(|id| !slots.contains_key(id))
            .copied()
            .collect();
        for id in removed {
            if let Some(instance) = self.plugins.remove(&id) {
                instance.release();
                report.released.push(id);
            }
        }

        for (id, slot) in &slots {
            let instance = match self.plugins.get(id) {
                Some(instance) => Arc::clone(instance),
                None => match PluginInstance::new(slot.descriptor.clone()) {
                    Ok(instance) => {
                        if let Some(blob) = &slot.state {
                            if let Err(err) = instance.restore_state(blob) {
                                tracing::warn!(plugin = %id, %err, "saved plugin state rejected");
                            }
                        }
                        self.plugins.insert(*id, Arc::clone(&instance));
                        report.created.push(*id);
                        instance
                    }
                    Err(err) => {
                        tracing::warn!(plugin = %id, %err, "plugin descriptor rejected");
                        report.failed.push((*id, err));
                        continue;
                    }
                },
            };
            instance.set_enabled(slot.enabled);
            for (index, value) in slot.params.iter().enumerate() {
                instance.set_param(index, *value);
            }
            if instantiate && instance.state() == PluginState::Created {
                if let Err(err) = instance.instantiate(host, sample_rate, max_block) {
                    report.failed.push((*id, err));
                }
            }
        }
        report
    }

    pub fn sync(
        &mut self,
        project: &ProjectState,
        host: &PluginHost,
        sample_rate: u32,
        max_block: usize,
        instantiate: bool,
    ) -> PluginSyncReport {
        self.sync_tracks(project);
        self.sync_plugins(project, host, sample_rate, max_block, instantiate)
    }

    pub fn param_table(&self, project: &ProjectState) -> ParamTable {
        let mut cells = BTreeMap::new();
        for track in &project.tracks {
            let Some(runtime) = self.tracks.get(&track.id) else { continue };
            if let Some(channel) = track.channel() {
                cells.insert(ParamAddress::amp(track.id), runtime.amp.clone());
                cells.insert(ParamAddress::balance(track.id), runtime.balance.clone());
                cells.insert(ParamAddress::mute(track.id), runtime.mute.clone());
                for send in &channel.sends {
                    if let Some(send_rt) = self.sends.get(&send.id) {
                        cells.insert(ParamAddress::Send { send: send.id }, send_rt.amount.clone());
                    }
                }
                for (_, _, slot) in channel.plugins() {
                    let Some(instance) = self.plugins.get(&slot.id) else { continue };
                    for (index, cell) in instance.param_cells().iter().enumerate() {
                        cells.insert(ParamAddress::plugin(slot.id, index as u32), cell.clone());
                    }
                }
            }
            for (index, cell) in runtime.macros.iter().enumerate() {
                cells.insert(
                    ParamAddress::Macro {
                        track: track.id,
                        index: index as u8,
                    },
                    cell.clone(),
                );
            }
        }
        ParamTable { cells }
    }

    pub fn automation(&mut self, project: &ProjectState, table: &ParamTable) -> AutomationSnapshot {
        let mut lanes = Vec::new();
        for track in &project.tracks {
            for lane in &track.automation {
                let Some(cell) = table.get(&lane.target) else { continue };
                if lane.regions.is_empty() && lane.mode == AutomationMode::Read {
                    continue;
                }
                lanes.push(AutomationLane {
                    target: lane.target,
                    cell: cell.clone(),
                    track: lane.clone(),
                    writing: self.writing_flag(lane.target),
                });
            }
        }
        AutomationSnapshot { lanes }
    }

    /// Drops retired snapshots no reader holds any more.
    pub fn reclaim(&mut self) -> usize {
        let before = self.retired.len();
        self.retired.retain(|snapshot| Arc::strong_count(snapshot) > 1);
        before - self.retired.len()
    }

    /// Releases every plugin instance.
    pub fn shutdown(&mut self) {
        for (_, instance) in self.plugins.drain() {
            instance.release();
        }
        self.tracks.clear();
        self.sends.clear();
        self.retired.clear();
    }
}

impl PluginStates for Runtime {
    fn saved_state(&self, plugin: PluginId) -> SavedPlugin {
        match self.plugins.get(&plugin) {
            None => SavedPlugin::Missing,
            Some(instance) => match instance.save_state() {
                Ok(blob) => SavedPlugin::Saved(blob),
                Err(_) => SavedPlugin::Unsavable,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PluginSlot, SlotKind};
    use cadenza_plugin_host::builtin;

    fn project() -> (ProjectState, TrackId) {
        let mut project = ProjectState::new("runtime", 48_000);
        let track = Track::new(project.ids.track(), "Audio", TrackKind::Audio);
        let id = track.id;
        project.tracks.push(track);
        (project, id)
    }

    #[test]
    fn cells_follow_the_document() {
        let (mut project, id) = project();
        let mut runtime = Runtime::new();
        runtime.sync_tracks(&project);
        assert_eq!(runtime.track(id).unwrap().amp.get(), 1.0);

        project.set_param_value(ParamAddress::amp(id), 0.5).unwrap();
        project.track_mut(id).unwrap().armed = true;
        runtime.sync_tracks(&project);
        let track = runtime.track(id).unwrap();
        assert_eq!(track.amp.get(), 0.5);
        assert!(track.is_armed());

        let table = runtime.param_table(&project);
        assert!(table
            .get(&ParamAddress::amp(id))
            .unwrap()
            .shares_storage_with(&track.amp));
    }

    #[test]
    fn region_edits_republish_content() {
        let (mut project, id) = project();
        let mut runtime = Runtime::new();
        runtime.sync_tracks(&project);

        let clip = project.ids.clip();
        project
            .pool
            .insert(AudioClip::new(clip, "clip", 48_000, vec![vec![0.5; 64]]));
        let region = Region::audio(project.ids.region(), 0, 64, clip);
        project.track_mut(id).unwrap().lanes[0].insert(region).unwrap();
        runtime.sync_tracks(&project);
        let content = runtime.track(id).unwrap().content();
        assert_eq!(content.regions.len(), 1);
        assert!(content.clip(clip).is_some());
        drop(content);
        assert_eq!(runtime.reclaim(), 1);
    }

    #[test]
    fn removed_plugins_are_released() {
        let (mut project, id) = project();
        let plugin = project.ids.plugin();
        project
            .track_mut(id)
            .unwrap()
            .channel_mut()
            .unwrap()
            .insert_plugin(SlotKind::Insert, 0, PluginSlot::new(plugin, builtin::gain_descriptor()));
        let host = PluginHost::with_builtins();
        let mut runtime = Runtime::new();
        let report = runtime.sync(&project, &host, 48_000, 256, true);
        assert_eq!(report.created, vec![plugin]);
        assert!(runtime.plugin(plugin).unwrap().is_active());

        project
            .track_mut(id)
            .unwrap()
            .channel_mut()
            .unwrap()
            .remove_plugin(SlotKind::Insert, 0);
        let report = runtime.sync(&project, &host, 48_000, 256, true);
        assert_eq!(report.released, vec![plugin]);
        assert!(runtime.plugin(plugin).is_none());
    }
}
