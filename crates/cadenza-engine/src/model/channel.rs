use cadenza_graph::{PortFlags, PortRange};
use cadenza_plugin_host::{PluginCategory, PluginDescriptor};
use serde::{Deserialize, Serialize};

use crate::ids::{PluginId, SendId, TrackId};

/// Maximum number of plugins in the MIDI-FX list and in the insert list.
pub const STRIP_SLOTS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    MidiFx,
    Instrument,
    Insert,
}

impl SlotKind {
    /// Whether a plugin of `category` may be placed in this slot list.
    pub fn accepts(self, category: PluginCategory) -> bool {
        match self {
            SlotKind::MidiFx => category == PluginCategory::MidiEffect,
            SlotKind::Instrument => category == PluginCategory::Instrument,
            SlotKind::Insert => matches!(category, PluginCategory::Effect | PluginCategory::Modulator),
        }
    }

    pub fn capacity(self) -> usize {
        match self {
            SlotKind::Instrument => 1,
            SlotKind::MidiFx | SlotKind::Insert => STRIP_SLOTS,
        }
    }
}

/// Where a plugin sits inside a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginLocation {
    pub track: TrackId,
    pub slot: SlotKind,
    pub index: usize,
}

/// A plugin as stored in the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSlot {
    pub id: PluginId,
    pub descriptor: PluginDescriptor,
    pub enabled: bool,
    /// Last saved state blob.
    #[serde(default)]
    pub state: Option<Vec<u8>>,
    /// Parameter values in descriptor order.
    pub params: Vec<f32>,
}

impl PluginSlot {
    pub fn new(id: PluginId, descriptor: PluginDescriptor) -> Self {
        let params = descriptor.params.iter().map(|param| param.range.default).collect();
        Self {
            id,
            descriptor,
            enabled: true,
            state: None,
            params,
        }
    }

    pub fn param_range(&self, index: usize) -> Option<(PortRange, PortFlags)> {
        self.descriptor
            .params
            .get(index)
            .map(|param| (param.range, param.flags))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaderState {
    /// Linear gain, `0..=2`.
    pub amp: f32,
    /// `-1` is hard left.
    pub balance: f32,
}

impl FaderState {
    pub fn amp_range() -> PortRange {
        PortRange::new(0.0, 2.0, 1.0)
    }

    pub fn balance_range() -> PortRange {
        PortRange::bipolar()
    }
}

impl Default for FaderState {
    fn default() -> Self {
        Self {
            amp: 1.0,
            balance: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendTarget {
    /// Input of another channel.
    Track(TrackId),
    /// A stereo pair of plugin audio inputs starting at `first_input`.
    Sidechain { plugin: PluginId, first_input: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSend {
    pub id: SendId,
    pub target: SendTarget,
    /// Linear gain, `0..=2`.
    pub amount: f32,
    pub pre_fader: bool,
    pub enabled: bool,
}

impl ChannelSend {
    pub fn new(id: SendId, target: SendTarget) -> Self {
        Self {
            id,
            target,
            amount: 1.0,
            pre_fader: false,
            enabled: true,
        }
    }

    pub fn amount_range() -> PortRange {
        PortRange::new(0.0, 2.0, 1.0)
    }
}

/// Mixer strip of a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub midi_fx: Vec<PluginSlot>,
    pub instrument: Option<PluginSlot>,
    pub inserts: Vec<PluginSlot>,
    pub fader: FaderState,
    pub sends: Vec<ChannelSend>,
    /// Channel receiving the post-fader output. `None` leaves the channel
    /// unrouted unless a user connection takes its output.
    pub direct_out: Option<TrackId>,
}

impl Channel {
    pub fn slots(&self, slot: SlotKind) -> &[PluginSlot] {
        match slot {
            SlotKind::MidiFx => &self.midi_fx,
            SlotKind::Instrument => self.instrument.as_slice(),
            SlotKind::Insert => &self.inserts,
        }
    }

    /// Every plugin in signal order with its slot position.
    pub fn plugins(&self) -> impl Iterator<Item = (SlotKind, usize, &PluginSlot)> {
        let midi_fx = self
            .midi_fx
            .iter()
            .enumerate()
            .map(|(i, p)| (SlotKind::MidiFx, i, p));
        let instrument = self.instrument.iter().map(|p| (SlotKind::Instrument, 0, p));
        let inserts = self
            .inserts
            .iter()
            .enumerate()
            .map(|(i, p)| (SlotKind::Insert, i, p));
        midi_fx.chain(instrument).chain(inserts)
    }

    pub fn plugin(&self, id: PluginId) -> Option<(SlotKind, usize, &PluginSlot)> {
        self.plugins().find(|(_, _, plugin)| plugin.id == id)
    }

    pub fn plugins_mut(&mut self) -> impl Iterator<Item = &mut PluginSlot> {
        self.midi_fx
            .iter_mut()
            .chain(self.instrument.iter_mut())
            .chain(self.inserts.iter_mut())
    }

    pub fn plugin_mut(&mut self, id: PluginId) -> Option<&mut PluginSlot> {
        self.plugins_mut().find(|plugin| plugin.id == id)
    }

    pub fn is_full(&self, slot: SlotKind) -> bool {
        self.slots(slot).len() >= slot.capacity()
    }

    /// Inserts at `index`, clamped to the list end.
    pub fn insert_plugin(&mut self, slot: SlotKind, index: usize, plugin: PluginSlot) -> usize {
        match slot {
            SlotKind::MidiFx => {
                let index = index.min(self.midi_fx.len());
                self.midi_fx.insert(index, plugin);
                index
            }
            SlotKind::Instrument => {
                self.instrument = Some(plugin);
                0
            }
            SlotKind::Insert => {
                let index = index.min(self.inserts.len());
                self.inserts.insert(index, plugin);
                index
            }
        }
    }

    pub fn remove_plugin(&mut self, slot: SlotKind, index: usize) -> Option<PluginSlot> {
        match slot {
            SlotKind::MidiFx => (index < self.midi_fx.len()).then(|| self.midi_fx.remove(index)),
            SlotKind::Instrument => self.instrument.take(),
            SlotKind::Insert => (index < self.inserts.len()).then(|| self.inserts.remove(index)),
        }
    }

    pub fn send(&self, id: SendId) -> Option<&ChannelSend> {
        self.sends.iter().find(|send| send.id == id)
    }

    pub fn send_mut(&mut self, id: SendId) -> Option<&mut ChannelSend> {
        self.sends.iter_mut().find(|send| send.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_plugin_host::builtin;

    #[test]
    fn plugins_iterate_in_signal_order() {
        let mut channel = Channel::default();
        channel.insert_plugin(SlotKind::Insert, 0, PluginSlot::new(PluginId(2), builtin::gain_descriptor()));
        channel.insert_plugin(
            SlotKind::Instrument,
            0,
            PluginSlot::new(PluginId(1), builtin::sine_descriptor()),
        );
        channel.insert_plugin(
            SlotKind::MidiFx,
            0,
            PluginSlot::new(PluginId(0), builtin::transpose_descriptor()),
        );
        let order: Vec<_> = channel.plugins().map(|(_, _, p)| p.id).collect();
        assert_eq!(order, vec![PluginId(0), PluginId(1), PluginId(2)]);
        assert_eq!(channel.plugin(PluginId(2)).map(|(s, i, _)| (s, i)), Some((SlotKind::Insert, 0)));
    }

    #[test]
    fn slot_kinds_check_categories() {
        assert!(SlotKind::Insert.accepts(PluginCategory::Effect));
        assert!(!SlotKind::Insert.accepts(PluginCategory::Instrument));
        assert!(SlotKind::MidiFx.accepts(PluginCategory::MidiEffect));
        assert_eq!(SlotKind::Instrument.capacity(), 1);
    }

    #[test]
    fn new_slot_takes_descriptor_defaults() {
        let slot = PluginSlot::new(PluginId(0), builtin::gain_descriptor());
        assert_eq!(slot.params, vec![1.0]);
    }
}
