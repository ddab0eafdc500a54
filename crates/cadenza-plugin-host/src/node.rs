//! Graph node wrapping a plugin slot.

use std::ops::Range;
use std::sync::Arc;

use cadenza_graph::{
    MidiBuffer, MidiEvent, NodeIo, PortSpec, ProcessContext, ProcessError, Processable,
};

use crate::audio::AudioBus;
use crate::descriptor::PluginDescriptor;
use crate::instance::PluginInstance;

const MIDI_SCRATCH: usize = cadenza_graph::midi::DEFAULT_MIDI_CAPACITY;

/// Port indices of a plugin node, derived from its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPorts {
    pub audio_in: Range<usize>,
    pub audio_out: Range<usize>,
    pub midi_in: Option<usize>,
    pub midi_out: Option<usize>,
    pub params: Range<usize>,
}

impl PluginPorts {
    pub fn of(descriptor: &PluginDescriptor) -> Self {
        let audio_in = 0..usize::from(descriptor.audio_inputs);
        let audio_out = audio_in.end..audio_in.end + usize::from(descriptor.audio_outputs);
        let mut next = audio_out.end;
        let midi_in = descriptor.has_midi_input().then(|| {
            next += 1;
            next - 1
        });
        let midi_out = descriptor.has_midi_output().then(|| {
            next += 1;
            next - 1
        });
        let params = next..next + descriptor.params.len();
        Self {
            audio_in,
            audio_out,
            midi_in,
            midi_out,
            params,
        }
    }

    pub fn specs(descriptor: &PluginDescriptor) -> Vec<PortSpec> {
        let mut specs = Vec::new();
        for index in 0..descriptor.audio_inputs {
            specs.push(PortSpec::audio_in(format!("in {}", index + 1)));
        }
        for index in 0..descriptor.audio_outputs {
            specs.push(PortSpec::audio_out(format!("out {}", index + 1)));
        }
        if descriptor.has_midi_input() {
            specs.push(PortSpec::midi_in("midi in"));
        }
        if descriptor.has_midi_output() {
            specs.push(PortSpec::midi_out("midi out"));
        }
        for param in &descriptor.params {
            specs.push(PortSpec::control(param.name.clone(), param.range).with_flags(param.flags));
        }
        specs
    }
}

pub struct PluginNode {
    name: String,
    instance: Arc<PluginInstance>,
    ports: PluginPorts,
    bus_in: AudioBus,
    bus_out: AudioBus,
    midi_in: MidiBuffer,
    midi_out: MidiBuffer,
    values: Vec<f32>,
    changed: Vec<bool>,
}

impl PluginNode {
    pub fn new(name: impl Into<String>, instance: Arc<PluginInstance>) -> Self {
        let ports = PluginPorts::of(instance.descriptor());
        let params = ports.params.len();
        Self {
            name: name.into(),
            instance,
            ports,
            bus_in: AudioBus::default(),
            bus_out: AudioBus::default(),
            midi_in: MidiBuffer::with_capacity(MIDI_SCRATCH),
            midi_out: MidiBuffer::with_capacity(MIDI_SCRATCH),
            values: vec![f32::NAN; params],
            changed: vec![true; params],
        }
    }

    pub fn instance(&self) -> &Arc<PluginInstance> {
        &self.instance
    }

    pub fn layout(&self) -> &PluginPorts {
        &self.ports
    }
}

impl Processable for PluginNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        PluginPorts::specs(self.instance.descriptor())
    }

    fn prepare(&mut self, _sample_rate: u32, max_block: usize) {
        self.bus_in = AudioBus::new(self.ports.audio_in.len(), max_block);
        self.bus_out = AudioBus::new(self.ports.audio_out.len(), max_block);
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        let frames = io.frames();
        let offset = io.offset() as u32;

        for (channel, port) in self.ports.audio_in.clone().enumerate() {
            let src = io.samples(port);
            let dst = self.bus_in.channel_mut(channel);
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }

        self.midi_in.clear();
        if let Some(port) = self.ports.midi_in {
            if let Some(buffer) = io.midi(port) {
                for event in buffer.iter() {
                    if event.frame >= offset && event.frame < offset + frames as u32 {
                        self.midi_in.push(MidiEvent {
                            frame: event.frame - offset,
                            message: event.message,
                        });
                    }
                }
            }
        }

        for (slot, port) in self.ports.params.clone().enumerate() {
            let value = io.control(port);
            self.changed[slot] = value.to_bits() != self.values[slot].to_bits();
            self.values[slot] = value;
        }

        self.bus_out.clear();
        self.midi_out.clear();
        self.instance.process(
            &self.bus_in,
            &self.midi_in,
            &mut self.bus_out,
            &mut self.midi_out,
            &self.values,
            &self.changed,
            frames,
        )?;

        for (channel, port) in self.ports.audio_out.clone().enumerate() {
            let src = self.bus_out.channel(channel);
            let dst = io.samples_mut(port);
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        if let Some(port) = self.ports.midi_out {
            if let Some(buffer) = io.midi_mut(port) {
                for event in self.midi_out.iter() {
                    buffer.push(MidiEvent {
                        frame: event.frame + offset,
                        message: event.message,
                    });
                }
            }
        }
        Ok(())
    }

    fn latency_samples(&self) -> u32 {
        self.instance.latency_samples()
    }

    fn on_crash(&mut self) {
        self.instance.mark_crashed();
    }

    fn is_bypassed(&self) -> bool {
        !self.instance.is_enabled() || !self.instance.is_active()
    }
}
