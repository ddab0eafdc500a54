//! The contract every graph node implements.

use crate::compiled::DeviceBuffers;
use crate::error::ProcessError;
use crate::midi::MidiBuffer;
use crate::port::{Port, PortKind, PortSpec};

/// Transport state as seen by nodes for one processing range.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportView {
    pub rolling: bool,
    pub recording: bool,
    /// Timeline position, in samples, of frame `local_offset` of this range.
    pub playhead: u64,
    pub bpm: f64,
}

/// Everything a node needs to know about the range it is asked to render.
pub struct ProcessContext<'a> {
    /// First frame of the range inside the block buffers.
    pub local_offset: usize,
    pub nframes: usize,
    pub sample_rate: u32,
    /// Monotonic engine frame counter at the start of the range.
    pub engine_frame: u64,
    pub transport: TransportView,
    pub device: &'a DeviceBuffers,
}

impl ProcessContext<'_> {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.local_offset..self.local_offset + self.nframes
    }
}

/// Port access for the node being processed. Inputs are already gathered
/// from upstream nodes; outputs are cleared for the current range.
pub struct NodeIo<'a> {
    ports: &'a mut [Port],
    offset: usize,
    frames: usize,
}

impl<'a> NodeIo<'a> {
    pub fn new(ports: &'a mut [Port], offset: usize, frames: usize) -> Self {
        Self {
            ports,
            offset,
            frames,
        }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn spec(&self, index: usize) -> Option<&PortSpec> {
        self.ports.get(index).map(|port| &port.spec)
    }

    pub fn port(&self, index: usize) -> Option<&Port> {
        self.ports.get(index)
    }

    pub fn port_mut(&mut self, index: usize) -> Option<&mut Port> {
        self.ports.get_mut(index)
    }

    /// Samples of an audio or CV port restricted to the current range.
    pub fn samples(&self, index: usize) -> &[f32] {
        match self.ports.get(index) {
            Some(port) => window(port.samples(), self.offset, self.frames),
            None => &[],
        }
    }

    pub fn samples_mut(&mut self, index: usize) -> &mut [f32] {
        let (offset, frames) = (self.offset, self.frames);
        match self.ports.get_mut(index) {
            Some(port) => window_mut(port.samples_mut(), offset, frames),
            None => &mut [],
        }
    }

    /// Disjoint input and output windows of two buffer ports.
    pub fn samples_pair(&mut self, input: usize, output: usize) -> (&[f32], &mut [f32]) {
        let (offset, frames) = (self.offset, self.frames);
        if input == output || input >= self.ports.len() || output >= self.ports.len() {
            return (&[], &mut []);
        }
        let (low, high) = self.ports.split_at_mut(input.max(output));
        let (a, b) = (&mut low[input.min(output)], &mut high[0]);
        let (input_port, output_port) = if input < output { (a, b) } else { (b, a) };
        (
            window(input_port.samples(), offset, frames),
            window_mut(output_port.samples_mut(), offset, frames),
        )
    }

    pub fn control(&self, index: usize) -> f32 {
        self.ports.get(index).map(Port::control).unwrap_or_default()
    }

    pub fn set_control(&mut self, index: usize, value: f32) {
        if let Some(port) = self.ports.get_mut(index) {
            port.set_control(value);
        }
    }

    pub fn midi(&self, index: usize) -> Option<&MidiBuffer> {
        self.ports.get(index).and_then(Port::midi)
    }

    pub fn midi_mut(&mut self, index: usize) -> Option<&mut MidiBuffer> {
        self.ports.get_mut(index).and_then(Port::midi_mut)
    }

    /// Splits MIDI input and output borrows.
    pub fn midi_pair(&mut self, input: usize, output: usize) -> Option<(&MidiBuffer, &mut MidiBuffer)> {
        if input == output || input >= self.ports.len() || output >= self.ports.len() {
            return None;
        }
        let (low, high) = self.ports.split_at_mut(input.max(output));
        let (a, b) = (&mut low[input.min(output)], &mut high[0]);
        let (input_port, output_port) = if input < output { (a, b) } else { (b, a) };
        Some((input_port.midi()?, output_port.midi_mut()?))
    }

    /// Copies each audio/CV/MIDI input to the output of the same kind and
    /// rank, and silences outputs without a counterpart.
    pub fn bypass(&mut self) {
        for kind in [PortKind::Audio, PortKind::Cv, PortKind::Midi] {
            let inputs: usize = self
                .ports
                .iter()
                .filter(|p| p.spec.kind == kind && p.spec.is_input())
                .count();
            let mut rank = 0;
            for output in 0..self.ports.len() {
                let spec = &self.ports[output].spec;
                if spec.kind != kind || !spec.is_output() {
                    continue;
                }
                let input = (rank < inputs)
                    .then(|| {
                        self.ports
                            .iter()
                            .enumerate()
                            .filter(|(_, p)| p.spec.kind == kind && p.spec.is_input())
                            .nth(rank)
                            .map(|(index, _)| index)
                    })
                    .flatten();
                rank += 1;
                match (kind, input) {
                    (PortKind::Midi, Some(input)) => {
                        let (offset, frames) = (self.offset as u32, self.frames as u32);
                        if let Some((src, dst)) = self.midi_pair(input, output) {
                            dst.merge_range(src, offset, offset + frames);
                        }
                    }
                    (_, Some(input)) => {
                        let (src, dst) = self.samples_pair(input, output);
                        let n = dst.len().min(src.len());
                        dst[..n].copy_from_slice(&src[..n]);
                    }
                    (_, None) => {
                        let (offset, frames) = (self.offset, self.frames);
                        self.ports[output].clear_range(offset, frames);
                    }
                }
            }
        }
    }

    /// Silences every output for the current range.
    pub fn silence_outputs(&mut self) {
        let (offset, frames) = (self.offset, self.frames);
        for port in self.ports.iter_mut().filter(|p| p.spec.is_output()) {
            port.clear_range(offset, frames);
        }
    }
}

fn window(buf: &[f32], offset: usize, frames: usize) -> &[f32] {
    let start = offset.min(buf.len());
    let end = (offset + frames).min(buf.len());
    &buf[start..end]
}

fn window_mut(buf: &mut [f32], offset: usize, frames: usize) -> &mut [f32] {
    let start = offset.min(buf.len());
    let end = (offset + frames).min(buf.len());
    &mut buf[start..end]
}

/// Any entity with ports that takes part in the processing graph.
pub trait Processable: Send {
    fn name(&self) -> &str;

    /// Port layout. The position in the returned list is the port index.
    fn ports(&self) -> Vec<PortSpec>;

    fn prepare(&mut self, _sample_rate: u32, _max_block: usize) {}

    /// Renders `ctx.nframes` frames starting at `ctx.local_offset`.
    fn process(&mut self, ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError>;

    fn latency_samples(&self) -> u32 {
        0
    }

    /// Called once after `process` panicked or failed. The node is bypassed
    /// from then on.
    fn on_crash(&mut self) {}

    /// Whether this node was already disabled outside the graph and should be
    /// bypassed without calling `process`.
    fn is_bypassed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{NodeKey, PortId};

    fn ports(specs: Vec<PortSpec>) -> Vec<Port> {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Port::new(PortId::new(NodeKey(1), i as u16), spec, 4))
            .collect()
    }

    #[test]
    fn bypass_passes_audio_and_silences_extra_outputs() {
        let mut ports = ports(vec![
            PortSpec::audio_in("in"),
            PortSpec::audio_out("out"),
            PortSpec::audio_out("aux"),
        ]);
        ports[0].samples_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        ports[2].samples_mut().fill(9.0);
        let mut io = NodeIo::new(&mut ports, 0, 4);
        io.bypass();
        assert_eq!(ports[1].samples(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ports[2].samples(), &[0.0; 4]);
    }

    #[test]
    fn windows_respect_offset() {
        let mut ports = ports(vec![PortSpec::audio_out("out"), PortSpec::audio_in("in")]);
        ports[1].samples_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut io = NodeIo::new(&mut ports, 2, 2);
        let (input, output) = io.samples_pair(1, 0);
        assert_eq!(input, &[3.0, 4.0]);
        output.copy_from_slice(input);
        assert_eq!(ports[0].samples(), &[0.0, 0.0, 3.0, 4.0]);
    }
}
