use cadenza_graph::{NodeIo, PortSpec, ProcessContext, ProcessError, Processable};

/// Source node exposing the device capture buffers to the graph.
pub struct DeviceInputNode;

impl DeviceInputNode {
    pub const OUT_L: usize = 0;
    pub const OUT_R: usize = 1;
    pub const MIDI_OUT: usize = 2;

    pub fn port_specs() -> Vec<PortSpec> {
        vec![
            PortSpec::audio_out("capture L"),
            PortSpec::audio_out("capture R"),
            PortSpec::midi_out("midi capture"),
        ]
    }
}

impl Processable for DeviceInputNode {
    fn name(&self) -> &str {
        "device input"
    }

    fn ports(&self) -> Vec<PortSpec> {
        Self::port_specs()
    }

    fn process(&mut self, ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        let range = ctx.range();
        let channels = &ctx.device.audio_in;
        for (side, port) in [(0, Self::OUT_L), (1, Self::OUT_R)] {
            // A mono device feeds both sides.
            let Some(source) = channels.get(side).or_else(|| channels.first()) else {
                continue;
            };
            let Some(source) = source.get(range.clone()) else { continue };
            let out = io.samples_mut(port);
            let n = out.len().min(source.len());
            out[..n].copy_from_slice(&source[..n]);
        }
        if let Some(midi) = io.midi_mut(Self::MIDI_OUT) {
            midi.merge_range(&ctx.device.midi_in, range.start as u32, range.end as u32);
        }
        Ok(())
    }
}

/// Terminal node of every graph. Its outputs are what the backend plays.
pub struct MasterOutNode;

impl MasterOutNode {
    pub const IN_L: usize = 0;
    pub const IN_R: usize = 1;
    pub const OUT_L: usize = 2;
    pub const OUT_R: usize = 3;

    pub fn port_specs() -> Vec<PortSpec> {
        vec![
            PortSpec::audio_in("master L"),
            PortSpec::audio_in("master R"),
            PortSpec::audio_out("playback L"),
            PortSpec::audio_out("playback R"),
        ]
    }
}

impl Processable for MasterOutNode {
    fn name(&self) -> &str {
        "master out"
    }

    fn ports(&self) -> Vec<PortSpec> {
        Self::port_specs()
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        for (input, output) in [(Self::IN_L, Self::OUT_L), (Self::IN_R, Self::OUT_R)] {
            let (src, dst) = io.samples_pair(input, output);
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::{ports_for, run};
    use cadenza_graph::{DeviceBuffers, MidiEvent, MidiMessage, TransportView};

    #[test]
    fn mono_capture_feeds_both_sides() {
        let mut device = DeviceBuffers::new(1, 4, 8);
        device.audio_in[0].copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        device.midi_in.push(MidiEvent {
            frame: 2,
            message: MidiMessage::NoteOn {
                channel: 0,
                note: 64,
                velocity: 90,
            },
        });
        let mut node = DeviceInputNode;
        let mut ports = ports_for(&node, 4);
        run(&mut node, &mut ports, 4, TransportView::default(), &device);
        assert_eq!(ports[DeviceInputNode::OUT_L].samples(), &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(ports[DeviceInputNode::OUT_R].samples(), &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(ports[DeviceInputNode::MIDI_OUT].midi().unwrap().len(), 1);
    }

    #[test]
    fn master_copies_its_inputs() {
        let mut node = MasterOutNode;
        let mut ports = ports_for(&node, 2);
        ports[MasterOutNode::IN_L].samples_mut().copy_from_slice(&[0.5, 0.25]);
        run(&mut node, &mut ports, 2, TransportView::default(), &DeviceBuffers::new(0, 2, 8));
        assert_eq!(ports[MasterOutNode::OUT_L].samples(), &[0.5, 0.25]);
        assert_eq!(ports[MasterOutNode::OUT_R].samples(), &[0.0, 0.0]);
    }
}
