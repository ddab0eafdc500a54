use std::sync::Arc;

use cadenza_graph::{
    MidiEvent, MidiMessage, NodeIo, PortSpec, ProcessContext, ProcessError, Processable,
};

use super::{balance_gains, OnePole, SMOOTHING_MS};
use crate::model::FaderControl;
use crate::runtime::TrackRuntime;

pub const IN_L: usize = 0;
pub const IN_R: usize = 1;
pub const MIDI_IN: usize = 2;
pub const AMP: usize = 3;
pub const BALANCE: usize = 4;
pub const MUTE: usize = 5;
pub const PRE_L: usize = 6;
pub const PRE_R: usize = 7;
pub const POST_L: usize = 8;
pub const POST_R: usize = 9;
pub const MIDI_OUT: usize = 10;

/// Channel strip gain stage. Pre outputs tap the signal before gain,
/// balance and mute; post outputs carry the result.
pub struct FaderNode {
    name: String,
    track: Arc<TrackRuntime>,
    gain: OnePole,
    balance: OnePole,
}

impl FaderNode {
    pub fn new(name: impl Into<String>, track: Arc<TrackRuntime>) -> Self {
        Self {
            name: name.into(),
            track,
            gain: OnePole::new(48_000, SMOOTHING_MS),
            balance: OnePole::new(48_000, SMOOTHING_MS),
        }
    }

    pub fn port_specs() -> Vec<PortSpec> {
        let control = |name: &str, control: FaderControl| {
            let (range, flags) = control.range();
            PortSpec::control(name, range).with_flags(flags)
        };
        vec![
            PortSpec::audio_in("in L"),
            PortSpec::audio_in("in R"),
            PortSpec::midi_in("midi in"),
            control("amp", FaderControl::Amp),
            control("balance", FaderControl::Balance),
            control("mute", FaderControl::Mute),
            PortSpec::audio_out("pre L"),
            PortSpec::audio_out("pre R"),
            PortSpec::audio_out("post L"),
            PortSpec::audio_out("post R"),
            PortSpec::midi_out("midi out"),
        ]
    }

    fn target_gain(&self, io: &NodeIo<'_>) -> f32 {
        let silenced = io.control(MUTE) >= 0.5
            || self.track.is_implied_muted()
            || !self.track.is_enabled();
        if silenced {
            0.0
        } else {
            io.control(AMP)
        }
    }
}

impl Processable for FaderNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        Self::port_specs()
    }

    fn prepare(&mut self, sample_rate: u32, _max_block: usize) {
        self.gain.set_time_ms(sample_rate, SMOOTHING_MS);
        self.balance.set_time_ms(sample_rate, SMOOTHING_MS);
        let initial = if self.track.mute.get() >= 0.5 {
            0.0
        } else {
            self.track.amp.get()
        };
        self.gain.reset(initial);
        self.balance.reset(self.track.balance.get());
    }

    fn process(&mut self, _ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        let target = self.target_gain(io);
        let balance = io.control(BALANCE);

        for (input, pre) in [(IN_L, PRE_L), (IN_R, PRE_R)] {
            let (src, dst) = io.samples_pair(input, pre);
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }

        let frames = io.frames();
        // Both sides follow the same smoothing trajectory.
        let mut gain = self.gain;
        let mut pan = self.balance;
        {
            let (src, dst) = io.samples_pair(IN_L, POST_L);
            let (mut gain, mut pan) = (gain, pan);
            for (out, sample) in dst.iter_mut().zip(src).take(frames) {
                let g = gain.next(target);
                let (left, _) = balance_gains(pan.next(balance));
                *out = sample * g * left;
            }
        }
        {
            let (src, dst) = io.samples_pair(IN_R, POST_R);
            for (out, sample) in dst.iter_mut().zip(src).take(frames) {
                let g = gain.next(target);
                let (_, right) = balance_gains(pan.next(balance));
                *out = sample * g * right;
            }
        }
        self.gain = gain;
        self.balance = pan;

        if let Some(meter) = self.track.meter(0) {
            meter.update(io.samples(POST_L));
        }
        if let Some(meter) = self.track.meter(1) {
            meter.update(io.samples(POST_R));
        }

        let velocity_scale = target;
        let start = io.offset() as u32;
        let end = start + frames as u32;
        if let Some((midi_in, midi_out)) = io.midi_pair(MIDI_IN, MIDI_OUT) {
            for event in midi_in.iter().filter(|e| e.frame >= start && e.frame < end) {
                let message = match event.message {
                    MidiMessage::NoteOn {
                        channel,
                        note,
                        velocity,
                    } => {
                        let scaled = (f32::from(velocity) * velocity_scale).round().clamp(0.0, 127.0) as u8;
                        if scaled == 0 {
                            continue;
                        }
                        MidiMessage::NoteOn {
                            channel,
                            note,
                            velocity: scaled,
                        }
                    }
                    other => other,
                };
                midi_out.push(MidiEvent {
                    frame: event.frame,
                    message,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TrackId;
    use crate::model::{AudioPool, Track, TrackKind};
    use crate::processors::testing::{ports_for, run};
    use cadenza_graph::{DeviceBuffers, TransportView};

    fn fader() -> FaderNode {
        let track = Track::new(TrackId(1), "t", TrackKind::Audio);
        let runtime = Arc::new(TrackRuntime::new(&track, &AudioPool::new()));
        let mut node = FaderNode::new("fader", runtime);
        node.prepare(48_000, 64);
        node
    }

    #[test]
    fn unity_gain_passes_signal_and_taps_pre() {
        let mut node = fader();
        let mut ports = ports_for(&node, 64);
        ports[IN_L].samples_mut().fill(0.5);
        ports[IN_R].samples_mut().fill(-0.5);
        ports[AMP].set_control(1.0);
        let device = DeviceBuffers::new(0, 64, 8);
        run(&mut node, &mut ports, 64, TransportView::default(), &device);
        assert!(ports[POST_L].samples().iter().all(|s| (s - 0.5).abs() < 1e-5));
        assert!(ports[POST_R].samples().iter().all(|s| (s + 0.5).abs() < 1e-5));
        assert_eq!(ports[PRE_L].samples()[10], 0.5);
    }

    #[test]
    fn mute_fades_to_silence_and_drops_notes() {
        let mut node = fader();
        let mut ports = ports_for(&node, 2048);
        ports[IN_L].samples_mut().fill(1.0);
        ports[AMP].set_control(1.0);
        ports[MUTE].set_control(1.0);
        ports[MIDI_IN].midi_mut().unwrap().push(MidiEvent {
            frame: 3,
            message: MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100,
            },
        });
        let device = DeviceBuffers::new(0, 2048, 8);
        run(&mut node, &mut ports, 2048, TransportView::default(), &device);
        assert!(ports[POST_L].samples()[2047].abs() < 1e-3);
        assert_eq!(ports[PRE_L].samples()[2047], 1.0);
        assert!(ports[MIDI_OUT].midi().unwrap().is_empty());
    }

    #[test]
    fn half_amp_scales_velocity() {
        let mut node = fader();
        let mut ports = ports_for(&node, 16);
        ports[AMP].set_control(0.5);
        ports[MIDI_IN].midi_mut().unwrap().push(MidiEvent {
            frame: 0,
            message: MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100,
            },
        });
        let device = DeviceBuffers::new(0, 16, 8);
        run(&mut node, &mut ports, 16, TransportView::default(), &device);
        assert_eq!(
            ports[MIDI_OUT].midi().unwrap().events()[0].message,
            MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 50
            }
        );
    }
}
