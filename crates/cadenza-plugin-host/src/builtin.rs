//! Plugins shipped with the engine.

use std::f32::consts::TAU;

use cadenza_graph::{MidiBuffer, MidiEvent, MidiMessage, PortFlags, PortRange};

use crate::audio::AudioBus;
use crate::descriptor::{ParamInfo, PluginCategory, PluginDescriptor};
use crate::error::PluginError;
use crate::native::{NativePlugin, NativeRegistry};

pub const GAIN_URI: &str = "cadenza:gain";
pub const SINE_URI: &str = "cadenza:sine";
pub const TRANSPOSE_URI: &str = "cadenza:transpose";

const VENDOR: &str = "Cadenza";

pub fn gain_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(GAIN_URI, "Gain", PluginCategory::Effect)
        .with_vendor(VENDOR, env!("CARGO_PKG_VERSION"))
        .with_audio(2, 2)
        .with_param(ParamInfo::new(0, "gain", PortRange::new(0.0, 2.0, 1.0)))
}

pub fn sine_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(SINE_URI, "Sine", PluginCategory::Instrument)
        .with_vendor(VENDOR, env!("CARGO_PKG_VERSION"))
        .with_audio(0, 2)
        .with_midi(1, 0)
        .with_param(ParamInfo::new(0, "level", PortRange::new(0.0, 1.0, 0.25)))
}

pub fn transpose_descriptor() -> PluginDescriptor {
    PluginDescriptor::new(TRANSPOSE_URI, "Transpose", PluginCategory::MidiEffect)
        .with_vendor(VENDOR, env!("CARGO_PKG_VERSION"))
        .with_midi(1, 1)
        .with_param(
            ParamInfo::new(0, "semitones", PortRange::new(-24.0, 24.0, 0.0)).with_flags(PortFlags {
                integer: true,
                automatable: true,
                ..PortFlags::default()
            }),
        )
}

pub(crate) fn register_builtins(registry: &NativeRegistry) {
    registry.register(gain_descriptor(), || Box::new(Gain));
    registry.register(sine_descriptor(), || Box::<Sine>::default());
    registry.register(transpose_descriptor(), || Box::new(Transpose));
}

struct Gain;

impl NativePlugin for Gain {
    fn process(
        &mut self,
        audio_in: &AudioBus,
        _midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        _midi_out: &mut MidiBuffer,
        params: &[f32],
        nframes: usize,
    ) -> Result<(), PluginError> {
        let gain = params.first().copied().unwrap_or(1.0);
        for (index, out) in audio_out.iter_mut().enumerate() {
            let input = audio_in.channel(index);
            let n = nframes.min(out.len()).min(input.len());
            for (o, i) in out[..n].iter_mut().zip(&input[..n]) {
                *o = *i * gain;
            }
        }
        Ok(())
    }
}

const VOICES: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct Voice {
    note: Option<u8>,
    phase: f32,
    increment: f32,
    velocity: f32,
}

#[derive(Default)]
struct Sine {
    voices: [Voice; VOICES],
    sample_rate: f32,
    next_voice: usize,
}

impl Sine {
    fn handle(&mut self, message: MidiMessage) {
        match message {
            MidiMessage::NoteOn { note, velocity, .. } => {
                let slot = self
                    .voices
                    .iter()
                    .position(|voice| voice.note.is_none())
                    .unwrap_or_else(|| {
                        let stolen = self.next_voice;
                        self.next_voice = (self.next_voice + 1) % VOICES;
                        stolen
                    });
                let frequency = 440.0 * 2f32.powf((f32::from(note) - 69.0) / 12.0);
                self.voices[slot] = Voice {
                    note: Some(note),
                    phase: 0.0,
                    increment: frequency / self.sample_rate.max(1.0),
                    velocity: f32::from(velocity) / 127.0,
                };
            }
            MidiMessage::NoteOff { note, .. } => {
                for voice in &mut self.voices {
                    if voice.note == Some(note) {
                        voice.note = None;
                    }
                }
            }
            MidiMessage::AllNotesOff { .. } => {
                for voice in &mut self.voices {
                    voice.note = None;
                }
            }
            _ => {}
        }
    }
}

impl NativePlugin for Sine {
    fn activate(&mut self, sample_rate: u32, _max_block: usize) {
        self.sample_rate = sample_rate as f32;
    }

    fn deactivate(&mut self) {
        self.voices = [Voice::default(); VOICES];
    }

    fn process(
        &mut self,
        _audio_in: &AudioBus,
        midi_in: &MidiBuffer,
        audio_out: &mut AudioBus,
        _midi_out: &mut MidiBuffer,
        params: &[f32],
        nframes: usize,
    ) -> Result<(), PluginError> {
        let level = params.first().copied().unwrap_or(0.25);
        let mut events = midi_in.iter().peekable();
        let frames = nframes.min(audio_out.frames());
        for frame in 0..frames {
            while let Some(event) = events.next_if(|event| event.frame as usize <= frame) {
                self.handle(event.message);
            }
            let mut sample = 0.0;
            for voice in &mut self.voices {
                if voice.note.is_some() {
                    sample += (voice.phase * TAU).sin() * voice.velocity;
                    voice.phase = (voice.phase + voice.increment).fract();
                }
            }
            sample *= level;
            for channel in audio_out.iter_mut() {
                channel[frame] = sample;
            }
        }
        for event in events {
            self.handle(event.message);
        }
        Ok(())
    }
}

struct Transpose;

impl NativePlugin for Transpose {
    fn process(
        &mut self,
        _audio_in: &AudioBus,
        midi_in: &MidiBuffer,
        _audio_out: &mut AudioBus,
        midi_out: &mut MidiBuffer,
        params: &[f32],
        _nframes: usize,
    ) -> Result<(), PluginError> {
        let shift = params.first().copied().unwrap_or(0.0) as i16;
        let transpose = |note: u8| (i16::from(note) + shift).clamp(0, 127) as u8;
        for event in midi_in.iter() {
            let message = match event.message {
                MidiMessage::NoteOn {
                    channel,
                    note,
                    velocity,
                } => MidiMessage::NoteOn {
                    channel,
                    note: transpose(note),
                    velocity,
                },
                MidiMessage::NoteOff {
                    channel,
                    note,
                    velocity,
                } => MidiMessage::NoteOff {
                    channel,
                    note: transpose(note),
                    velocity,
                },
                other => other,
            };
            midi_out.push(MidiEvent {
                frame: event.frame,
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PluginAdapter;
    use crate::native::NativeAdapter;

    fn adapter(desc: PluginDescriptor) -> NativeAdapter {
        let registry = NativeRegistry::with_builtins();
        let mut adapter = NativeAdapter::load(&registry, &desc).unwrap();
        adapter.activate(48_000, 64).unwrap();
        adapter
    }

    #[test]
    fn gain_scales_every_channel() {
        let mut gain = adapter(gain_descriptor());
        gain.set_param(0, 0.5);
        let mut input = AudioBus::new(2, 8);
        input.channel_mut(0).fill(1.0);
        input.channel_mut(1).fill(-2.0);
        let mut output = AudioBus::new(2, 8);
        let midi = MidiBuffer::with_capacity(1);
        let mut midi_out = MidiBuffer::with_capacity(1);
        gain.process(&input, &midi, &mut output, &mut midi_out, 8).unwrap();
        assert!(output.channel(0).iter().all(|s| *s == 0.5));
        assert!(output.channel(1).iter().all(|s| *s == -1.0));
    }

    #[test]
    fn sine_is_silent_until_note_on() {
        let mut sine = adapter(sine_descriptor());
        let input = AudioBus::new(0, 0);
        let mut output = AudioBus::new(2, 64);
        let mut midi = MidiBuffer::with_capacity(4);
        let mut midi_out = MidiBuffer::with_capacity(1);
        midi.push(MidiEvent {
            frame: 32,
            message: MidiMessage::NoteOn {
                channel: 0,
                note: 69,
                velocity: 127,
            },
        });
        sine.process(&input, &midi, &mut output, &mut midi_out, 64).unwrap();
        assert!(output.channel(0)[..32].iter().all(|s| *s == 0.0));
        assert!(output.channel(0)[33..].iter().any(|s| s.abs() > 0.0));
        assert_eq!(output.channel(0), output.channel(1));
    }

    #[test]
    fn transpose_shifts_notes_and_clamps() {
        let mut transpose = adapter(transpose_descriptor());
        transpose.set_param(0, 12.4);
        assert_eq!(transpose.param(0), Some(12.0));
        let input = AudioBus::default();
        let mut output = AudioBus::default();
        let mut midi = MidiBuffer::with_capacity(4);
        let mut midi_out = MidiBuffer::with_capacity(4);
        midi.push(MidiEvent {
            frame: 3,
            message: MidiMessage::NoteOn {
                channel: 1,
                note: 60,
                velocity: 100,
            },
        });
        midi.push(MidiEvent {
            frame: 5,
            message: MidiMessage::NoteOn {
                channel: 1,
                note: 120,
                velocity: 100,
            },
        });
        transpose
            .process(&input, &midi, &mut output, &mut midi_out, 8)
            .unwrap();
        let notes: Vec<_> = midi_out
            .iter()
            .filter_map(|event| match event.message {
                MidiMessage::NoteOn { note, .. } => Some((event.frame, note)),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec![(3, 72), (5, 127)]);
    }
}
