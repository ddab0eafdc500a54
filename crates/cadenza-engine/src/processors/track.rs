use std::sync::Arc;

use cadenza_graph::{
    MidiBuffer, MidiEvent, MidiMessage, NodeIo, PortSpec, ProcessContext, ProcessError, Processable,
};

use crate::model::{Region, RegionContent, TrackKind};
use crate::runtime::{TrackContent, TrackRuntime};

pub const IN_L: usize = 0;
pub const IN_R: usize = 1;
pub const MIDI_IN: usize = 2;
pub const OUT_L: usize = 3;
pub const OUT_R: usize = 4;
pub const MIDI_OUT: usize = 5;

const CHORD_VELOCITY: u8 = 100;
const CHANNEL: u8 = 0;

/// Head of a track: renders its regions for the cycle range and passes
/// monitored input through.
pub struct TrackProcessor {
    name: String,
    track: Arc<TrackRuntime>,
    /// Pitches with an open note-on.
    sounding: [bool; 128],
    /// Playhead the next range continues from, if nothing jumped.
    expected: Option<u64>,
}

impl TrackProcessor {
    pub fn new(name: impl Into<String>, track: Arc<TrackRuntime>) -> Self {
        Self {
            name: name.into(),
            track,
            sounding: [false; 128],
            expected: None,
        }
    }

    pub fn port_specs() -> Vec<PortSpec> {
        vec![
            PortSpec::audio_in("in L"),
            PortSpec::audio_in("in R"),
            PortSpec::midi_in("midi in"),
            PortSpec::audio_out("out L"),
            PortSpec::audio_out("out R"),
            PortSpec::midi_out("midi out"),
        ]
    }

    fn passes_input(&self) -> bool {
        self.track.kind.accepts_routing() || self.track.is_armed()
    }

    fn release_all(&mut self, midi: &mut MidiBuffer, frame: u32) {
        if self.sounding.iter().any(|on| *on) {
            midi.push(MidiEvent {
                frame,
                message: MidiMessage::AllNotesOff { channel: CHANNEL },
            });
            self.sounding = [false; 128];
        }
    }

    fn render_audio(region: &Region, content: &TrackContent, playhead: u64, io: &mut NodeIo<'_>) {
        let RegionContent::Audio { clip, gain } = region.content else { return };
        let Some(clip) = content.clip(clip) else { return };
        let frames = io.frames() as u64;
        let start = region.position.max(playhead);
        let end = region.end().min(playhead + frames);
        for (channel, port) in [(0, OUT_L), (1, OUT_R)] {
            let out = io.samples_mut(port);
            for position in start..end {
                let local = position - region.position;
                let source = region.content_position(local) as usize;
                let sample = clip.sample(channel, source) * gain * region.fade_gain(local);
                out[(position - playhead) as usize] += sample;
            }
        }
    }

    /// Emits note events of `region` for timeline range `[start, end)`. The
    /// range is walked in pieces that are contiguous in content time.
    fn render_notes(&mut self, region: &Region, playhead: u64, offset: u32, start: u64, end: u64, midi: &mut MidiBuffer) {
        let frame_of = |position: u64| offset + (position - playhead) as u32;
        let mut local = start - region.position;
        let local_end = end - region.position;
        while local < local_end {
            let content_start = region.content_position(local);
            let mut len = local_end - local;
            let wraps = region.loop_end > region.loop_start && content_start < region.loop_end;
            if wraps {
                len = len.min(region.loop_end - content_start);
            }
            let content_end = content_start + len;
            let timeline = region.position + local;

            let mut note = |note_start: u64, note_end: u64, pitch: u8, velocity: u8| {
                let pitch = usize::from(pitch.min(127));
                if (content_start..content_end).contains(&note_start) && note_end > note_start {
                    midi.push(MidiEvent {
                        frame: frame_of(timeline + (note_start - content_start)),
                        message: MidiMessage::NoteOn {
                            channel: CHANNEL,
                            note: pitch as u8,
                            velocity,
                        },
                    });
                    self.sounding[pitch] = true;
                }
                if (content_start..content_end).contains(&note_end) && self.sounding[pitch] {
                    midi.push(MidiEvent {
                        frame: frame_of(timeline + (note_end - content_start)),
                        message: MidiMessage::NoteOff {
                            channel: CHANNEL,
                            note: pitch as u8,
                            velocity: 0,
                        },
                    });
                    self.sounding[pitch] = false;
                }
            };
            match &region.content {
                RegionContent::Midi { notes } => {
                    for n in notes {
                        note(n.start, n.end(), n.pitch, n.velocity);
                    }
                }
                RegionContent::Chord { chords } => {
                    for chord in chords {
                        for pitch in chord.pitches() {
                            note(chord.position, chord.position + chord.length, pitch, CHORD_VELOCITY);
                        }
                    }
                }
                _ => return,
            }

            local += len;
            let region_done = local >= region.length;
            let wrapped = wraps && content_end == region.loop_end;
            if region_done || wrapped {
                let last = frame_of(region.position + local - 1);
                for pitch in 0..128u8 {
                    if self.sounding[usize::from(pitch)] {
                        midi.push(MidiEvent {
                            frame: last,
                            message: MidiMessage::NoteOff {
                                channel: CHANNEL,
                                note: pitch,
                                velocity: 0,
                            },
                        });
                        self.sounding[usize::from(pitch)] = false;
                    }
                }
            }
        }
    }
}

impl Processable for TrackProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortSpec> {
        Self::port_specs()
    }

    fn process(&mut self, ctx: &ProcessContext<'_>, io: &mut NodeIo<'_>) -> Result<(), ProcessError> {
        let offset = io.offset() as u32;
        let frames = io.frames() as u64;

        if self.passes_input() {
            for (input, output) in [(IN_L, OUT_L), (IN_R, OUT_R)] {
                let (src, dst) = io.samples_pair(input, output);
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
            if let Some((src, dst)) = io.midi_pair(MIDI_IN, MIDI_OUT) {
                dst.merge_range(src, offset, offset + frames as u32);
            }
        }

        let transport = ctx.transport;
        let playing = transport.rolling && self.track.is_enabled();
        let jumped = self.expected != Some(transport.playhead);
        if !playing || jumped {
            if let Some(midi) = io.midi_mut(MIDI_OUT) {
                self.release_all(midi, offset);
            }
        }
        if !playing {
            self.expected = None;
            return Ok(());
        }
        self.expected = Some(transport.playhead + frames);
        if matches!(self.track.kind, TrackKind::Bus | TrackKind::Master) {
            return Ok(());
        }

        let content = self.track.content();
        let playhead = transport.playhead;
        let end = playhead + frames;
        for region in content.regions.iter().filter(|r| r.overlaps(playhead, end)) {
            match region.content {
                RegionContent::Audio { .. } => Self::render_audio(region, &content, playhead, io),
                RegionContent::Midi { .. } | RegionContent::Chord { .. } => {
                    let start = region.position.max(playhead);
                    let stop = region.end().min(end);
                    if let Some(midi) = io.midi_mut(MIDI_OUT) {
                        self.render_notes(region, playhead, offset, start, stop, midi);
                    }
                }
                RegionContent::Automation { .. } => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClipId, NoteId, RegionId, TrackId};
    use crate::model::{AudioClip, AudioPool, MidiNote, Track};
    use crate::processors::testing::{ports_for, run};
    use cadenza_graph::{DeviceBuffers, Port, TransportView};

    fn rolling(playhead: u64) -> TransportView {
        TransportView {
            rolling: true,
            recording: false,
            playhead,
            bpm: 120.0,
        }
    }

    fn midi_track(region: Region) -> TrackProcessor {
        let mut track = Track::new(TrackId(1), "keys", TrackKind::Midi);
        track.lanes[0].insert(region).unwrap();
        let runtime = TrackRuntime::new(&track, &AudioPool::new());
        TrackProcessor::new("keys", Arc::new(runtime))
    }

    fn events(ports: &[Port]) -> Vec<MidiEvent> {
        ports[MIDI_OUT].midi().unwrap().events().to_vec()
    }

    fn note(start: u64, length: u64, pitch: u8) -> MidiNote {
        MidiNote {
            id: NoteId(0),
            start,
            length,
            pitch,
            velocity: 100,
        }
    }

    #[test]
    fn renders_audio_with_region_offset() {
        let mut pool = AudioPool::new();
        pool.insert(AudioClip::new(ClipId(0), "clip", 48_000, vec![(0..16).map(|i| i as f32).collect()]));
        let mut track = Track::new(TrackId(1), "audio", TrackKind::Audio);
        track.lanes[0]
            .insert(Region::audio(RegionId(0), 4, 8, ClipId(0)).with_clip_start(2))
            .unwrap();
        let mut node = TrackProcessor::new("audio", Arc::new(TrackRuntime::new(&track, &pool)));
        let mut ports = ports_for(&node, 8);
        run(&mut node, &mut ports, 8, rolling(0), &DeviceBuffers::new(0, 8, 8));
        assert_eq!(ports[OUT_L].samples(), &[0.0, 0.0, 0.0, 0.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ports[OUT_R].samples(), ports[OUT_L].samples());
    }

    #[test]
    fn notes_become_events_at_their_frames() {
        let mut region = Region::midi(RegionId(0), 10, 100);
        region.insert_note(note(5, 20, 60));
        let mut node = midi_track(region);
        let mut ports = ports_for(&node, 64);
        run(&mut node, &mut ports, 64, rolling(0), &DeviceBuffers::new(0, 64, 8));
        let events = events(&ports);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].frame, 15);
        assert!(matches!(events[0].message, MidiMessage::NoteOn { note: 60, .. }));
        assert_eq!(events[1].frame, 35);
        assert!(matches!(events[1].message, MidiMessage::NoteOff { note: 60, .. }));
    }

    #[test]
    fn looped_region_closes_notes_at_the_wrap() {
        let mut region = Region::midi(RegionId(0), 0, 40).with_loop(0, 10);
        region.insert_note(note(5, 20, 62));
        let mut node = midi_track(region);
        let mut ports = ports_for(&node, 40);
        run(&mut node, &mut ports, 40, rolling(0), &DeviceBuffers::new(0, 40, 8));
        let ons: Vec<u32> = events(&ports)
            .iter()
            .filter(|e| matches!(e.message, MidiMessage::NoteOn { .. }))
            .map(|e| e.frame)
            .collect();
        let offs: Vec<u32> = events(&ports)
            .iter()
            .filter(|e| matches!(e.message, MidiMessage::NoteOff { .. }))
            .map(|e| e.frame)
            .collect();
        assert_eq!(ons, vec![5, 15, 25, 35]);
        assert_eq!(offs, vec![9, 19, 29, 39]);
    }

    #[test]
    fn stopping_releases_sounding_notes() {
        let mut region = Region::midi(RegionId(0), 0, 100);
        region.insert_note(note(0, 80, 64));
        let mut node = midi_track(region);
        let device = DeviceBuffers::new(0, 16, 8);
        let mut ports = ports_for(&node, 16);
        run(&mut node, &mut ports, 16, rolling(0), &device);
        let mut ports = ports_for(&node, 16);
        run(&mut node, &mut ports, 16, TransportView::default(), &device);
        assert_eq!(
            events(&ports),
            vec![MidiEvent {
                frame: 0,
                message: MidiMessage::AllNotesOff { channel: 0 }
            }]
        );
    }

    #[test]
    fn armed_track_monitors_its_input() {
        let mut track = Track::new(TrackId(1), "vox", TrackKind::Audio);
        track.armed = true;
        let mut node = TrackProcessor::new("vox", Arc::new(TrackRuntime::new(&track, &AudioPool::new())));
        let mut ports = ports_for(&node, 4);
        ports[IN_L].samples_mut().fill(0.3);
        run(&mut node, &mut ports, 4, TransportView::default(), &DeviceBuffers::new(0, 4, 8));
        assert_eq!(ports[OUT_L].samples(), &[0.3; 4]);

        track.armed = false;
        let mut node = TrackProcessor::new("vox", Arc::new(TrackRuntime::new(&track, &AudioPool::new())));
        let mut ports = ports_for(&node, 4);
        ports[IN_L].samples_mut().fill(0.3);
        run(&mut node, &mut ports, 4, TransportView::default(), &DeviceBuffers::new(0, 4, 8));
        assert_eq!(ports[OUT_L].samples(), &[0.0; 4]);
    }
}
