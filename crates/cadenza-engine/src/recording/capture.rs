//! Lock-free hand-off of captured input from the audio thread.
//!
//! The audio thread owns a [`CaptureWriter`] and pushes the device input of
//! every captured range into per-channel rings, followed by a
//! [`CaptureMark`] describing where on the timeline those frames belong. The
//! control domain drains the rings through a [`CaptureReader`] and stitches
//! contiguous ranges into takes.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadenza_graph::{MidiBuffer, MidiMessage};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use crate::model::ParamAddress;

/// Recorded channels. Mono devices are duplicated.
pub const CAPTURE_CHANNELS: usize = 2;

/// Timeline placement of one captured range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureMark {
    pub position: u64,
    pub frames: u32,
    /// Loop pass the range was recorded in.
    pub pass: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturedMidi {
    pub position: u64,
    pub pass: u64,
    pub message: MidiMessage,
}

/// A parameter value observed at cycle start while recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutomationSample {
    pub target: ParamAddress,
    pub position: u64,
    pub value: f32,
}

/// Contiguous captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Take {
    pub start: u64,
    pub pass: u64,
    pub channels: Vec<Vec<f32>>,
}

impl Take {
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn end(&self) -> u64 {
        self.start + self.frames() as u64
    }
}

pub struct CaptureWriter {
    audio: Vec<HeapProducer<f32>>,
    marks: HeapProducer<CaptureMark>,
    midi: HeapProducer<CapturedMidi>,
    automation: HeapProducer<AutomationSample>,
    overflow: Arc<AtomicU64>,
}

pub struct CaptureReader {
    audio: Vec<HeapConsumer<f32>>,
    marks: HeapConsumer<CaptureMark>,
    midi: HeapConsumer<CapturedMidi>,
    automation: HeapConsumer<AutomationSample>,
    overflow: Arc<AtomicU64>,
}

/// Creates the rings. `frames` is the audio capacity per channel; the
/// control domain must drain faster than that many frames are recorded.
pub fn capture_channel(frames: usize, events: usize) -> (CaptureWriter, CaptureReader) {
    let frames = frames.max(1);
    let events = events.max(1);
    let mut producers = Vec::with_capacity(CAPTURE_CHANNELS);
    let mut consumers = Vec::with_capacity(CAPTURE_CHANNELS);
    for _ in 0..CAPTURE_CHANNELS {
        let (producer, consumer) = HeapRb::<f32>::new(frames).split();
        producers.push(producer);
        consumers.push(consumer);
    }
    let (mark_tx, mark_rx) = HeapRb::<CaptureMark>::new(events).split();
    let (midi_tx, midi_rx) = HeapRb::<CapturedMidi>::new(events).split();
    let (auto_tx, auto_rx) = HeapRb::<AutomationSample>::new(events).split();
    let overflow = Arc::new(AtomicU64::new(0));
    (
        CaptureWriter {
            audio: producers,
            marks: mark_tx,
            midi: midi_tx,
            automation: auto_tx,
            overflow: Arc::clone(&overflow),
        },
        CaptureReader {
            audio: consumers,
            marks: mark_rx,
            midi: midi_rx,
            automation: auto_rx,
            overflow,
        },
    )
}

impl CaptureWriter {
    /// Captures `range` of the block buffers as timeline `position`.
    /// The whole range is dropped and counted when a ring is full.
    pub fn write(
        &mut self,
        position: u64,
        pass: u64,
        inputs: &[Vec<f32>],
        midi: &MidiBuffer,
        range: Range<usize>,
    ) {
        let frames = range.len();
        if frames == 0 {
            return;
        }
        let fits = self.audio.iter().all(|ring| ring.free_len() >= frames) && !self.marks.is_full();
        if !fits {
            self.overflow.fetch_add(frames as u64, Ordering::Relaxed);
            return;
        }
        for (channel, ring) in self.audio.iter_mut().enumerate() {
            match inputs.get(channel).or_else(|| inputs.first()) {
                Some(source) if source.len() >= range.end => {
                    ring.push_slice(&source[range.clone()]);
                }
                _ => {
                    for _ in 0..frames {
                        let _ = ring.push(0.0);
                    }
                }
            }
        }
        let _ = self.marks.push(CaptureMark {
            position,
            frames: frames as u32,
            pass,
        });
        for event in midi.iter() {
            let frame = event.frame as usize;
            if !range.contains(&frame) {
                continue;
            }
            let captured = CapturedMidi {
                position: position + (frame - range.start) as u64,
                pass,
                message: event.message,
            };
            if self.midi.push(captured).is_err() {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn write_automation(&mut self, sample: AutomationSample) {
        if self.automation.push(sample).is_err() {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl CaptureReader {
    /// Moves everything captured so far into `takes`, `midi` and
    /// `automation`. A range continuing the last take extends it.
    pub fn drain(
        &mut self,
        takes: &mut Vec<Take>,
        midi: &mut Vec<CapturedMidi>,
        automation: &mut Vec<AutomationSample>,
    ) {
        while let Some(mark) = self.marks.pop() {
            let frames = mark.frames as usize;
            let continues = takes
                .last()
                .is_some_and(|take| take.pass == mark.pass && take.end() == mark.position);
            if !continues {
                takes.push(Take {
                    start: mark.position,
                    pass: mark.pass,
                    channels: vec![Vec::new(); self.audio.len()],
                });
            }
            let Some(take) = takes.last_mut() else { break };
            for (ring, channel) in self.audio.iter_mut().zip(&mut take.channels) {
                let from = channel.len();
                channel.resize(from + frames, 0.0);
                ring.pop_slice(&mut channel[from..]);
            }
        }
        while let Some(event) = self.midi.pop() {
            midi.push(event);
        }
        while let Some(sample) = self.automation.pop() {
            automation.push(sample);
        }
    }

    /// Frames and events lost to full rings since the last reset.
    pub fn overflowed(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn reset_overflow(&self) -> u64 {
        self.overflow.swap(0, Ordering::Relaxed)
    }

    /// Discards anything still queued.
    pub fn clear(&mut self) {
        let (mut takes, mut midi, mut automation) = (Vec::new(), Vec::new(), Vec::new());
        self.drain(&mut takes, &mut midi, &mut automation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_graph::MidiEvent;

    fn block(values: &[f32]) -> Vec<Vec<f32>> {
        vec![values.to_vec(), values.iter().map(|v| -v).collect()]
    }

    #[test]
    fn contiguous_ranges_form_one_take() {
        let (mut writer, mut reader) = capture_channel(64, 8);
        let midi = MidiBuffer::with_capacity(4);
        writer.write(100, 0, &block(&[1.0, 2.0, 3.0, 4.0]), &midi, 0..4);
        writer.write(104, 0, &block(&[5.0, 6.0]), &midi, 0..2);
        writer.write(0, 1, &block(&[7.0]), &midi, 0..1);

        let (mut takes, mut events, mut automation) = (Vec::new(), Vec::new(), Vec::new());
        reader.drain(&mut takes, &mut events, &mut automation);
        assert_eq!(takes.len(), 2);
        assert_eq!(takes[0].start, 100);
        assert_eq!(takes[0].channels[0], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(takes[0].channels[1][5], -6.0);
        assert_eq!((takes[1].start, takes[1].pass), (0, 1));
    }

    #[test]
    fn full_ring_drops_the_range() {
        let (mut writer, mut reader) = capture_channel(4, 8);
        let midi = MidiBuffer::with_capacity(4);
        writer.write(0, 0, &block(&[1.0; 3]), &midi, 0..3);
        writer.write(3, 0, &block(&[1.0; 3]), &midi, 0..3);
        assert_eq!(reader.overflowed(), 3);
        let (mut takes, mut events, mut automation) = (Vec::new(), Vec::new(), Vec::new());
        reader.drain(&mut takes, &mut events, &mut automation);
        assert_eq!(takes[0].frames(), 3);
    }

    #[test]
    fn midi_positions_are_relative_to_the_range() {
        let (mut writer, mut reader) = capture_channel(64, 8);
        let mut midi = MidiBuffer::with_capacity(4);
        let on = MidiMessage::NoteOn {
            channel: 0,
            note: 60,
            velocity: 100,
        };
        midi.push(MidiEvent { frame: 1, message: on });
        midi.push(MidiEvent { frame: 6, message: on });
        writer.write(1_000, 0, &block(&[0.0; 8]), &midi, 4..8);
        let (mut takes, mut events, mut automation) = (Vec::new(), Vec::new(), Vec::new());
        reader.drain(&mut takes, &mut events, &mut automation);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position, 1_002);
    }
}
