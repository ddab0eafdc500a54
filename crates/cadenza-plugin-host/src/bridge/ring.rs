//! Shared-memory block exchange between the host and a sandbox process.
//!
//! The ring holds two slots per direction. The host publishes input block
//! `g` into slot `g % 2` and bumps `input_gen`; the sandbox renders it into
//! output slot `g % 2` and stores `output_gen = g`. The host only reads the
//! output of the block it published one cycle earlier, so neither side
//! waits on the other.

use std::fs::File;
use std::mem::size_of;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use cadenza_graph::{MidiBuffer, MidiEvent, MidiMessage};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::audio::AudioBus;
use crate::error::BridgeError;

const RING_MAGIC: u32 = 0x4344_5a52;
const SLOTS: usize = 2;

/// Default number of MIDI events per block that fit in the ring.
pub const BRIDGE_MIDI_CAPACITY: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RingStatus {
    Running = 0,
    Crashed = 1,
    Closed = 2,
}

impl RingStatus {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Crashed,
            _ => Self::Closed,
        }
    }
}

#[repr(C)]
struct RingHeader {
    magic: u32,
    status: AtomicU32,
    input_gen: AtomicU32,
    output_gen: AtomicU32,
    frames: u32,
    inputs: u32,
    outputs: u32,
    params: u32,
    midi_capacity: u32,
    input_frames: [AtomicU32; SLOTS],
    output_frames: [AtomicU32; SLOTS],
    midi_in_len: [AtomicU32; SLOTS],
    midi_out_len: [AtomicU32; SLOTS],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawMidi {
    frame: u32,
    bytes: [u8; 4],
}

/// Sizes of the regions inside the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingLayout {
    /// Largest block either side may exchange.
    pub frames: u32,
    pub inputs: u32,
    pub outputs: u32,
    pub params: u32,
    pub midi_capacity: u32,
}

impl RingLayout {
    fn params_offset(&self) -> usize {
        size_of::<RingHeader>()
    }

    fn audio_in_offset(&self, slot: usize) -> usize {
        self.params_offset()
            + self.params as usize * size_of::<AtomicU32>()
            + slot * self.audio_in_len() * size_of::<f32>()
    }

    fn audio_out_offset(&self, slot: usize) -> usize {
        self.audio_in_offset(SLOTS) + slot * self.audio_out_len() * size_of::<f32>()
    }

    fn midi_in_offset(&self, slot: usize) -> usize {
        self.audio_out_offset(SLOTS) + slot * self.midi_capacity as usize * size_of::<RawMidi>()
    }

    fn midi_out_offset(&self, slot: usize) -> usize {
        self.midi_in_offset(SLOTS) + slot * self.midi_capacity as usize * size_of::<RawMidi>()
    }

    fn audio_in_len(&self) -> usize {
        self.frames as usize * self.inputs as usize
    }

    fn audio_out_len(&self) -> usize {
        self.frames as usize * self.outputs as usize
    }

    pub fn total_len(&self) -> usize {
        self.midi_out_offset(SLOTS)
    }
}

/// What the sandbox needs to map the same ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedRingDescriptor {
    pub path: PathBuf,
    pub layout: RingLayout,
}

pub struct SharedRing {
    descriptor: SharedRingDescriptor,
    // Only the creating side owns the backing file.
    _file: Option<NamedTempFile>,
    _mmap: MmapMut,
    base: *mut u8,
}

// SAFETY: all shared fields are accessed through atomics or through slots
// whose ownership is handed over by the generation counters.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl SharedRing {
    pub fn create(layout: RingLayout) -> Result<Self, BridgeError> {
        let file = tempfile::Builder::new()
            .prefix("cadenza-bridge-ring")
            .tempfile()?;
        let total_len = layout.total_len();
        file.as_file().set_len(total_len as u64)?;
        // SAFETY: the file was just created with the mapped length.
        let mut mmap = unsafe { MmapOptions::new().len(total_len).map_mut(file.as_file())? };
        let base = mmap.as_mut_ptr();
        // SAFETY: the mapping is at least one header long and page aligned.
        unsafe {
            ptr::write_bytes(base, 0, total_len);
            ptr::write(
                base as *mut RingHeader,
                RingHeader {
                    magic: RING_MAGIC,
                    status: AtomicU32::new(RingStatus::Running as u32),
                    input_gen: AtomicU32::new(0),
                    output_gen: AtomicU32::new(0),
                    frames: layout.frames,
                    inputs: layout.inputs,
                    outputs: layout.outputs,
                    params: layout.params,
                    midi_capacity: layout.midi_capacity,
                    input_frames: Default::default(),
                    output_frames: Default::default(),
                    midi_in_len: Default::default(),
                    midi_out_len: Default::default(),
                },
            );
        }
        let descriptor = SharedRingDescriptor {
            path: file.path().to_path_buf(),
            layout,
        };
        Ok(Self {
            descriptor,
            _file: Some(file),
            _mmap: mmap,
            base,
        })
    }

    pub fn open(descriptor: &SharedRingDescriptor) -> Result<Self, BridgeError> {
        let file = File::options().read(true).write(true).open(&descriptor.path)?;
        let len = file.metadata()?.len() as usize;
        if len < descriptor.layout.total_len() {
            return Err(BridgeError::Ring("backing file is too small"));
        }
        // SAFETY: the length was checked against the layout above.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let ring = Self {
            descriptor: descriptor.clone(),
            _file: None,
            _mmap: mmap,
            base,
        };
        let header = ring.header();
        let layout = descriptor.layout;
        if header.magic != RING_MAGIC {
            return Err(BridgeError::Ring("bad magic"));
        }
        if header.frames != layout.frames
            || header.inputs != layout.inputs
            || header.outputs != layout.outputs
            || header.params != layout.params
            || header.midi_capacity != layout.midi_capacity
        {
            return Err(BridgeError::Ring("layout mismatch"));
        }
        Ok(ring)
    }

    pub fn descriptor(&self) -> &SharedRingDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> RingLayout {
        self.descriptor.layout
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the header was written at creation and lives for the mapping.
        unsafe { &*(self.base as *const RingHeader) }
    }

    fn param_cell(&self, index: usize) -> Option<&AtomicU32> {
        if index >= self.layout().params as usize {
            return None;
        }
        // SAFETY: index is within the params region.
        unsafe {
            let cells = self.base.add(self.layout().params_offset()) as *const AtomicU32;
            Some(&*cells.add(index))
        }
    }

    pub fn status(&self) -> RingStatus {
        RingStatus::from_u32(self.header().status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: RingStatus) {
        self.header().status.store(status as u32, Ordering::Release);
    }

    pub fn set_param(&self, index: usize, value: f32) {
        if let Some(cell) = self.param_cell(index) {
            cell.store(value.to_bits(), Ordering::Release);
        }
    }

    pub fn param(&self, index: usize) -> Option<f32> {
        self.param_cell(index)
            .map(|cell| f32::from_bits(cell.load(Ordering::Acquire)))
    }

    pub fn input_generation(&self) -> u32 {
        self.header().input_gen.load(Ordering::Acquire)
    }

    pub fn output_generation(&self) -> u32 {
        self.header().output_gen.load(Ordering::Acquire)
    }

    /// Host side: copies one input block into the next slot and publishes
    /// it. Returns the new generation.
    pub fn publish_input(&self, audio: &AudioBus, midi: &MidiBuffer, nframes: usize) -> u32 {
        let layout = self.layout();
        let header = self.header();
        let generation = next_generation(header.input_gen.load(Ordering::Relaxed));
        let slot = generation as usize % SLOTS;
        let frames = nframes.min(layout.frames as usize);
        // SAFETY: the sandbox never reads this slot until `input_gen` moves to it.
        unsafe {
            let dst = self.base.add(layout.audio_in_offset(slot)) as *mut f32;
            write_planar(dst, layout.frames as usize, layout.inputs as usize, audio, frames);
            let events = self.base.add(layout.midi_in_offset(slot)) as *mut RawMidi;
            let count = write_midi(events, layout.midi_capacity as usize, midi, frames as u32);
            header.midi_in_len[slot].store(count, Ordering::Relaxed);
        }
        header.input_frames[slot].store(frames as u32, Ordering::Relaxed);
        header.input_gen.store(generation, Ordering::Release);
        generation
    }

    /// Host side: copies the output of `generation` if the sandbox finished
    /// it. Returns false and leaves the buffers untouched otherwise.
    pub fn read_output(
        &self,
        generation: u32,
        audio: &mut AudioBus,
        midi: &mut MidiBuffer,
        nframes: usize,
    ) -> bool {
        let header = self.header();
        if header.output_gen.load(Ordering::Acquire) != generation {
            return false;
        }
        let layout = self.layout();
        let slot = generation as usize % SLOTS;
        let frames = (header.output_frames[slot].load(Ordering::Relaxed) as usize).min(nframes);
        // SAFETY: the sandbox writes this slot again only for `generation + 2`,
        // which the host has not published yet.
        unsafe {
            let src = self.base.add(layout.audio_out_offset(slot)) as *const f32;
            read_planar(src, layout.frames as usize, layout.outputs as usize, audio, frames);
            let events = self.base.add(layout.midi_out_offset(slot)) as *const RawMidi;
            let count = header.midi_out_len[slot].load(Ordering::Relaxed) as usize;
            read_midi(events, count.min(layout.midi_capacity as usize), midi, frames as u32);
        }
        true
    }

    /// Sandbox side: copies input block `generation`. Returns `None` when the
    /// host already overwrote the slot.
    pub fn read_input(
        &self,
        generation: u32,
        audio: &mut AudioBus,
        midi: &mut MidiBuffer,
    ) -> Option<usize> {
        let header = self.header();
        let layout = self.layout();
        let slot = generation as usize % SLOTS;
        let frames = (header.input_frames[slot].load(Ordering::Relaxed) as usize)
            .min(layout.frames as usize);
        midi.clear();
        // SAFETY: reads may race with a lapping host; the generation check
        // below discards such a block.
        unsafe {
            let src = self.base.add(layout.audio_in_offset(slot)) as *const f32;
            read_planar(src, layout.frames as usize, layout.inputs as usize, audio, frames);
            let events = self.base.add(layout.midi_in_offset(slot)) as *const RawMidi;
            let count = header.midi_in_len[slot].load(Ordering::Relaxed) as usize;
            read_midi(events, count.min(layout.midi_capacity as usize), midi, frames as u32);
        }
        let latest = header.input_gen.load(Ordering::Acquire);
        (latest.wrapping_sub(generation) < SLOTS as u32).then_some(frames)
    }

    /// Sandbox side: publishes the rendered output of `generation`.
    pub fn write_output(&self, generation: u32, audio: &AudioBus, midi: &MidiBuffer, nframes: usize) {
        let header = self.header();
        let layout = self.layout();
        let slot = generation as usize % SLOTS;
        let frames = nframes.min(layout.frames as usize);
        // SAFETY: the host reads this slot only after `output_gen` is stored.
        unsafe {
            let dst = self.base.add(layout.audio_out_offset(slot)) as *mut f32;
            write_planar(dst, layout.frames as usize, layout.outputs as usize, audio, frames);
            let events = self.base.add(layout.midi_out_offset(slot)) as *mut RawMidi;
            let count = write_midi(events, layout.midi_capacity as usize, midi, frames as u32);
            header.midi_out_len[slot].store(count, Ordering::Relaxed);
        }
        header.output_frames[slot].store(frames as u32, Ordering::Relaxed);
        header.output_gen.store(generation, Ordering::Release);
    }
}

impl std::fmt::Debug for SharedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRing")
            .field("descriptor", &self.descriptor)
            .field("status", &self.status())
            .finish()
    }
}

fn next_generation(current: u32) -> u32 {
    match current.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

unsafe fn write_planar(dst: *mut f32, stride: usize, channels: usize, audio: &AudioBus, frames: usize) {
    for channel in 0..channels {
        let target = dst.add(channel * stride);
        let source = audio.channel(channel);
        let n = frames.min(source.len());
        ptr::copy_nonoverlapping(source.as_ptr(), target, n);
        if n < frames {
            ptr::write_bytes(target.add(n), 0, frames - n);
        }
    }
}

unsafe fn read_planar(src: *const f32, stride: usize, channels: usize, audio: &mut AudioBus, frames: usize) {
    for channel in 0..channels.min(audio.channels()) {
        let target = audio.channel_mut(channel);
        let n = frames.min(target.len());
        ptr::copy_nonoverlapping(src.add(channel * stride), target.as_mut_ptr(), n);
    }
}

unsafe fn write_midi(dst: *mut RawMidi, capacity: usize, midi: &MidiBuffer, frames: u32) -> u32 {
    let mut count = 0;
    for event in midi.iter().filter(|event| event.frame < frames).take(capacity) {
        let [a, b, c] = event.message.to_bytes();
        ptr::write(
            dst.add(count),
            RawMidi {
                frame: event.frame,
                bytes: [a, b, c, 3],
            },
        );
        count += 1;
    }
    count as u32
}

unsafe fn read_midi(src: *const RawMidi, count: usize, midi: &mut MidiBuffer, frames: u32) {
    for index in 0..count {
        let raw = ptr::read(src.add(index));
        let len = usize::from(raw.bytes[3]).min(3);
        if raw.frame >= frames {
            continue;
        }
        if let Some(message) = MidiMessage::from_bytes(&raw.bytes[..len]) {
            midi.push(MidiEvent {
                frame: raw.frame,
                message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RingLayout {
        RingLayout {
            frames: 64,
            inputs: 2,
            outputs: 2,
            params: 3,
            midi_capacity: 8,
        }
    }

    #[test]
    fn input_published_by_host_is_seen_by_sandbox() {
        let host = SharedRing::create(layout()).unwrap();
        let sandbox = SharedRing::open(host.descriptor()).unwrap();

        let mut audio = AudioBus::new(2, 64);
        audio.channel_mut(0).fill(0.5);
        audio.channel_mut(1).fill(-0.5);
        let mut midi = MidiBuffer::with_capacity(8);
        midi.push(MidiEvent {
            frame: 7,
            message: MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 90,
            },
        });
        let generation = host.publish_input(&audio, &midi, 32);
        assert_eq!(sandbox.input_generation(), generation);

        let mut seen = AudioBus::new(2, 64);
        let mut seen_midi = MidiBuffer::with_capacity(8);
        let frames = sandbox
            .read_input(generation, &mut seen, &mut seen_midi)
            .unwrap();
        assert_eq!(frames, 32);
        assert!(seen.channel(0)[..32].iter().all(|s| *s == 0.5));
        assert!(seen.channel(1)[..32].iter().all(|s| *s == -0.5));
        assert_eq!(seen_midi.events(), midi.events());
    }

    #[test]
    fn host_reads_only_the_expected_generation() {
        let host = SharedRing::create(layout()).unwrap();
        let sandbox = SharedRing::open(host.descriptor()).unwrap();
        let silent = AudioBus::new(2, 64);
        let midi = MidiBuffer::with_capacity(8);
        let generation = host.publish_input(&silent, &midi, 16);

        let mut out = AudioBus::new(2, 64);
        let mut out_midi = MidiBuffer::with_capacity(8);
        assert!(!host.read_output(generation, &mut out, &mut out_midi, 16));

        let mut rendered = AudioBus::new(2, 64);
        rendered.channel_mut(0).fill(0.25);
        sandbox.write_output(generation, &rendered, &midi, 16);
        assert!(host.read_output(generation, &mut out, &mut out_midi, 16));
        assert!(out.channel(0)[..16].iter().all(|s| *s == 0.25));
        assert!(out.channel(0)[16..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn lapped_input_is_discarded() {
        let host = SharedRing::create(layout()).unwrap();
        let sandbox = SharedRing::open(host.descriptor()).unwrap();
        let audio = AudioBus::new(2, 64);
        let midi = MidiBuffer::with_capacity(8);
        let first = host.publish_input(&audio, &midi, 8);
        host.publish_input(&audio, &midi, 8);
        host.publish_input(&audio, &midi, 8);
        let mut scratch = AudioBus::new(2, 64);
        let mut scratch_midi = MidiBuffer::with_capacity(8);
        assert!(sandbox
            .read_input(first, &mut scratch, &mut scratch_midi)
            .is_none());
    }

    #[test]
    fn params_and_status_are_shared() {
        let host = SharedRing::create(layout()).unwrap();
        let sandbox = SharedRing::open(host.descriptor()).unwrap();
        host.set_param(2, 0.75);
        assert_eq!(sandbox.param(2), Some(0.75));
        assert_eq!(sandbox.param(3), None);
        sandbox.set_status(RingStatus::Crashed);
        assert_eq!(host.status(), RingStatus::Crashed);
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let host = SharedRing::create(layout()).unwrap();
        let mut descriptor = host.descriptor().clone();
        descriptor.layout.params = 1;
        assert!(matches!(
            SharedRing::open(&descriptor),
            Err(BridgeError::Ring(_))
        ));
    }
}
