//! MIDI events as carried by MIDI ports.

use serde::{Deserialize, Serialize};

/// Default number of events a MIDI port can hold per cycle.
pub const DEFAULT_MIDI_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    PitchBend { channel: u8, value: u16 },
    AllNotesOff { channel: u8 },
}

impl MidiMessage {
    /// Parses a short channel message. Note-on with velocity zero is read as
    /// note-off.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;
        let channel = status & 0x0F;
        let data = |index: usize| bytes.get(index).map(|b| b & 0x7F);
        match status & 0xF0 {
            0x80 => Some(Self::NoteOff {
                channel,
                note: data(1)?,
                velocity: data(2)?,
            }),
            0x90 => {
                let note = data(1)?;
                let velocity = data(2)?;
                if velocity == 0 {
                    Some(Self::NoteOff {
                        channel,
                        note,
                        velocity: 0,
                    })
                } else {
                    Some(Self::NoteOn {
                        channel,
                        note,
                        velocity,
                    })
                }
            }
            0xB0 => {
                let controller = data(1)?;
                let value = data(2)?;
                if controller == 123 {
                    Some(Self::AllNotesOff { channel })
                } else {
                    Some(Self::ControlChange {
                        channel,
                        controller,
                        value,
                    })
                }
            }
            0xE0 => {
                let lsb = u16::from(data(1)?);
                let msb = u16::from(data(2)?);
                Some(Self::PitchBend {
                    channel,
                    value: (msb << 7) | lsb,
                })
            }
            _ => None,
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        match self {
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => [0x90 | (channel & 0x0F), note, velocity],
            Self::NoteOff {
                channel,
                note,
                velocity,
            } => [0x80 | (channel & 0x0F), note, velocity],
            Self::ControlChange {
                channel,
                controller,
                value,
            } => [0xB0 | (channel & 0x0F), controller, value],
            Self::PitchBend { channel, value } => [
                0xE0 | (channel & 0x0F),
                (value & 0x7F) as u8,
                ((value >> 7) & 0x7F) as u8,
            ],
            Self::AllNotesOff { channel } => [0xB0 | (channel & 0x0F), 123, 0],
        }
    }

    pub fn channel(self) -> u8 {
        match self {
            Self::NoteOn { channel, .. }
            | Self::NoteOff { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::PitchBend { channel, .. }
            | Self::AllNotesOff { channel } => channel,
        }
    }
}

/// A MIDI message positioned inside the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    /// Frame offset from the start of the block.
    pub frame: u32,
    pub message: MidiMessage,
}

/// Fixed-capacity, frame-ordered list of MIDI events.
///
/// Storage is reserved at construction. Pushing beyond the capacity drops the
/// event and bumps the overflow counter instead of allocating.
#[derive(Debug, Clone)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
    overflowed: u32,
}

impl MidiBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity.max(1)),
            overflowed: 0,
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.overflowed = 0;
    }

    /// Removes events in `[start, end)` only.
    pub fn clear_range(&mut self, start: u32, end: u32) {
        self.events
            .retain(|event| event.frame < start || event.frame >= end);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn overflowed(&self) -> u32 {
        self.overflowed
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &MidiEvent> {
        self.events.iter()
    }

    /// Inserts after every event with the same or an earlier frame, which
    /// keeps equal-frame events in arrival order.
    pub fn push(&mut self, event: MidiEvent) -> bool {
        if self.events.len() == self.events.capacity() {
            self.overflowed = self.overflowed.saturating_add(1);
            return false;
        }
        let at = self
            .events
            .partition_point(|existing| existing.frame <= event.frame);
        self.events.insert(at, event);
        true
    }

    /// Merges the events of `other` that fall in `[start, end)`, keeping
    /// events already present ahead of incoming ones on equal frames.
    pub fn merge_range(&mut self, other: &MidiBuffer, start: u32, end: u32) {
        for event in other.events.iter() {
            if event.frame >= start && event.frame < end {
                self.push(*event);
            }
        }
    }
}

impl Default for MidiBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MIDI_CAPACITY)
    }
}
