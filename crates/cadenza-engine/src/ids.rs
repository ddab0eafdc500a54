//! Stable identifiers of project objects.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

object_id!(TrackId, "track");
object_id!(RegionId, "region");
object_id!(PluginId, "plugin");
object_id!(SendId, "send");
object_id!(ClipId, "clip");
object_id!(
    /// Identity of a MIDI note inside its region.
    NoteId,
    "note"
);

/// Any object an action can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Track(TrackId),
    Region(RegionId),
    Plugin(PluginId),
    Send(SendId),
    Clip(ClipId),
    Note(NoteId),
}

/// Hands out identifiers. Persisted with the project so ids are never
/// reused across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    next_track: u32,
    next_region: u32,
    next_plugin: u32,
    next_send: u32,
    next_clip: u32,
    next_note: u32,
}

macro_rules! allocate {
    ($method:ident, $field:ident, $ty:ident) => {
        pub fn $method(&mut self) -> $ty {
            let id = $ty(self.$field);
            self.$field = self.$field.wrapping_add(1);
            id
        }
    };
}

impl IdAllocator {
    allocate!(track, next_track, TrackId);
    allocate!(region, next_region, RegionId);
    allocate!(plugin, next_plugin, PluginId);
    allocate!(send, next_send, SendId);
    allocate!(clip, next_clip, ClipId);
    allocate!(note, next_note, NoteId);

    /// Moves every counter past ids already present in a loaded project.
    pub(crate) fn observe_track(&mut self, id: TrackId) {
        self.next_track = self.next_track.max(id.0 + 1);
    }

    pub(crate) fn observe_region(&mut self, id: RegionId) {
        self.next_region = self.next_region.max(id.0 + 1);
    }

    pub(crate) fn observe_plugin(&mut self, id: PluginId) {
        self.next_plugin = self.next_plugin.max(id.0 + 1);
    }

    pub(crate) fn observe_send(&mut self, id: SendId) {
        self.next_send = self.next_send.max(id.0 + 1);
    }

    pub(crate) fn observe_clip(&mut self, id: ClipId) {
        self.next_clip = self.next_clip.max(id.0 + 1);
    }

    pub(crate) fn observe_note(&mut self, id: NoteId) {
        self.next_note = self.next_note.max(id.0 + 1);
    }
}
