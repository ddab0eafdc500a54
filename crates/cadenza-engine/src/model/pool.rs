use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ids::ClipId;

/// Planar audio referenced by audio regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioClip {
    pub id: ClipId,
    pub name: String,
    pub sample_rate: u32,
    pub channels: Arc<Vec<Vec<f32>>>,
}

impl AudioClip {
    pub fn new(id: ClipId, name: impl Into<String>, sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            id,
            name: name.into(),
            sample_rate,
            channels: Arc::new(channels),
        }
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Sample of `channel` at `frame`, mono clips feeding every channel.
    pub fn sample(&self, channel: usize, frame: usize) -> f32 {
        let source = if self.channels.len() == 1 { 0 } else { channel };
        self.channels
            .get(source)
            .and_then(|samples| samples.get(frame))
            .copied()
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioPool {
    clips: BTreeMap<ClipId, AudioClip>,
}

impl AudioPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn get(&self, id: ClipId) -> Option<&AudioClip> {
        self.clips.get(&id)
    }

    pub fn contains(&self, id: ClipId) -> bool {
        self.clips.contains_key(&id)
    }

    /// Adds or replaces a clip, returning the previous one.
    pub fn insert(&mut self, clip: AudioClip) -> Option<AudioClip> {
        self.clips.insert(clip.id, clip)
    }

    pub fn remove(&mut self, id: ClipId) -> Option<AudioClip> {
        self.clips.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioClip> {
        self.clips.values()
    }
}
