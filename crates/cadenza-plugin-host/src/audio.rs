/// Planar audio scratch buffers handed to plugin adapters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBus {
    channels: Vec<Vec<f32>>,
}

impl AudioBus {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| vec![0.0; frames]).collect(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        self.channels
            .get_mut(index)
            .map(Vec::as_mut_slice)
            .unwrap_or(&mut [])
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.channels.iter_mut().map(Vec::as_mut_slice)
    }

    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }

    /// Copies the first `frames` frames of every channel from `other`.
    pub fn copy_from(&mut self, other: &AudioBus, frames: usize) {
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            let n = frames.min(dst.len()).min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
    }
}
