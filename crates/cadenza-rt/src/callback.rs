//! The boundary between an audio backend and the engine renderer.
//!
//! A backend wraps each device period in an [`InterleavedAudioBuffer`] and
//! passes it to [`CallbackHandle::render`]. The handle never blocks: when the
//! renderer is unavailable the period is silenced and counted as an xrun.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::metrics::AudioMetricsCollector;

/// Audio callback metadata supplied by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioCallbackInfo {
    /// Presentation timestamp in nanoseconds if available.
    pub timestamp_ns: Option<u64>,
    /// Host provided capture latency in samples.
    pub input_latency: Option<u32>,
    /// Host provided playback latency in samples.
    pub output_latency: Option<u32>,
}

/// One device period. `outputs` holds `frames * channels` interleaved
/// samples; `inputs` is interleaved with the device's own input channel
/// count and may be empty.
pub struct InterleavedAudioBuffer<'a> {
    pub inputs: &'a [f32],
    pub outputs: &'a mut [f32],
    pub channels: usize,
    pub frames: usize,
    pub sample_rate: u32,
    pub info: AudioCallbackInfo,
}

impl<'a> InterleavedAudioBuffer<'a> {
    /// The frame count follows from the output length.
    pub fn new(inputs: &'a [f32], outputs: &'a mut [f32], channels: usize, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        Self {
            frames: outputs.len() / channels,
            inputs,
            outputs,
            channels,
            sample_rate,
            info: AudioCallbackInfo::default(),
        }
    }

    pub fn with_info(mut self, info: AudioCallbackInfo) -> Self {
        self.info = info;
        self
    }

    pub fn silence(&mut self) {
        self.outputs.fill(0.0);
    }
}

/// Implemented by the engine side of the audio callback.
pub trait AudioRenderer: Send {
    fn render(&mut self, buffer: &mut InterleavedAudioBuffer<'_>);

    /// Raw MIDI bytes delivered by the backend with their frame offset.
    fn midi_in(&mut self, _frame: u32, _bytes: &[u8]) {}
}

const UNREPORTED: u32 = u32::MAX;

#[derive(Debug)]
struct ReportedLatency {
    input: AtomicU32,
    output: AtomicU32,
}

impl ReportedLatency {
    fn record(&self, info: &AudioCallbackInfo) {
        if let Some(input) = info.input_latency {
            self.input.store(input.min(UNREPORTED - 1), Ordering::Relaxed);
        }
        if let Some(output) = info.output_latency {
            self.output.store(output.min(UNREPORTED - 1), Ordering::Relaxed);
        }
    }

    fn load(cell: &AtomicU32) -> Option<u32> {
        match cell.load(Ordering::Relaxed) {
            UNREPORTED => None,
            value => Some(value),
        }
    }
}

/// A handle shared with backends for triggering real-time processing.
#[derive(Clone)]
pub struct CallbackHandle {
    renderer: Arc<Mutex<Box<dyn AudioRenderer>>>,
    metrics: Option<AudioMetricsCollector>,
    latency: Arc<ReportedLatency>,
}

impl CallbackHandle {
    pub fn new(renderer: Box<dyn AudioRenderer>) -> Self {
        Self {
            renderer: Arc::new(Mutex::new(renderer)),
            metrics: None,
            latency: Arc::new(ReportedLatency {
                input: AtomicU32::new(UNREPORTED),
                output: AtomicU32::new(UNREPORTED),
            }),
        }
    }

    /// Periods that could not be rendered are counted here.
    pub fn with_metrics(mut self, metrics: AudioMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn render(&self, buffer: &mut InterleavedAudioBuffer<'_>) {
        self.latency.record(&buffer.info);
        match self.renderer.try_lock() {
            Some(mut renderer) => renderer.render(buffer),
            None => {
                buffer.silence();
                if let Some(metrics) = &self.metrics {
                    metrics.register_xrun();
                }
            }
        }
    }

    /// Dropped when the renderer is busy.
    pub fn midi_in(&self, frame: u32, bytes: &[u8]) {
        if let Some(mut renderer) = self.renderer.try_lock() {
            renderer.midi_in(frame, bytes);
        }
    }

    /// Input and output latency in samples from the most recent period that
    /// carried them.
    pub fn reported_latency(&self) -> (Option<u32>, Option<u32>) {
        (
            ReportedLatency::load(&self.latency.input),
            ReportedLatency::load(&self.latency.output),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(f32);

    impl AudioRenderer for Constant {
        fn render(&mut self, buffer: &mut InterleavedAudioBuffer<'_>) {
            buffer.outputs.fill(self.0);
        }
    }

    #[test]
    fn frames_follow_the_output_length() {
        let mut out = vec![0.0f32; 10];
        let buffer = InterleavedAudioBuffer::new(&[], &mut out, 2, 48_000);
        assert_eq!(buffer.frames, 5);
        let buffer = InterleavedAudioBuffer::new(&[], &mut out, 0, 48_000);
        assert_eq!((buffer.channels, buffer.frames), (1, 10));
    }

    #[test]
    fn contended_renderer_yields_silence_and_an_xrun() {
        let metrics = AudioMetricsCollector::default();
        let handle = CallbackHandle::new(Box::new(Constant(0.5))).with_metrics(metrics.clone());
        let mut out = vec![1.0f32; 8];

        handle.render(&mut InterleavedAudioBuffer::new(&[], &mut out, 2, 48_000));
        assert!(out.iter().all(|s| *s == 0.5));

        let guard = handle.renderer.lock();
        handle.render(&mut InterleavedAudioBuffer::new(&[], &mut out, 2, 48_000));
        drop(guard);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(metrics.xruns(), 1);
    }

    #[test]
    fn latency_is_kept_from_the_last_report() {
        let handle = CallbackHandle::new(Box::new(Constant(0.0)));
        assert_eq!(handle.reported_latency(), (None, None));
        let mut out = vec![0.0f32; 4];
        let info = AudioCallbackInfo {
            output_latency: Some(256),
            ..AudioCallbackInfo::default()
        };
        handle.render(&mut InterleavedAudioBuffer::new(&[], &mut out, 2, 48_000).with_info(info));
        handle.render(&mut InterleavedAudioBuffer::new(&[], &mut out, 2, 48_000));
        assert_eq!(handle.reported_latency(), (None, Some(256)));
    }
}
