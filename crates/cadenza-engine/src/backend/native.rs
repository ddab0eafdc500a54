//! Device I/O through cpal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadenza_rt::{AudioCallbackInfo, CallbackHandle, InterleavedAudioBuffer};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{AudioBackend, BackendKind, BackendLatency, StreamConfig};
use crate::error::BackendError;

pub struct CpalBackend {
    device: cpal::Device,
    config: StreamConfig,
    stream: Option<cpal::Stream>,
    running: Arc<AtomicBool>,
}

impl CpalBackend {
    /// Opens the default output device of the default host.
    pub fn new(config: StreamConfig) -> Result<Self, BackendError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| BackendError::Device("no default output device".into()))?;
        Ok(Self {
            device,
            config,
            stream: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    fn stream_config(&self) -> Result<cpal::StreamConfig, BackendError> {
        let wanted_channels = self.config.output_channels as u16;
        let wanted_rate = cpal::SampleRate(self.config.sample_rate);
        let supported = self
            .device
            .supported_output_configs()
            .map_err(|err| BackendError::Device(err.to_string()))?
            .find(|range| {
                range.channels() == wanted_channels
                    && range.min_sample_rate() <= wanted_rate
                    && range.max_sample_rate() >= wanted_rate
            })
            .ok_or_else(|| {
                BackendError::Device(format!(
                    "{} channel(s) at {} Hz not supported",
                    wanted_channels, self.config.sample_rate
                ))
            })?;
        let mut config = supported.with_sample_rate(wanted_rate).config();
        config.buffer_size = cpal::BufferSize::Fixed(self.config.block_size as u32);
        Ok(config)
    }
}

impl AudioBackend for CpalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpal
    }

    fn config(&self) -> StreamConfig {
        self.config
    }

    fn start(&mut self, callback: CallbackHandle) -> Result<(), BackendError> {
        if self.stream.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        let config = self.stream_config()?;
        let channels = usize::from(config.channels);
        let sample_rate = config.sample_rate.0;
        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let timestamp = info.timestamp();
                    let output_latency = timestamp
                        .playback
                        .duration_since(&timestamp.callback)
                        .map(|ahead| (ahead.as_secs_f64() * f64::from(sample_rate)) as u32);
                    let mut buffer = InterleavedAudioBuffer::new(&[], data, channels, sample_rate).with_info(
                        AudioCallbackInfo {
                            output_latency,
                            ..AudioCallbackInfo::default()
                        },
                    );
                    callback.render(&mut buffer);
                },
                |err| tracing::error!("cpal stream error: {err}"),
                None,
            )
            .map_err(|err| BackendError::Stream(err.to_string()))?;
        stream
            .play()
            .map_err(|err| BackendError::Stream(err.to_string()))?;
        self.stream = Some(stream);
        self.running.store(true, Ordering::Release);
        tracing::info!(device = ?self.device.name().ok(), "cpal backend started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.running.store(false, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|err| BackendError::Stream(err.to_string()))?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn latency(&self) -> BackendLatency {
        BackendLatency {
            input: 0,
            output: self.config.block_size as u32,
        }
    }
}
