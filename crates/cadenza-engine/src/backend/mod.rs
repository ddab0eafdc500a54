//! Audio device backends.
//!
//! A backend drives the engine's [`CallbackHandle`] from its own thread. The
//! engine registers one handle per stream; audio and MIDI both go through
//! it.

pub mod dummy;

#[cfg(feature = "native")]
pub mod native;

use cadenza_rt::CallbackHandle;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use dummy::DummyBackend;

use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Jack,
    Cpal,
    Pulse,
    /// Timer-driven, no device.
    #[default]
    Dummy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 512,
            input_channels: 2,
            output_channels: 2,
        }
    }
}

/// Device latency in frames, as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendLatency {
    pub input: u32,
    pub output: u32,
}

pub trait AudioBackend: Send {
    fn kind(&self) -> BackendKind;

    fn config(&self) -> StreamConfig;

    /// Starts calling `callback` once per block.
    fn start(&mut self, callback: CallbackHandle) -> Result<(), BackendError>;

    /// Stops the stream. The block in flight completes first.
    fn stop(&mut self) -> Result<(), BackendError>;

    fn is_running(&self) -> bool;

    fn latency(&self) -> BackendLatency {
        BackendLatency::default()
    }
}

/// Opens a backend of the requested kind.
pub fn open_backend(kind: BackendKind, config: StreamConfig) -> Result<Box<dyn AudioBackend>, BackendError> {
    match kind {
        BackendKind::Dummy => Ok(Box::new(DummyBackend::new(config))),
        BackendKind::Cpal => open_cpal(config),
        BackendKind::Jack => Err(BackendError::Unavailable {
            kind,
            reason: "no JACK client binding in this build".into(),
        }),
        BackendKind::Pulse => Err(BackendError::Unavailable {
            kind,
            reason: "no PulseAudio client binding in this build".into(),
        }),
    }
}

#[cfg(feature = "native")]
fn open_cpal(config: StreamConfig) -> Result<Box<dyn AudioBackend>, BackendError> {
    Ok(Box::new(native::CpalBackend::new(config)?))
}

#[cfg(not(feature = "native"))]
fn open_cpal(_config: StreamConfig) -> Result<Box<dyn AudioBackend>, BackendError> {
    Err(BackendError::FeatureDisabled(BackendKind::Cpal))
}

/// Opens `kind`, falling back to the dummy backend when it cannot be used.
pub fn open_with_fallback(kind: BackendKind, config: StreamConfig) -> Box<dyn AudioBackend> {
    match open_backend(kind, config) {
        Ok(backend) => backend,
        Err(err) => {
            warn!(?kind, %err, "audio backend unavailable, using the dummy backend");
            Box::new(DummyBackend::new(config))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_backends_fail_with_a_typed_error() {
        for kind in [BackendKind::Jack, BackendKind::Pulse] {
            match open_backend(kind, StreamConfig::default()) {
                Err(BackendError::Unavailable { kind: failed, .. }) => assert_eq!(failed, kind),
                Err(other) => panic!("unexpected error {other}"),
                Ok(_) => panic!("{kind:?} should not open"),
            }
        }
    }

    #[test]
    fn fallback_is_the_dummy_backend() {
        let backend = open_with_fallback(BackendKind::Jack, StreamConfig::default());
        assert_eq!(backend.kind(), BackendKind::Dummy);
        assert!(!backend.is_running());
    }

    #[cfg(not(feature = "native"))]
    #[test]
    fn cpal_requires_the_native_feature() {
        assert!(matches!(
            open_backend(BackendKind::Cpal, StreamConfig::default()),
            Err(BackendError::FeatureDisabled(BackendKind::Cpal))
        ));
    }
}
