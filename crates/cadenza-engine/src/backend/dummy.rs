use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cadenza_rt::{spawn_rt_thread, AudioCallbackInfo, CallbackHandle, InterleavedAudioBuffer};
use tracing::{debug, info};

use super::{AudioBackend, BackendKind, StreamConfig};
use crate::error::BackendError;

/// Calls the engine from a plain thread at the pace of a real device, with
/// silent input and discarded output.
pub struct DummyBackend {
    config: StreamConfig,
    running: Arc<AtomicBool>,
    blocks: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl DummyBackend {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            blocks: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    /// Blocks rendered since the backend was created.
    pub fn blocks_rendered(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(self.config.block_size as f64 / f64::from(self.config.sample_rate.max(1)))
    }
}

impl AudioBackend for DummyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Dummy
    }

    fn config(&self) -> StreamConfig {
        self.config
    }

    fn start(&mut self, callback: CallbackHandle) -> Result<(), BackendError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BackendError::AlreadyRunning);
        }
        let config = self.config;
        let period = self.period();
        let running = Arc::clone(&self.running);
        let blocks = Arc::clone(&self.blocks);
        let spawned = spawn_rt_thread("cadenza-dummy".to_owned(), None, move || {
            let inputs = vec![0.0f32; config.block_size * config.input_channels];
            let mut outputs = vec![0.0f32; config.block_size * config.output_channels];
            let mut next = Instant::now();
            while running.load(Ordering::Acquire) {
                let mut buffer =
                    InterleavedAudioBuffer::new(&inputs, &mut outputs, config.output_channels, config.sample_rate)
                        .with_info(AudioCallbackInfo {
                            output_latency: Some(config.block_size as u32),
                            ..AudioCallbackInfo::default()
                        });
                callback.render(&mut buffer);
                blocks.fetch_add(1, Ordering::Relaxed);
                next += period;
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
            debug!("dummy backend thread exiting");
        });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                info!(
                    sample_rate = config.sample_rate,
                    block_size = config.block_size,
                    "dummy backend started"
                );
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| BackendError::Stream("dummy backend thread panicked".into()))?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_rt::AudioRenderer;

    struct Counter(Arc<AtomicU64>);

    impl AudioRenderer for Counter {
        fn render(&mut self, buffer: &mut InterleavedAudioBuffer<'_>) {
            assert_eq!(buffer.outputs.len(), buffer.frames * buffer.channels);
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn drives_the_callback_until_stopped() {
        let calls = Arc::new(AtomicU64::new(0));
        let config = StreamConfig {
            sample_rate: 48_000,
            block_size: 48,
            ..StreamConfig::default()
        };
        let mut backend = DummyBackend::new(config);
        backend
            .start(CallbackHandle::new(Box::new(Counter(Arc::clone(&calls)))))
            .unwrap();
        assert!(matches!(
            backend.start(CallbackHandle::new(Box::new(Counter(Arc::new(AtomicU64::new(0)))))),
            Err(BackendError::AlreadyRunning)
        ));
        std::thread::sleep(Duration::from_millis(20));
        backend.stop().unwrap();
        let seen = calls.load(Ordering::Relaxed);
        assert!(seen > 0);
        assert_eq!(seen, backend.blocks_rendered());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(calls.load(Ordering::Relaxed), seen);
    }
}
