//! Real-time primitives shared across the Cadenza audio engine.

pub mod callback;
pub mod meter;
pub mod metrics;
pub mod param;
pub mod queue;
pub mod snapshot;
pub mod thread;

pub use callback::{AudioCallbackInfo, AudioRenderer, CallbackHandle, InterleavedAudioBuffer};
pub use meter::{MeterCell, MeterReading};
pub use metrics::{AudioMetrics, AudioMetricsCollector};
pub use param::{timed_event_queue, TimedEvent, TimedEventReader, TimedEventWriter};
pub use queue::{EventQueue, QueueError};
pub use snapshot::SnapshotCell;
pub use thread::{enable_ftz_daz, lock_memory, request_realtime_priority, spawn_rt_thread, RtError};
