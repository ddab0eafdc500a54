use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

/// Point-in-time view of the audio thread counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioMetrics {
    pub cycles: u64,
    pub frames_processed: u64,
    pub xruns: u64,
    pub node_crashes: u64,
    pub last_cycle_ns: u64,
    pub max_cycle_ns: u64,
}

/// Counters written by the audio thread and read by the control domain.
#[derive(Clone)]
pub struct AudioMetricsCollector {
    inner: Arc<AudioMetricsInner>,
}

impl AudioMetricsCollector {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(AudioMetricsInner {
                cycles: AtomicU64::new(0),
                frames_processed: AtomicU64::new(0),
                xruns: AtomicU64::new(0),
                node_crashes: AtomicU64::new(0),
                last_cycle_ns: AtomicU64::new(0),
                max_cycle_ns: AtomicU64::new(0),
                history: ArrayQueue::new(history_capacity.max(16)),
            }),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> AudioMetrics {
        let inner = &self.inner;
        AudioMetrics {
            cycles: inner.cycles.load(Ordering::Relaxed),
            frames_processed: inner.frames_processed.load(Ordering::Relaxed),
            xruns: inner.xruns.load(Ordering::Relaxed),
            node_crashes: inner.node_crashes.load(Ordering::Relaxed),
            last_cycle_ns: inner.last_cycle_ns.load(Ordering::Relaxed),
            max_cycle_ns: inner.max_cycle_ns.load(Ordering::Relaxed),
        }
    }

    /// Records a completed cycle of `frames` frames that took `duration`.
    #[inline]
    pub fn record_cycle(&self, frames: usize, duration: Duration) {
        let nanos = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.inner.cycles.fetch_add(1, Ordering::Relaxed);
        self.inner
            .frames_processed
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.inner.last_cycle_ns.store(nanos, Ordering::Relaxed);
        self.inner.update_max(nanos);
        self.inner.history.force_push(self.snapshot());
    }

    #[inline]
    pub fn register_xrun(&self) {
        self.inner.xruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn register_crash(&self) {
        self.inner.node_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn xruns(&self) -> u64 {
        self.inner.xruns.load(Ordering::Relaxed)
    }

    pub fn drain_history(&self) -> Vec<AudioMetrics> {
        let mut metrics = Vec::with_capacity(self.inner.history.len());
        while let Some(entry) = self.inner.history.pop() {
            metrics.push(entry);
        }
        metrics
    }

    pub fn reset(&self) {
        let inner = &self.inner;
        inner.cycles.store(0, Ordering::Relaxed);
        inner.frames_processed.store(0, Ordering::Relaxed);
        inner.xruns.store(0, Ordering::Relaxed);
        inner.node_crashes.store(0, Ordering::Relaxed);
        inner.last_cycle_ns.store(0, Ordering::Relaxed);
        inner.max_cycle_ns.store(0, Ordering::Relaxed);
        while inner.history.pop().is_some() {}
    }
}

impl Default for AudioMetricsCollector {
    fn default() -> Self {
        Self::new(64)
    }
}

struct AudioMetricsInner {
    cycles: AtomicU64,
    frames_processed: AtomicU64,
    xruns: AtomicU64,
    node_crashes: AtomicU64,
    last_cycle_ns: AtomicU64,
    max_cycle_ns: AtomicU64,
    history: ArrayQueue<AudioMetrics>,
}

impl AudioMetricsInner {
    #[inline]
    fn update_max(&self, candidate: u64) {
        let mut current = self.max_cycle_ns.load(Ordering::Relaxed);
        while candidate > current {
            match self.max_cycle_ns.compare_exchange_weak(
                current,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(previous) => current = previous,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_cycles_and_frames() {
        let metrics = AudioMetricsCollector::new(4);
        for _ in 0..3 {
            metrics.record_cycle(512, Duration::from_micros(100));
        }
        metrics.register_xrun();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles, 3);
        assert_eq!(snapshot.frames_processed, 1536);
        assert_eq!(snapshot.xruns, 1);
        assert_eq!(snapshot.max_cycle_ns, 100_000);
    }

    #[test]
    fn history_keeps_latest_entries() {
        let metrics = AudioMetricsCollector::new(16);
        for _ in 0..20 {
            metrics.record_cycle(64, Duration::from_nanos(10));
        }
        let history = metrics.drain_history();
        assert_eq!(history.len(), 16);
        assert_eq!(history.last().map(|m| m.cycles), Some(20));
        metrics.reset();
        assert_eq!(metrics.snapshot(), AudioMetrics::default());
    }
}
