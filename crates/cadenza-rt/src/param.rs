//! Timestamped events handed from the control domain to the audio domain.
//!
//! Writers stamp every event with the absolute engine frame at which it takes
//! effect. The audio thread drains the queue once at the start of each cycle
//! and applies every event that falls before the end of that cycle. Events
//! scheduled for a later cycle are parked in a buffer that is allocated once
//! when the queue is created.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::queue::QueueError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedEvent<T> {
    /// Absolute engine frame at which the event applies.
    pub frame: u64,
    pub payload: T,
}

struct Shared<T> {
    queue: ArrayQueue<TimedEvent<T>>,
    dropped: AtomicU64,
}

/// Control-side handle. Cheap to clone.
pub struct TimedEventWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TimedEventWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Audio-side handle. Owned by exactly one consumer.
pub struct TimedEventReader<T> {
    shared: Arc<Shared<T>>,
    pending: Vec<TimedEvent<T>>,
}

pub fn timed_event_queue<T>(capacity: usize) -> (TimedEventWriter<T>, TimedEventReader<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity),
        dropped: AtomicU64::new(0),
    });
    (
        TimedEventWriter {
            shared: Arc::clone(&shared),
        },
        TimedEventReader {
            shared,
            pending: Vec::with_capacity(capacity),
        },
    )
}

impl<T> TimedEventWriter<T> {
    pub fn push(&self, frame: u64, payload: T) -> Result<(), QueueError> {
        self.shared
            .queue
            .push(TimedEvent { frame, payload })
            .map_err(|_| {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                QueueError::Full
            })
    }

    /// Number of events rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Copy> TimedEventReader<T> {
    /// Applies every event that takes effect before `cycle_end`, in the order
    /// the events were written. Returns the number of events applied.
    pub fn drain_until(&mut self, cycle_end: u64, mut apply: impl FnMut(TimedEvent<T>)) -> usize {
        let mut applied = 0;
        self.pending.retain(|event| {
            if event.frame < cycle_end {
                apply(*event);
                applied += 1;
                false
            } else {
                true
            }
        });

        while let Some(event) = self.shared.queue.pop() {
            if event.frame < cycle_end || self.pending.len() == self.pending.capacity() {
                apply(event);
                applied += 1;
            } else {
                self.pending.push(event);
            }
        }
        applied
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forgets parked events, used after the playhead jumps.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_events_wait_for_their_cycle() {
        let (writer, mut reader) = timed_event_queue::<f32>(8);
        writer.push(10, 0.25).unwrap();
        writer.push(600, 0.75).unwrap();

        let mut seen = Vec::new();
        assert_eq!(reader.drain_until(512, |e| seen.push(e.payload)), 1);
        assert_eq!(seen, vec![0.25]);
        assert_eq!(reader.pending(), 1);

        assert_eq!(reader.drain_until(1024, |e| seen.push(e.payload)), 1);
        assert_eq!(seen, vec![0.25, 0.75]);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn past_events_apply_immediately() {
        let (writer, mut reader) = timed_event_queue::<u8>(4);
        writer.push(0, 1).unwrap();
        let mut count = 0;
        reader.drain_until(4096, |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn full_queue_counts_drops() {
        let (writer, _reader) = timed_event_queue::<u8>(1);
        writer.push(0, 1).unwrap();
        assert_eq!(writer.push(0, 2), Err(QueueError::Full));
        assert_eq!(writer.dropped(), 1);
    }
}
