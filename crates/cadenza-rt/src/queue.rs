//! Bounded lock-free queues for control and audio threads.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
}

/// A bounded lock-free queue. All storage is allocated up front so pushes and
/// pops are safe to perform from the audio thread.
pub struct EventQueue<T> {
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), QueueError> {
        self.queue.push(value).map_err(|_| QueueError::Full)
    }

    /// Pushes a value, discarding the oldest entry when the queue is full.
    pub fn force_push(&self, value: T) -> Option<T> {
        self.queue.force_push(value)
    }

    pub fn try_pop(&self) -> Result<T, QueueError> {
        self.queue.pop().ok_or(QueueError::Empty)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_full_and_empty() {
        let queue = EventQueue::new(2);
        assert_eq!(queue.try_pop(), Err(QueueError::Empty));
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_push(3), Err(QueueError::Full));
        assert_eq!(queue.try_pop(), Ok(1));
    }

    #[test]
    fn force_push_drops_oldest() {
        let queue = EventQueue::new(2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.force_push(3), Some(1));
        assert_eq!(queue.try_pop(), Ok(2));
        assert_eq!(queue.try_pop(), Ok(3));
    }
}
