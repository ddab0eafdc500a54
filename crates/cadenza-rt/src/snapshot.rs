//! Double-buffered publication of immutable snapshots.

use arc_swap::{ArcSwap, Guard};
use std::sync::Arc;

/// Single-writer, multi-reader snapshot slot.
///
/// The control domain publishes a fully built value; readers on the audio
/// thread observe either the previous or the new value, never a partial one.
/// [`SnapshotCell::publish`] hands the previous value back so the writer, not
/// the audio thread, decides when it is dropped.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    current: ArcSwap<T>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
        }
    }

    #[inline]
    pub fn load(&self) -> Guard<Arc<T>> {
        self.current.load()
    }

    pub fn load_full(&self) -> Arc<T> {
        self.current.load_full()
    }

    pub fn publish(&self, value: Arc<T>) -> Arc<T> {
        self.current.swap(value)
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
