//! Values usable only on the thread that created them

use std::mem::ManuallyDrop;
use std::thread::{self, ThreadId};
use tracing::warn;

/// Wraps a `!Send` value so the wrapper can cross threads while the value
/// itself is only ever touched on its owning thread
///
/// Dropping the wrapper elsewhere leaks the value instead of running its
/// destructor on the wrong thread.
pub(crate) struct ThreadBound<T> {
    owner: ThreadId,
    value: ManuallyDrop<T>,
}

// SAFETY: the value is only reachable through `get`, which checks the thread
unsafe impl<T> Send for ThreadBound<T> {}
unsafe impl<T> Sync for ThreadBound<T> {}

impl<T> ThreadBound<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            owner: thread::current().id(),
            value: ManuallyDrop::new(value),
        }
    }

    pub(crate) fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// The value, on the owning thread only
    pub(crate) fn get(&self) -> Option<&T> {
        self.is_owner().then(|| &*self.value)
    }
}

impl<T> Drop for ThreadBound<T> {
    fn drop(&mut self) {
        if self.is_owner() {
            // SAFETY: dropped exactly once, here
            unsafe { ManuallyDrop::drop(&mut self.value) };
        } else {
            warn!(
                owner = ?self.owner,
                "Thread-bound value dropped off its owning thread; leaking it"
            );
        }
    }
}
