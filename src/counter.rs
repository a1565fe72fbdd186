//! Completion counting for queue writers.
//!
//! A queue may only be closed once nothing can write to it anymore. Each
//! writer owns a [`CloseGuard`]; the guard that brings the shared
//! [`CompletionCounter`] to zero is the one that closes the queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::queue::Queue;

/// Lock-free count of writers still feeding a queue.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    active: AtomicUsize,
}

impl CompletionCounter {
    /// Create a counter with `active` registered writers
    pub fn new(active: usize) -> Self {
        Self {
            active: AtomicUsize::new(active),
        }
    }

    /// Register `n` more writers
    pub fn add(&self, n: usize) {
        self.active.fetch_add(n, Ordering::AcqRel);
    }

    /// Number of writers still registered
    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Deregister one writer.
    ///
    /// Returns `true` only for the call that brings the count to zero. The
    /// count never wraps below zero.
    pub fn done(&self) -> bool {
        match self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                tracing::warn!("completion counter released more times than registered");
                false
            }
        }
    }
}

/// A registered writer of a queue.
///
/// Dropping the guard deregisters the writer and closes the queue if it was
/// the last one. Dropping also happens while unwinding, so a panicking
/// callback still releases its downstream queue.
pub struct CloseGuard<T> {
    queue: Queue<T>,
    counter: Arc<CompletionCounter>,
}

impl<T> CloseGuard<T> {
    /// Wrap a writer that has already been counted in `counter`
    pub(crate) fn new(queue: Queue<T>, counter: Arc<CompletionCounter>) -> Self {
        Self { queue, counter }
    }
}

impl<T> std::fmt::Debug for CloseGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseGuard")
            .field("queue", &self.queue.name())
            .field("remaining", &self.counter.count())
            .finish()
    }
}

impl<T> Drop for CloseGuard<T> {
    fn drop(&mut self) {
        if !self.counter.done() {
            return;
        }
        if let Err(e) = self.queue.close() {
            tracing::error!(queue = %self.queue.name(), error = %e, "queue close protocol violated");
        }
    }
}
