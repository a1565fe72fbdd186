//! Ready-made sources.
//!
//! Both sources wait on the shared rate limiter before each emission and
//! exit as soon as the pipeline is cancelled.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::queue::Sender;
use crate::rate::RateLimiter;
use crate::stage::Source;

/// A source where every worker emits the items of its own iterator.
///
/// The factory is called once per worker, so a stage with `n` workers emits
/// the sequence `n` times.
pub struct IterSource<F> {
    factory: F,
}

impl<F> IterSource<F> {
    /// Create a source from an iterator factory
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<T, F, I> Source<T> for IterSource<F>
where
    T: Send + 'static,
    F: Fn() -> I + Send + Sync,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send,
{
    async fn run(&self, cancel: CancellationToken, output: Sender<T>, limiter: RateLimiter) {
        for item in (self.factory)() {
            if !limiter.admit(&cancel).await {
                return;
            }
            if output.send(item).await.is_err() {
                tracing::warn!(queue = %output.queue().name(), "input queue closed under a running source");
                return;
            }
        }
    }
}

/// A source whose workers share a single iterator.
///
/// Every item is emitted exactly once no matter how many workers the stage
/// runs.
pub struct SharedIterSource<I> {
    items: Mutex<I>,
}

impl<I: Iterator> SharedIterSource<I> {
    /// Create a source draining `items`
    pub fn new(items: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            items: Mutex::new(items.into_iter()),
        }
    }

    fn next_item(&self) -> Option<I::Item> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).next()
    }
}

#[async_trait]
impl<T, I> Source<T> for SharedIterSource<I>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send,
{
    async fn run(&self, cancel: CancellationToken, output: Sender<T>, limiter: RateLimiter) {
        loop {
            if !limiter.admit(&cancel).await {
                return;
            }
            let Some(item) = self.next_item() else {
                return;
            };
            if output.send(item).await.is_err() {
                tracing::warn!(queue = %output.queue().name(), "input queue closed under a running source");
                return;
            }
        }
    }
}
