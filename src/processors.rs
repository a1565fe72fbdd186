//! Ready-made processors.
//!
//! Each one drains its input until the queue is closed and empty, which is
//! how shutdown reaches process stages.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::queue::{Receiver, Sender};
use crate::stage::Processor;

/// Forwards every item unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProcessor;

#[async_trait]
impl<T: Send + 'static> Processor<T> for NoOpProcessor {
    async fn run(&self, _cancel: CancellationToken, input: Receiver<T>, output: Sender<T>) {
        while let Some(item) = input.recv().await {
            if !forward(&output, item).await {
                return;
            }
        }
    }
}

/// Applies a function to each item
pub struct MapProcessor<F> {
    f: F,
}

impl<F> MapProcessor<F> {
    /// Create a new map processor
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<T, F> Processor<T> for MapProcessor<F>
where
    T: Send + 'static,
    F: Fn(T) -> T + Send + Sync,
{
    async fn run(&self, _cancel: CancellationToken, input: Receiver<T>, output: Sender<T>) {
        while let Some(item) = input.recv().await {
            if !forward(&output, (self.f)(item)).await {
                return;
            }
        }
    }
}

/// Only forwards items matching a predicate
pub struct FilterProcessor<F> {
    predicate: F,
}

impl<F> FilterProcessor<F> {
    /// Create a new filter processor
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

#[async_trait]
impl<T, F> Processor<T> for FilterProcessor<F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync,
{
    async fn run(&self, _cancel: CancellationToken, input: Receiver<T>, output: Sender<T>) {
        while let Some(item) = input.recv().await {
            if !(self.predicate)(&item) {
                continue;
            }
            if !forward(&output, item).await {
                return;
            }
        }
    }
}

async fn forward<T>(output: &Sender<T>, item: T) -> bool {
    match output.send(item).await {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!(queue = %output.queue().name(), "output queue closed under a running processor");
            false
        }
    }
}
