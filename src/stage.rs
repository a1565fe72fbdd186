//! Stage nodes and the callback traits they run.
//!
//! A pipeline is an ordered list of stages. An input stage runs a
//! [`Source`] in each of its workers, all writing into the pipeline's shared
//! input queue. A process stage runs a [`Processor`] in each worker, reading
//! from the previous stage's queue and writing into its own.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::counter::{CloseGuard, CompletionCounter};
use crate::queue::{Queue, Receiver, Sender};
use crate::rate::RateLimiter;

/// Which role a stage plays in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum StageKind {
    /// Generates new items into the shared input queue
    Input,
    /// Transforms items from one queue into another
    Process,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Input => write!(f, "input"),
            StageKind::Process => write!(f, "process"),
        }
    }
}

/// Work run by each worker of an input stage.
///
/// A source must wait on the rate limiter before every emission and return
/// promptly once `cancel` fires. [`RateLimiter::admit`] does both.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use flowweld::prelude::*;
///
/// struct Counter {
///     limit: u64,
/// }
///
/// #[async_trait]
/// impl Source<u64> for Counter {
///     async fn run(&self, cancel: CancellationToken, output: Sender<u64>, limiter: RateLimiter) {
///         for i in 0..self.limit {
///             if !limiter.admit(&cancel).await {
///                 return;
///             }
///             if output.send(i).await.is_err() {
///                 return;
///             }
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Source<T>: Send + Sync {
    /// Emit items into `output` until exhausted or cancelled
    async fn run(&self, cancel: CancellationToken, output: Sender<T>, limiter: RateLimiter);
}

/// Work run by each worker of a process stage.
///
/// A processor consumes `input` until it is closed and drained, writes every
/// transformed item to `output`, then returns. It is not required to observe
/// `cancel`: shutdown reaches it through its input queue closing.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    /// Drain `input`, forwarding results into `output`
    async fn run(&self, cancel: CancellationToken, input: Receiver<T>, output: Sender<T>);
}

#[async_trait]
impl<T, F, Fut> Source<T> for F
where
    T: Send + 'static,
    F: Fn(CancellationToken, Sender<T>, RateLimiter) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn run(&self, cancel: CancellationToken, output: Sender<T>, limiter: RateLimiter) {
        (self)(cancel, output, limiter).await
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for F
where
    T: Send + 'static,
    F: Fn(CancellationToken, Receiver<T>, Sender<T>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn run(&self, cancel: CancellationToken, input: Receiver<T>, output: Sender<T>) {
        (self)(cancel, input, output).await
    }
}

pub(crate) enum Work<T> {
    Source(Arc<dyn Source<T>>),
    Process(Arc<dyn Processor<T>>),
}

/// The first callback panic raised by any worker of a pipeline.
///
/// Workers record their panic here and exit; waiters observe [`tripped`]
/// and re-raise the payload with [`resume`].
///
/// [`tripped`]: Panicked::tripped
/// [`resume`]: Panicked::resume
#[derive(Default)]
pub(crate) struct Panicked {
    payload: Mutex<Option<Box<dyn Any + Send>>>,
    tripped: CancellationToken,
}

impl Panicked {
    fn record(&self, stage: &str, worker: usize, payload: Box<dyn Any + Send>) {
        tracing::error!(%stage, worker, "stage worker panicked");
        let mut slot = self.payload.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(payload);
        }
        drop(slot);
        self.tripped.cancel();
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.tripped.is_cancelled()
    }

    /// Resolves once any worker has panicked
    pub(crate) async fn tripped(&self) {
        self.tripped.cancelled().await;
    }

    /// Re-raise the recorded panic on the calling task.
    ///
    /// The payload can only be taken once; later callers panic with a
    /// generic message.
    pub(crate) fn resume(&self) -> ! {
        let payload = self.payload.lock().unwrap_or_else(|e| e.into_inner()).take();
        match payload {
            Some(payload) => std::panic::resume_unwind(payload),
            None => panic!("a pipeline worker panicked"),
        }
    }
}

/// The tasks spawned for one stage.
pub(crate) struct TaskGroup {
    tracker: TaskTracker,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(task);
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// No more tasks will be spawned into this group
    pub(crate) fn seal(&self) {
        self.tracker.close();
    }

    pub(crate) fn active(&self) -> usize {
        self.tracker.len()
    }

    pub(crate) fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Wait for every task in the group to exit
    pub(crate) async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Abort every task still running. Aborted workers release their
    /// writer count as they are dropped.
    pub(crate) fn abort(&self) {
        for handle in self.handles.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            handle.abort();
        }
    }
}

/// A registered stage: its role, worker pool and the queue it writes into.
pub struct Stage<T> {
    name: String,
    workers: usize,
    queue: Queue<T>,
    counter: Arc<CompletionCounter>,
    work: Work<T>,
    tasks: TaskGroup,
    hold: Mutex<Option<CloseGuard<T>>>,
}

impl<T: Send + 'static> Stage<T> {
    /// An input stage writing into the shared `queue`, counted in `counter`
    pub(crate) fn input(
        name: String,
        source: Arc<dyn Source<T>>,
        workers: usize,
        queue: Queue<T>,
        counter: Arc<CompletionCounter>,
    ) -> Self {
        Self {
            name,
            workers,
            queue,
            counter,
            work: Work::Source(source),
            tasks: TaskGroup::new(),
            hold: Mutex::new(None),
        }
    }

    /// A process stage owning a fresh output `queue`.
    ///
    /// The queue's counter starts with a wiring hold that is released once
    /// the stage's workers have been spawned.
    pub(crate) fn process(
        name: String,
        processor: Arc<dyn Processor<T>>,
        workers: usize,
        queue: Queue<T>,
    ) -> Self {
        let counter = Arc::new(CompletionCounter::new(1));
        let hold = CloseGuard::new(queue.clone(), Arc::clone(&counter));
        Self {
            name,
            workers,
            queue,
            counter,
            work: Work::Process(processor),
            tasks: TaskGroup::new(),
            hold: Mutex::new(Some(hold)),
        }
    }

    /// Spawn this stage's workers.
    ///
    /// `upstream` is the queue process workers read from; input workers
    /// ignore it and write into the shared queue they were registered with.
    pub(crate) fn spawn(
        &self,
        cancel: &CancellationToken,
        limiter: &RateLimiter,
        upstream: &Queue<T>,
        panicked: &Arc<Panicked>,
    ) {
        self.counter.add(self.workers);

        for worker in 0..self.workers {
            let guard = CloseGuard::new(self.queue.clone(), Arc::clone(&self.counter));
            let cancel = cancel.clone();
            let output = self.queue.sender();
            let stage = self.name.clone();
            let panicked = Arc::clone(panicked);

            match &self.work {
                Work::Source(source) => {
                    let source = Arc::clone(source);
                    let limiter = limiter.clone();
                    self.tasks.spawn(async move {
                        let _guard = guard;
                        let run = AssertUnwindSafe(source.run(cancel, output, limiter));
                        match run.catch_unwind().await {
                            Ok(()) => tracing::debug!(%stage, worker, "source worker exited"),
                            Err(payload) => panicked.record(&stage, worker, payload),
                        }
                    });
                }
                Work::Process(processor) => {
                    let processor = Arc::clone(processor);
                    let input = upstream.receiver();
                    self.tasks.spawn(async move {
                        let _guard = guard;
                        let run = AssertUnwindSafe(processor.run(cancel, input, output));
                        match run.catch_unwind().await {
                            Ok(()) => tracing::debug!(%stage, worker, "process worker exited"),
                            Err(payload) => panicked.record(&stage, worker, payload),
                        }
                    });
                }
            }
        }

        self.tasks.seal();
        self.release_hold();
        tracing::debug!(stage = %self.name, kind = %self.kind(), workers = self.workers, "stage spawned");
    }
}

impl<T> Stage<T> {
    /// The stage's name, used in logs and stats
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is an input or a process stage
    pub fn kind(&self) -> StageKind {
        match self.work {
            Work::Source(_) => StageKind::Input,
            Work::Process(_) => StageKind::Process,
        }
    }

    /// Number of concurrent workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// The queue this stage writes into
    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }

    /// Writers still registered on this stage's output queue
    pub fn remaining_writers(&self) -> usize {
        self.counter.count()
    }

    /// Number of this stage's tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tasks.active()
    }

    pub(crate) fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }

    /// Drop the wiring hold on the output queue, if still held
    pub(crate) fn release_hold(&self) {
        let hold = self.hold.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(hold);
    }
}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("workers", &self.workers)
            .field("queue", &self.queue)
            .finish()
    }
}
