//! Pipeline orchestration and execution.
//!
//! The [`Pipeline`] is the root of the stage graph. It owns the shared input
//! queue, the rate limiter every source draws permits from and the
//! cancellation token handed to every task. Stages are registered in order
//! and wired linearly by [`Pipeline::run`]:
//!
//! ```text
//! sources ──► input queue ──► processor 1 ──► queue 1 ──► processor 2 ──► queue 2 (sink)
//! ```
//!
//! Queues are never closed by the pipeline directly. Every writer of a queue
//! holds a [`CloseGuard`]; the last one to exit closes the queue, which lets
//! the next stage drain and exit in turn.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::counter::{CloseGuard, CompletionCounter};
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, ShutdownSignal};
use crate::queue::{Queue, Receiver};
use crate::rate::RateLimiter;
use crate::stage::{Panicked, Processor, Source, Stage, StageKind};
use crate::stats::{PipelineStats, StageStats};

/// Lifecycle state of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PipelineState {
    /// Accepting registrations, no tasks spawned yet
    Idle,
    /// Tasks spawned and running
    Running,
    /// Shutdown requested; sources are exiting and downstream stages drain
    Stopping,
    /// Every task has exited and every queue is closed
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Stopping => write!(f, "stopping"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A linear pipeline of rate-limited sources and worker-pool processors.
///
/// # Example
///
/// ```rust
/// use flowweld::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let mut pipeline = Pipeline::new(1000, 16)?;
///     pipeline
///         .register_source(IterSource::new(|| 0..10u32), 1)?
///         .register_processor(MapProcessor::new(|x: u32| x * 2), 1, 16)?;
///
///     let sink = pipeline.sink();
///     pipeline.run()?;
///
///     assert_eq!(sink.collect().await, (0..10).map(|x| x * 2).collect::<Vec<_>>());
///     pipeline.wait().await;
///     Ok(())
/// }
/// ```
pub struct Pipeline<T> {
    config: PipelineConfig,
    cancel: CancellationToken,
    limiter: RateLimiter,
    input: Queue<T>,
    input_counter: Arc<CompletionCounter>,
    input_hold: Mutex<Option<CloseGuard<T>>>,
    stages: Vec<Stage<T>>,
    state: watch::Sender<PipelineState>,
    panicked: Arc<Panicked>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Create a pipeline admitting `rate_per_second` items into an input
    /// queue holding `queue_capacity` items
    pub fn new(rate_per_second: u32, queue_capacity: usize) -> Result<Self> {
        Self::with_config(PipelineConfig::new(rate_per_second, queue_capacity))
    }

    /// Create a pipeline from a full configuration
    pub fn with_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let limiter = RateLimiter::per_second(config.rate_per_second)?;
        let input = Queue::new(config.input_queue_name(), config.queue_capacity)?;
        // The wiring hold keeps the input queue open until every source is spawned.
        let input_counter = Arc::new(CompletionCounter::new(1));
        let input_hold = CloseGuard::new(input.clone(), Arc::clone(&input_counter));
        let (state, _) = watch::channel(PipelineState::Idle);

        tracing::debug!(
            pipeline = %config.name,
            rate = config.rate_per_second,
            capacity = config.queue_capacity,
            "pipeline created"
        );

        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            limiter,
            input,
            input_counter,
            input_hold: Mutex::new(Some(input_hold)),
            stages: Vec::new(),
            state,
            panicked: Arc::new(Panicked::default()),
        })
    }

    /// Register an input stage running `source` in `workers` tasks
    pub fn register_source<S>(&mut self, source: S, workers: usize) -> Result<&mut Self>
    where
        S: Source<T> + 'static,
    {
        let name = format!("source-{}", self.stages.len());
        self.register_source_named(name, source, workers)
    }

    /// Register a named input stage
    pub fn register_source_named<S>(
        &mut self,
        name: impl Into<String>,
        source: S,
        workers: usize,
    ) -> Result<&mut Self>
    where
        S: Source<T> + 'static,
    {
        let name = name.into();
        self.ensure_idle()?;
        if workers == 0 {
            return Err(Error::InvalidWorkerCount { stage: name });
        }

        tracing::debug!(pipeline = %self.config.name, stage = %name, workers, "source registered");
        self.stages.push(Stage::input(
            name,
            Arc::new(source),
            workers,
            self.input.clone(),
            Arc::clone(&self.input_counter),
        ));
        Ok(self)
    }

    /// Register a process stage running `processor` in `workers` tasks and
    /// writing into a fresh queue of `output_capacity` items
    pub fn register_processor<P>(
        &mut self,
        processor: P,
        workers: usize,
        output_capacity: usize,
    ) -> Result<&mut Self>
    where
        P: Processor<T> + 'static,
    {
        let name = format!("processor-{}", self.stages.len());
        self.register_processor_named(name, processor, workers, output_capacity)
    }

    /// Register a named process stage
    pub fn register_processor_named<P>(
        &mut self,
        name: impl Into<String>,
        processor: P,
        workers: usize,
        output_capacity: usize,
    ) -> Result<&mut Self>
    where
        P: Processor<T> + 'static,
    {
        let name = name.into();
        self.ensure_idle()?;
        if workers == 0 {
            return Err(Error::InvalidWorkerCount { stage: name });
        }
        let queue = Queue::new(format!("{}/{}", self.config.name, name), output_capacity)?;

        tracing::debug!(
            pipeline = %self.config.name,
            stage = %name,
            workers,
            capacity = output_capacity,
            "processor registered"
        );
        self.stages
            .push(Stage::process(name, Arc::new(processor), workers, queue));
        Ok(self)
    }

    /// Spawn every registered stage's workers, wiring stages in registration
    /// order.
    ///
    /// Must be called from within a tokio runtime. Returns immediately; use
    /// [`wait`](Self::wait) or [`listen`](Self::listen) to block.
    pub fn run(&self) -> Result<()> {
        tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let mut previous = PipelineState::Idle;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == PipelineState::Idle {
                *state = PipelineState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(match previous {
                PipelineState::Running => Error::AlreadyStarted(self.config.name.clone()),
                _ => Error::AlreadyStopped(self.config.name.clone()),
            });
        }

        let mut upstream = self.input.clone();
        for stage in &self.stages {
            stage.spawn(&self.cancel, &self.limiter, &upstream, &self.panicked);
            if stage.kind() == StageKind::Process {
                upstream = stage.queue().clone();
            }
        }
        self.release_input_hold();

        tracing::info!(
            pipeline = %self.config.name,
            stages = self.stages.len(),
            tasks = self.active_tasks(),
            "pipeline running"
        );
        Ok(())
    }

    /// Block until a termination signal arrives, then stop the pipeline and
    /// wait for every task to exit.
    ///
    /// Returns `None` if the pipeline drained on its own before any signal.
    pub async fn listen(&self) -> Result<Option<ShutdownSignal>> {
        Lifecycle::new(self).listen().await
    }
}

impl<T> Pipeline<T> {
    /// Request shutdown.
    ///
    /// Cancels every source, stops the rate limiter and waits for all input
    /// stages to exit, after which the input queue closes. Process stages are
    /// not interrupted: they drain what was already admitted and exit as
    /// their upstream queues close. Calling `stop` again is harmless.
    ///
    /// # Panics
    ///
    /// Re-raises the first callback panic of any worker, after aborting
    /// every remaining task.
    pub async fn stop(&self) {
        let mut previous = PipelineState::Idle;
        let transitioned = self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                PipelineState::Idle | PipelineState::Running => {
                    *state = PipelineState::Stopping;
                    true
                }
                _ => false,
            }
        });
        if transitioned {
            tracing::info!(pipeline = %self.config.name, from = %previous, "pipeline stopping");
        }

        self.cancel.cancel();
        self.limiter.stop();

        if transitioned && previous == PipelineState::Idle {
            // Nothing was spawned; seal every group and close every queue.
            for stage in &self.stages {
                stage.tasks().seal();
                stage.release_hold();
            }
        }

        tokio::select! {
            biased;
            _ = self.panicked.tripped() => self.abort_on_panic(),
            _ = self.wait_for_input_stages() => {}
        }
        self.release_input_hold();

        if transitioned && previous == PipelineState::Idle {
            self.state.send_replace(PipelineState::Stopped);
            tracing::info!(pipeline = %self.config.name, "pipeline stopped before running");
        }
    }

    /// Wait for every task of every stage to exit, then mark the pipeline
    /// stopped.
    ///
    /// Returns immediately if the pipeline was never run.
    ///
    /// # Panics
    ///
    /// Re-raises the first callback panic as soon as it happens, after
    /// aborting every remaining task. Workers blocked on a queue whose
    /// reader died do not delay it.
    pub async fn wait(&self) {
        if self.state() == PipelineState::Idle {
            tracing::debug!(pipeline = %self.config.name, "wait called on an idle pipeline");
            return;
        }

        tokio::select! {
            biased;
            _ = self.panicked.tripped() => self.abort_on_panic(),
            _ = self.wait_for_stages() => {}
        }
        if self.panicked.is_tripped() {
            self.abort_on_panic();
        }

        // Natural exhaustion ends here as well; release what sources held.
        self.cancel.cancel();
        self.limiter.stop();
        self.release_input_hold();

        let previous = self.state.send_replace(PipelineState::Stopped);
        if previous != PipelineState::Stopped {
            tracing::info!(pipeline = %self.config.name, "pipeline stopped");
        }
    }

    /// The read-end of the last stage's queue.
    ///
    /// Without processors this is the shared input queue. Call after every
    /// processor has been registered.
    pub fn sink(&self) -> Receiver<T> {
        self.stages
            .iter()
            .rev()
            .find(|stage| stage.kind() == StageKind::Process)
            .map(|stage| stage.queue())
            .unwrap_or(&self.input)
            .receiver()
    }

    /// The shared queue every source writes into
    pub fn input_queue(&self) -> &Queue<T> {
        &self.input
    }

    /// Registered stages in wiring order
    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    /// The configuration this pipeline was built from
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The rate limiter shared by every source
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// A clone of the cancellation token shared by every task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Number of tasks still running across every stage
    pub fn active_tasks(&self) -> usize {
        self.stages.iter().map(Stage::active_tasks).sum()
    }

    /// Snapshot of every stage's workers and queue
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            name: self.config.name.clone(),
            state: self.state(),
            active_tasks: self.active_tasks(),
            input: (&self.input).into(),
            stages: self.stages.iter().map(StageStats::from).collect(),
        }
    }

    /// Periodically log the number of running tasks until every stage has
    /// exited
    pub fn spawn_monitor(&self, every: Duration) -> JoinHandle<()> {
        let name = self.config.name.clone();
        let trackers: Vec<_> = self.stages.iter().map(|s| s.tasks().tracker()).collect();

        tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(every));
            while ticks.next().await.is_some() {
                let active: usize = trackers.iter().map(|t| t.len()).sum();
                tracing::info!(pipeline = %name, active, "active pipeline tasks");

                if active == 0 && trackers.iter().all(|t| t.is_closed()) {
                    break;
                }
            }
        })
    }

    async fn wait_for_stages(&self) {
        for stage in &self.stages {
            stage.tasks().wait().await;
        }
    }

    async fn wait_for_input_stages(&self) {
        let inputs = self
            .stages
            .iter()
            .filter(|stage| stage.kind() == StageKind::Input);
        for stage in inputs {
            stage.tasks().wait().await;
        }
    }

    /// Tear everything down after a worker panic and re-raise it
    fn abort_on_panic(&self) -> ! {
        tracing::error!(pipeline = %self.config.name, "aborting pipeline after a worker panic");
        self.cancel.cancel();
        self.limiter.stop();
        for stage in &self.stages {
            stage.tasks().abort();
            stage.release_hold();
        }
        self.release_input_hold();
        self.state.send_replace(PipelineState::Stopped);
        self.panicked.resume()
    }

    fn release_input_hold(&self) {
        let hold = self
            .input_hold
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(hold);
    }

    fn ensure_idle(&self) -> Result<()> {
        match *self.state.borrow() {
            PipelineState::Idle => Ok(()),
            PipelineState::Running => Err(Error::AlreadyStarted(self.config.name.clone())),
            _ => Err(Error::AlreadyStopped(self.config.name.clone())),
        }
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("stages", &self.stages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::NoOpProcessor;
    use crate::queue::Sender;
    use crate::sources::IterSource;

    #[test]
    fn test_rejects_misconfiguration() {
        assert!(matches!(Pipeline::<u32>::new(0, 10), Err(Error::InvalidRate)));
        assert!(matches!(
            Pipeline::<u32>::new(2_000_000_000, 16),
            Err(Error::InvalidRate)
        ));
        assert!(matches!(
            Pipeline::<u32>::new(10, 0),
            Err(Error::InvalidCapacity { .. })
        ));

        let mut pipeline = Pipeline::<u32>::new(10, 10).unwrap();
        assert!(matches!(
            pipeline.register_source(IterSource::new(|| 0..1u32), 0),
            Err(Error::InvalidWorkerCount { stage }) if stage == "source-0"
        ));
        assert!(matches!(
            pipeline.register_processor(NoOpProcessor, 0, 10),
            Err(Error::InvalidWorkerCount { .. })
        ));
        assert!(matches!(
            pipeline.register_processor(NoOpProcessor, 1, 0),
            Err(Error::InvalidCapacity { .. })
        ));
        assert!(pipeline.stages().is_empty());
    }

    #[test]
    fn test_run_outside_runtime() {
        let pipeline = Pipeline::<u32>::new(10, 10).unwrap();
        assert!(matches!(pipeline.run(), Err(Error::NoRuntime)));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_stage_names_follow_registration_order() {
        let mut pipeline = Pipeline::<u32>::new(10, 10).unwrap();
        pipeline
            .register_source(IterSource::new(|| 0..1u32), 1)
            .unwrap()
            .register_processor(NoOpProcessor, 2, 4)
            .unwrap()
            .register_processor_named("tail", NoOpProcessor, 1, 4)
            .unwrap();

        let names: Vec<_> = pipeline.stages().iter().map(Stage::name).collect();
        assert_eq!(names, vec!["source-0", "processor-1", "tail"]);
        assert_eq!(pipeline.sink().queue().name(), "pipeline/tail");
    }

    #[tokio::test]
    async fn test_registration_after_run_rejected() {
        let mut pipeline = Pipeline::<u32>::new(1000, 10).unwrap();
        pipeline.run().unwrap();

        assert!(matches!(
            pipeline.register_processor(NoOpProcessor, 1, 4),
            Err(Error::AlreadyStarted(_))
        ));
        assert!(matches!(pipeline.run(), Err(Error::AlreadyStarted(_))));

        pipeline.stop().await;
        pipeline.wait().await;
        assert!(matches!(pipeline.run(), Err(Error::AlreadyStopped(_))));
    }

    #[tokio::test]
    async fn test_no_sources_closes_input_on_run() {
        let mut pipeline = Pipeline::<u32>::new(1000, 10).unwrap();
        pipeline.register_processor(NoOpProcessor, 2, 4).unwrap();
        pipeline.run().unwrap();

        pipeline.wait().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(pipeline.input_queue().close_count(), 1);
        assert_eq!(pipeline.sink().queue().close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_run_closes_everything() {
        let mut pipeline = Pipeline::<u32>::new(1000, 10).unwrap();
        pipeline
            .register_source(IterSource::new(|| 0..5u32), 1)
            .unwrap()
            .register_processor(NoOpProcessor, 1, 4)
            .unwrap();

        pipeline.stop().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.input_queue().is_closed());
        assert!(pipeline.sink().is_closed());
        assert!(matches!(pipeline.run(), Err(Error::AlreadyStopped(_))));

        pipeline.wait().await;
        assert_eq!(pipeline.sink().queue().close_count(), 1);
    }

    #[tokio::test]
    async fn test_state_transitions_are_published() {
        let mut pipeline = Pipeline::<u32>::new(1000, 10).unwrap();
        pipeline
            .register_source(
                |cancel: CancellationToken, _out: Sender<u32>, _limiter: RateLimiter| async move {
                    cancel.cancelled().await;
                },
                1,
            )
            .unwrap();
        let mut states = pipeline.subscribe();

        pipeline.run().unwrap();
        assert_eq!(*states.borrow_and_update(), PipelineState::Running);

        pipeline.stop().await;
        assert_eq!(*states.borrow_and_update(), PipelineState::Stopping);

        pipeline.wait().await;
        assert_eq!(*states.borrow_and_update(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let mut pipeline = Pipeline::<u32>::new(1000, 10).unwrap();
        pipeline
            .register_source(IterSource::new(|| 0..3u32), 2)
            .unwrap()
            .register_processor(NoOpProcessor, 1, 8)
            .unwrap();
        pipeline.run().unwrap();
        pipeline.wait().await;

        let stats = pipeline.stats();
        assert_eq!(stats.state, PipelineState::Stopped);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.input.sent, 6);
        assert_eq!(stats.stages.len(), 2);
        assert_eq!(stats.stages[0].kind, StageKind::Input);
        assert_eq!(stats.stages[1].queue.sent, 6);
        assert!(stats.stages[1].queue.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_exits_when_drained() {
        let mut pipeline = Pipeline::<u32>::new(1000, 10).unwrap();
        pipeline
            .register_source(IterSource::new(|| 0..3u32), 1)
            .unwrap()
            .register_processor(NoOpProcessor, 1, 8)
            .unwrap();
        pipeline.run().unwrap();

        let monitor = pipeline.spawn_monitor(Duration::from_millis(5));
        pipeline.wait().await;
        monitor.await.unwrap();
    }
}
