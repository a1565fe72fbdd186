//! # Rate-limited worker-pool pipelines
//!
//! This crate wires rate-limited sources and a chain of worker-pool
//! processors together with bounded queues, and shuts the whole thing down
//! gracefully on termination signals.
//!
//! ## Core Concepts
//!
//! - **Source**: an input stage; each worker emits items into the shared
//!   input queue after taking a permit from the pipeline's rate limiter
//! - **Processor**: a process stage; each worker drains the previous
//!   stage's queue and writes into its own
//! - **Completion counter**: counts the writers still feeding a queue; the
//!   last one to exit closes it, so termination flows downstream stage by
//!   stage
//! - **Lifecycle**: turns SIGHUP/SIGINT/SIGTERM/SIGQUIT into `stop` followed
//!   by a full drain
//!
//! ## Example
//!
//! ```rust
//! use flowweld::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut pipeline = Pipeline::new(500, 64)?;
//!     pipeline
//!         .register_source(SharedIterSource::new(1..=20u64), 4)?
//!         .register_processor(FilterProcessor::new(|x: &u64| x % 2 == 0), 2, 64)?
//!         .register_processor(MapProcessor::new(|x: u64| x * 10), 1, 64)?;
//!
//!     let sink = pipeline.sink();
//!     pipeline.run()?;
//!     pipeline.wait().await;
//!
//!     let mut out = sink.collect().await;
//!     out.sort();
//!     assert_eq!(out, vec![20, 40, 60, 80, 100, 120, 140, 160, 180, 200]);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod counter;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod processors;
pub mod queue;
pub mod rate;
pub mod sources;
pub mod stage;
pub mod stats;

// Re-export commonly used items
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result, SendError};
    pub use crate::lifecycle::{Lifecycle, ShutdownSignal, Stoppable};
    pub use crate::pipeline::{Pipeline, PipelineState};
    pub use crate::processors::{FilterProcessor, MapProcessor, NoOpProcessor};
    pub use crate::queue::{Queue, Receiver, Sender};
    pub use crate::rate::RateLimiter;
    pub use crate::sources::{IterSource, SharedIterSource};
    pub use crate::stage::{Processor, Source, StageKind};
    pub use tokio_util::sync::CancellationToken;
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
