//! Signal-driven shutdown.
//!
//! The pipeline core never touches OS signal machinery. [`Lifecycle`] waits
//! for a shutdown trigger and then drives the target only through its public
//! [`Stoppable`] surface, which keeps the sequence testable with any future
//! standing in for a signal.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::Pipeline;

/// A termination signal that triggers shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// SIGHUP
    HangUp,
    /// SIGINT, or ctrl-c on non-unix platforms
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT
    Quit,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::HangUp => write!(f, "SIGHUP"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Quit => write!(f, "SIGQUIT"),
        }
    }
}

/// Wait for the first of SIGHUP, SIGINT, SIGTERM or SIGQUIT.
///
/// Handlers are installed when the future is first polled. No other signal
/// is subscribed, so every other signal keeps its default disposition.
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = hangup.recv() => ShutdownSignal::HangUp,
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = terminate.recv() => ShutdownSignal::Terminate,
        _ = quit.recv() => ShutdownSignal::Quit,
    };
    Ok(received)
}

/// Wait for ctrl-c.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

/// Something that can be asked to shut down and then waited on.
#[async_trait]
pub trait Stoppable: Send + Sync {
    /// Request shutdown; must be safe to call more than once
    async fn stop(&self);

    /// Wait until everything has exited
    async fn wait(&self);
}

#[async_trait]
impl<T: Send + 'static> Stoppable for Pipeline<T> {
    async fn stop(&self) {
        Pipeline::stop(self).await
    }

    async fn wait(&self) {
        Pipeline::wait(self).await
    }
}

#[async_trait]
impl<S: Stoppable + ?Sized> Stoppable for &S {
    async fn stop(&self) {
        (**self).stop().await
    }

    async fn wait(&self) {
        (**self).wait().await
    }
}

#[async_trait]
impl<S: Stoppable + ?Sized> Stoppable for Arc<S> {
    async fn stop(&self) {
        (**self).stop().await
    }

    async fn wait(&self) {
        (**self).wait().await
    }
}

/// Drives a [`Stoppable`] from a shutdown trigger.
#[derive(Debug)]
pub struct Lifecycle<S> {
    target: S,
}

impl<S: Stoppable> Lifecycle<S> {
    /// Manage `target`
    pub fn new(target: S) -> Self {
        Self { target }
    }

    /// Stop on the first termination signal, then wait for the target.
    ///
    /// Returns `None` if the target finished on its own first.
    pub async fn listen(&self) -> Result<Option<ShutdownSignal>> {
        self.listen_for(wait_for_signal()).await
    }

    /// Stop once `shutdown` resolves, then wait for the target.
    ///
    /// Returns `None` if the target finished before `shutdown` resolved.
    pub async fn listen_for<F>(&self, shutdown: F) -> Result<Option<ShutdownSignal>>
    where
        F: Future<Output = Result<ShutdownSignal>>,
    {
        tokio::select! {
            signal = shutdown => {
                let signal = signal?;
                tracing::info!(%signal, "stopping on signal");
                self.target.stop().await;
                self.target.wait().await;
                Ok(Some(signal))
            }
            _ = self.target.wait() => {
                tracing::info!("finished before any shutdown signal");
                Ok(None)
            }
        }
    }

    /// The managed target
    pub fn target(&self) -> &S {
        &self.target
    }
}
