//! Process-wide shutdown coordination.
//!
//! The coordinator moves through `Running -> Draining -> Stopped`. The admin
//! listener triggers the first transition; the server marks the second once
//! connections are flushed or the grace period runs out.
//!
//! Built on a `tokio::sync::watch` channel so async tasks can wait for the
//! transition while the synchronous mio loop simply reads the phase.

use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle phase of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    /// No new connections; queued responses are being flushed.
    Draining,
    Stopped,
}

/// Shared handle to the shutdown state machine.
#[derive(Debug, Clone)]
pub struct Shutdown {
    phase: Arc<watch::Sender<Phase>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            phase: Arc::new(phase),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Start draining.
    ///
    /// Returns `true` only for the call that performed the transition; later
    /// calls are no-ops.
    pub fn trigger(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = Phase::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Mark the server stopped.
    pub fn complete(&self) {
        self.phase.send_replace(Phase::Stopped);
    }

    /// Subscribe to the transition out of `Running`.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            phase: self.phase.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side handed to accept loops and connection tasks.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    phase: watch::Receiver<Phase>,
}

impl ShutdownListener {
    /// Resolve once shutdown has been triggered.
    ///
    /// Also resolves if every [`Shutdown`] handle is gone.
    pub async fn draining(&mut self) {
        let _ = self.phase.wait_for(|phase| *phase != Phase::Running).await;
    }
}
