//! Coordinated shutdown: one cancellation watch shared by every listener.
//!
//! Replaces ad-hoc per-listener signal handlers with a single coordinator
//! holding an explicit state. The first trigger moves NotStopping →
//! Draining and flips the watch; later triggers only log. Each listener
//! drains its own sessions when the watch flips and reports itself stopped
//! once its close completes; `mark_stopped` records the terminal state.

use std::sync::Mutex;
use tokio::sync::watch;
use tracing::info;

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    NotStopping,
    Draining,
    Stopped,
}

/// Process-wide shutdown coordinator.
pub struct ShutdownCoordinator {
    state: Mutex<ShutdownState>,
    cancel_tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(ShutdownState::NotStopping),
            cancel_tx,
        }
    }

    /// Cancellation handle passed to every listener at construction.
    /// Becomes `true` once draining starts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Request termination. Returns `true` on the first trigger; further
    /// triggers are idempotent no-ops besides logging.
    pub fn trigger(&self, reason: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            ShutdownState::NotStopping => {
                info!(reason, "termination requested, draining sessions");
                *state = ShutdownState::Draining;
                let _ = self.cancel_tx.send(true);
                true
            }
            _ => {
                info!(reason, "termination already in progress");
                false
            }
        }
    }

    /// Record that every listener has closed.
    pub fn mark_stopped(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = ShutdownState::Stopped;
    }

    /// Current state snapshot.
    pub fn state(&self) -> ShutdownState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
