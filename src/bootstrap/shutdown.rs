use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Shutdown state machine
///
/// States:
/// 1. Running - normal operation
/// 2. Draining - ingress rejects new events, in-flight dispatches finish
/// 3. Terminated - outstanding attempts cancelled, process exiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Broadcasts shutdown progress to every component holding a receiver.
pub struct Shutdown {
    state: watch::Sender<ShutdownState>,

    /// How long draining may take before outstanding attempts are cancelled
    drain_timeout: Duration,
}

impl Shutdown {
    pub fn new(drain_timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ShutdownState::Running);
        Arc::new(Self {
            state,
            drain_timeout,
        })
    }

    /// Get current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Start draining (called on SIGTERM/SIGINT)
    pub fn start_drain(&self) {
        if self.state() != ShutdownState::Running {
            return;
        }
        info!(
            drain_timeout_secs = self.drain_timeout.as_secs(),
            "starting graceful shutdown drain"
        );
        self.state.send_replace(ShutdownState::Draining);
    }

    /// Complete shutdown
    pub fn terminate(&self) {
        if self.state() == ShutdownState::Terminated {
            return;
        }
        info!("shutdown complete");
        self.state.send_replace(ShutdownState::Terminated);
    }

    /// Check if accepting new events
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Resolves once the state leaves `Running`.
    pub async fn draining(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow_and_update() == ShutdownState::Running {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
