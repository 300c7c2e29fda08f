//! Shutdown coordinator
//!
//! One process-wide cancellation signal plus an ordered, idempotent cleanup:
//! the relay server stops accepting, then each child process gets a graceful
//! termination request followed by a forced kill after the grace period.
//! Cleanup steps log their failures and never abort the remaining steps.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle states of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

/// Process-wide shutdown signal and lifecycle state machine.
///
/// Cloneable handle shared by every component. Several triggers may fire
/// concurrently (signal, player exit, upstream exit); the transition into
/// `Stopping` is claimed by exactly one of them.
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(LifecycleState::Running as u8)),
        }
    }

    /// The cancellation token observed by every long-running loop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::SeqCst) {
            0 => LifecycleState::Running,
            1 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request shutdown. The signal is monotonic; cancelling an already
    /// cancelled token is a no-op. Returns true for the single caller that
    /// won the `Running -> Stopping` transition and owns the cleanup.
    pub fn begin_shutdown(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                LifecycleState::Running as u8,
                LifecycleState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        self.token.cancel();
        if won {
            info!("shutdown initiated");
        }
        won
    }

    /// Mark cleanup finished; the state machine is terminal from here.
    pub fn finish(&self) {
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::SeqCst);
        info!("shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminate a child process: graceful request first, forced kill once the
/// grace period elapses.
///
/// Every step is best effort. A child that is already gone is not an error,
/// and a failed kill is logged without interrupting the rest of the shutdown
/// sequence.
pub async fn terminate_child(name: &str, child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            info!(name, %status, "child already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(name, "could not poll child: {}", e),
    }

    request_graceful_exit(name, child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(name, %status, "child terminated");
            return;
        }
        Ok(Err(e)) => warn!(name, "error waiting for child: {}", e),
        Err(_) => info!(name, "grace period elapsed, killing"),
    }

    if let Err(e) = child.kill().await {
        warn!(name, "failed to kill child: {}", e);
    }
}

#[cfg(unix)]
fn request_graceful_exit(name: &str, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else { return };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(name, "failed to send SIGTERM: {}", e);
    }
}

/// No graceful-termination analogue for arbitrary processes here; the grace
/// wait still applies before the forced kill.
#[cfg(not(unix))]
fn request_graceful_exit(_name: &str, _child: &Child) {}
