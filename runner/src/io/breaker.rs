//! Circuit breaker: a deadline around one in-flight operation.
//!
//! The operation runs on a scoped thread while the caller waits on a channel
//! with a timeout. When the deadline wins, the process group registered in the
//! operation's [`ProcessSlot`] is killed and the operation thread is joined,
//! so neither the child process nor the thread outlives the call. A
//! [`CancellationToken`] can end the operation the same way.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::cancel::CancellationToken;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Handle through which an operation publishes the process group it spawned.
#[derive(Debug, Clone, Default)]
pub struct ProcessSlot {
    inner: Arc<Mutex<SlotState>>,
}

#[derive(Debug, Default)]
struct SlotState {
    pgid: Option<u32>,
    terminated: bool,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the process group leader spawned by the operation.
    ///
    /// If the slot was already terminated, the group is killed immediately.
    pub fn register(&self, pgid: u32) {
        let kill_now = match self.inner.lock() {
            Ok(mut state) => {
                state.pgid = Some(pgid);
                state.terminated
            }
            Err(_) => false,
        };
        if kill_now {
            warn!(pgid, "process registered after breaker trip, killing");
            kill_process_group(pgid);
        }
    }

    /// Clear the registration once the process has been reaped.
    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.pgid = None;
        }
    }

    /// Kill the registered process group (if any) and refuse future registrations.
    pub fn terminate(&self) {
        let pgid = match self.inner.lock() {
            Ok(mut state) => {
                state.terminated = true;
                state.pgid.take()
            }
            Err(_) => None,
        };
        if let Some(pgid) = pgid {
            kill_process_group(pgid);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().map(|s| s.terminated).unwrap_or(false)
    }
}

/// The deadline elapsed before the operation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tripped {
    pub timeout: Duration,
}

impl std::fmt::Display for Tripped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit breaker tripped after {:?}", self.timeout)
    }
}

impl std::error::Error for Tripped {}

/// Timeout guard. `None` disables it (transparent pass-through).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreaker {
    timeout: Option<Duration>,
}

impl CircuitBreaker {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn disabled() -> Self {
        Self { timeout: None }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `op`, reporting success only if it finishes before the deadline.
    pub fn call<T, F>(&self, op: F) -> Result<T, Tripped>
    where
        T: Send,
        F: FnOnce(&ProcessSlot) -> T + Send,
    {
        if self.timeout.is_none() {
            return Ok(op(&ProcessSlot::new()));
        }
        self.call_cancellable(&CancellationToken::new(), op)
    }

    /// Like [`CircuitBreaker::call`], but a cancelled `token` also kills the
    /// registered process group. The operation then finishes on its own and
    /// its result is returned; only the deadline yields [`Tripped`].
    pub fn call_cancellable<T, F>(&self, token: &CancellationToken, op: F) -> Result<T, Tripped>
    where
        T: Send,
        F: FnOnce(&ProcessSlot) -> T + Send,
    {
        let slot = ProcessSlot::new();
        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            let op_slot = slot.clone();
            let handle = scope.spawn(move || {
                let out = op(&op_slot);
                // Receiver is gone once the breaker tripped.
                let _ = tx.send(out);
            });

            let started = Instant::now();
            loop {
                let wait = match self.timeout {
                    Some(timeout) => timeout.saturating_sub(started.elapsed()).min(CANCEL_POLL),
                    None => CANCEL_POLL,
                };
                match rx.recv_timeout(wait) {
                    Ok(out) => {
                        let _ = handle.join();
                        return Ok(out);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(timeout) = self.timeout.filter(|t| started.elapsed() >= *t) {
                            warn!(timeout_secs = timeout.as_secs(), "circuit breaker tripped");
                            slot.terminate();
                            if handle.join().is_err() {
                                warn!("operation panicked after breaker trip");
                            }
                            debug!("operation thread joined after trip");
                            return Err(Tripped { timeout });
                        }
                        if token.is_cancelled() && !slot.is_terminated() {
                            warn!("cancellation requested, terminating in-flight operation");
                            slot.terminate();
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return match handle.join() {
                            Err(payload) => std::panic::resume_unwind(payload),
                            Ok(()) => unreachable!("operation finished without sending its result"),
                        };
                    }
                }
            }
        })
    }
}

/// Best-effort SIGTERM of a whole process group.
#[cfg(unix)]
pub fn terminate_process_group(pgid: u32) {
    signal_process_group(pgid, nix::sys::signal::Signal::SIGTERM);
}

/// Best-effort SIGKILL of a whole process group.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    signal_process_group(pgid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(unix)]
fn signal_process_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        warn!(pgid, "process group id out of range");
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => debug!(pgid, %signal, "signalled process group"),
        Err(nix::errno::Errno::ESRCH) => debug!(pgid, "process group already gone"),
        Err(err) => warn!(pgid, %signal, err = %err, "failed to signal process group"),
    }
}

#[cfg(not(unix))]
pub fn terminate_process_group(pgid: u32) {
    warn!(pgid, "process group termination is unsupported on this platform");
}

#[cfg(not(unix))]
pub fn kill_process_group(pgid: u32) {
    warn!(pgid, "process group termination is unsupported on this platform");
}
