//! Child Reaper: turns SIGCHLD into a drained stream of exit events.
//!
//! Grounded on `airssys-osl`'s `executors/process/signal.rs` use of `nix` for
//! direct syscall access. Follows the usual self-pipe discipline: the signal
//! handler itself does nothing but wake `tokio::signal::unix`'s internal
//! pipe, and the actual reaping happens here, off the handler, in a loop
//! that doesn't stop until `waitpid` reports nothing left to reap.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited,
    Signaled,
}

/// A single child's termination, normalized away from the raw wait status.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub pid: u32,
    pub kind: ExitKind,
    pub code_or_signal: i32,
    pub reaped_at: std::time::Instant,
}

/// Owns the SIGCHLD listener and forwards normalized exit events to the
/// Supervisor Core's exit-event channel (highest priority of the three
/// queues it polls).
pub struct Reaper {
    sender: mpsc::UnboundedSender<ExitEvent>,
}

impl Reaper {
    pub fn new(sender: mpsc::UnboundedSender<ExitEvent>) -> Self {
        Self { sender }
    }

    /// Runs forever, waking on every SIGCHLD and draining all reapable
    /// children before going back to sleep. A single signal can coalesce
    /// multiple deaths, so this never reaps just one child per wake.
    pub async fn run(self) {
        let mut stream = match signal(SignalKind::child()) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to install SIGCHLD handler");
                return;
            }
        };

        loop {
            if stream.recv().await.is_none() {
                return;
            }
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            match waitpid(Option::<Pid>::None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.emit(pid.as_raw() as u32, ExitKind::Exited, code);
                }
                Ok(WaitStatus::Signaled(pid, signal, _core_dumped)) => {
                    self.emit(pid.as_raw() as u32, ExitKind::Signaled, signal as i32);
                }
                Ok(_) => {
                    // Stopped/Continued/PtraceEvent: not a termination, keep draining.
                }
                Err(nix::errno::Errno::ECHILD) => return,
                Err(err) => {
                    warn!(%err, "waitpid returned an unexpected error");
                    return;
                }
            }
        }
    }

    fn emit(&self, pid: u32, kind: ExitKind, code_or_signal: i32) {
        debug!(pid, ?kind, code_or_signal, "reaped child");
        let _ = self.sender.send(ExitEvent {
            pid,
            kind,
            code_or_signal,
            reaped_at: std::time::Instant::now(),
        });
    }
}
