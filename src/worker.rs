//! The per-worker lifecycle state machine.
//!
//! One `Worker` exists per `(program_name, replica_index)`. All mutation
//! happens through `Worker::apply`, which is the single place the transition
//! table is encoded -- mirroring the way `airssys-osl`'s executors keep one
//! trait method as the sole entry point for an operation's effects.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::reaper::ExitKind;

/// Unique key for a worker: its program name and replica index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub program: String,
    pub replica: u32,
}

impl WorkerKey {
    pub fn new(program: impl Into<String>, replica: u32) -> Self {
        Self {
            program: program.into(),
            replica,
        }
    }
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.program, self.replica)
    }
}

/// The worker's current lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Stopped => "STOPPED",
            WorkerState::Starting => "STARTING",
            WorkerState::Running => "RUNNING",
            WorkerState::Backoff => "BACKOFF",
            WorkerState::Stopping => "STOPPING",
            WorkerState::Exited => "EXITED",
            WorkerState::Fatal => "FATAL",
        }
    }

    /// True for the three states a worker only leaves on explicit command:
    /// STOPPED, EXITED, FATAL.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Stopped | WorkerState::Exited | WorkerState::Fatal
        )
    }
}

/// What the state machine wants the Supervisor Core to do in response to a
/// transition. The core carries these out (arm a timer, request a spawn,
/// send a signal) -- `Worker::apply` never performs I/O itself.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    None,
    RequestSpawn,
    ArmBackoffTimer { delay: std::time::Duration },
    SendStopSignal,
    SendKill,
    CancelTimer,
}

/// Events the core feeds into a worker's state machine.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Start,
    Stop,
    SpawnFailed,
    Exit { kind: ExitKind, code: i32 },
    StartupTimerFired,
    StopTimerFired,
    BackoffTimerFired,
}

/// One replica's full lifecycle record.
#[derive(Debug, Clone)]
pub struct Worker {
    pub key: WorkerKey,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub spawned_at: Option<Instant>,
    /// Wall-clock time of the most recent spawn, for human-readable status
    /// output; `spawned_at` (monotonic) is what uptime math actually uses.
    pub started_at: Option<DateTime<Utc>>,
    pub state_entered_at: Instant,
    pub start_attempts: u32,
    pub last_exit: Option<(ExitKind, i32)>,
}

impl Worker {
    pub fn new(key: WorkerKey) -> Self {
        Self {
            key,
            state: WorkerState::Stopped,
            pid: None,
            spawned_at: None,
            started_at: None,
            state_entered_at: Instant::now(),
            start_attempts: 0,
            last_exit: None,
        }
    }

    fn enter(&mut self, state: WorkerState) {
        self.state = state;
        self.state_entered_at = Instant::now();
    }

    /// Applies one event to the state machine, returning the action the
    /// core must carry out. Unapplicable events (e.g. `Start` while
    /// `RUNNING`) are rejected by the caller before reaching here -- see
    /// `Supervisor::dispatch_command`.
    pub fn apply(&mut self, event: WorkerEvent, policy: &RestartPolicy) -> WorkerAction {
        use WorkerEvent as E;
        use WorkerState as S;

        match (self.state, event) {
            (S::Stopped | S::Fatal | S::Exited, E::Start) => {
                self.start_attempts = 0;
                self.enter(S::Starting);
                WorkerAction::RequestSpawn
            }

            (S::Starting, E::SpawnFailed) => self.fail_start_attempt(policy),

            (S::Starting, E::Exit { kind, code }) => {
                self.last_exit = Some((kind, code));
                self.fail_start_attempt(policy)
            }

            (S::Starting, E::StartupTimerFired) => {
                self.start_attempts = 0;
                self.enter(S::Running);
                WorkerAction::None
            }

            (S::Starting, E::Stop) => {
                self.enter(S::Stopping);
                WorkerAction::SendStopSignal
            }

            (S::Running, E::Exit { kind, code }) => {
                self.last_exit = Some((kind, code));
                self.pid = None;
                if policy.should_restart(kind, code) {
                    self.enter(S::Starting);
                    WorkerAction::RequestSpawn
                } else {
                    self.enter(S::Exited);
                    WorkerAction::None
                }
            }

            (S::Running, E::Stop) => {
                self.enter(S::Stopping);
                WorkerAction::SendStopSignal
            }

            (S::Backoff, E::BackoffTimerFired) => {
                self.enter(S::Starting);
                WorkerAction::RequestSpawn
            }

            (S::Backoff, E::Stop) => {
                self.enter(S::Stopped);
                WorkerAction::CancelTimer
            }

            (S::Stopping, E::Exit { kind, code }) => {
                self.last_exit = Some((kind, code));
                self.pid = None;
                self.enter(S::Stopped);
                WorkerAction::CancelTimer
            }

            (S::Stopping, E::StopTimerFired) => WorkerAction::SendKill,

            // Any other (state, event) pair is a no-op: the caller is
            // expected to have already rejected it as invalid-for-state.
            (_, _) => WorkerAction::None,
        }
    }

    fn fail_start_attempt(&mut self, policy: &RestartPolicy) -> WorkerAction {
        self.pid = None;
        self.start_attempts += 1;
        if self.start_attempts >= policy.startretries {
            self.enter(WorkerState::Fatal);
            WorkerAction::None
        } else {
            self.enter(WorkerState::Backoff);
            WorkerAction::ArmBackoffTimer {
                delay: backoff_delay(self.start_attempts),
            }
        }
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_entered_at.elapsed()
    }
}

/// Monotonic non-decreasing backoff: 1s, 2s, 4s, ... capped at 30s, per the
/// need for a monotonic non-decreasing curve, not a specific shape.
fn backoff_delay(attempt: u32) -> std::time::Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let secs = 1u64 << shift;
    std::time::Duration::from_secs(secs.min(30))
}

/// The restart decision inputs a worker needs: its program's `autorestart`
/// mode and `exitcodes` set, plus the retry ceiling. Kept separate from
/// `ProgramSpec` so `Worker::apply` doesn't need to borrow the whole spec.
pub struct RestartPolicy {
    pub autorestart: crate::config::AutoRestart,
    pub exitcodes: Vec<i32>,
    pub startretries: u32,
}

impl RestartPolicy {
    pub fn from_spec(spec: &crate::config::ProgramSpec) -> Self {
        Self {
            autorestart: spec.autorestart,
            exitcodes: spec.exitcodes.clone(),
            startretries: spec.startretries,
        }
    }

    /// The `RUNNING -> exit` autorestart decision table.
    fn should_restart(&self, kind: ExitKind, code: i32) -> bool {
        use crate::config::AutoRestart as A;
        match self.autorestart {
            A::Never => false,
            A::Always => true,
            A::Unexpected => match kind {
                ExitKind::Signaled => true,
                ExitKind::Exited => !self.exitcodes.contains(&code),
            },
        }
    }
}
