//! Supervisor Core: the single event loop that owns every worker
//! record and is the only place that performs process I/O (spawn, signal,
//! timer arming). Three queues feed it -- exit events, timer firings, and
//! commands -- polled in that strict priority order with `tokio::select!
//! { biased; ... }` so exit events beat timer firings beat commands: a
//! dying child is always reflected before a stale command can act on it.
//!
//! Grounded on `airssys-osl`'s single entry-point-per-concern shape: the
//! core never embeds spawn/signal/timer logic inline, it calls into
//! `launcher`, `clock`, and `nix::sys::signal` the same way an `OSExecutor`
//! delegates to its backing syscalls.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{kill, Signal as NixSignal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::clock::{Clock, TimerFired, TimerPurpose};
use crate::config::{Config, ProgramSpec};
use crate::error::SupervisorError;
use crate::launcher;
use crate::reaper::ExitEvent;
use crate::reconciler::{self, ReconcileAction};
use crate::worker::{RestartPolicy, Worker, WorkerAction, WorkerEvent, WorkerKey, WorkerState};

/// A REPL- or signal-originated request. `Shutdown`/`EscalateKill` are also
/// posted through this channel by the signal-handling task, so the
/// core has exactly one place that orders commands against exits and
/// timers.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status { program: Option<String> },
    Start { program: String },
    Stop { program: String },
    Restart { program: String },
    Reload { path: PathBuf },
    Shutdown,
    EscalateKill,
}

/// A command plus where to send its outcome. Internally generated commands
/// (shutdown escalation) may pair this with a reply channel nobody reads.
pub struct CommandRequest {
    pub command: Command,
    pub reply: oneshot::Sender<CommandOutcome>,
}

/// A worker's status line, as reported by `Command::Status`.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub key: WorkerKey,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub uptime: Duration,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// What a command produced, returned to the REPL for rendering.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Status(Vec<WorkerStatus>),
    Ack,
    Error(SupervisorError),
    ConfigError(String),
    ShuttingDown,
}

/// Owns every worker, the current program specs, and the timer service.
/// `run` consumes `self` and drives the process until shutdown completes.
pub struct Supervisor {
    specs: BTreeMap<String, ProgramSpec>,
    workers: BTreeMap<WorkerKey, Worker>,
    pid_index: HashMap<u32, WorkerKey>,
    pending_removal: HashSet<WorkerKey>,
    pending_respawn: HashSet<WorkerKey>,
    clock: Clock,
    exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    command_rx: mpsc::UnboundedReceiver<CommandRequest>,
    shutdown_pending: HashSet<WorkerKey>,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new(
        config: Config,
        exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
        timer_tx: mpsc::UnboundedSender<TimerFired>,
        timer_rx: mpsc::UnboundedReceiver<TimerFired>,
        command_rx: mpsc::UnboundedReceiver<CommandRequest>,
    ) -> Self {
        let mut workers = BTreeMap::new();
        let mut autostart_keys = Vec::new();
        for (name, spec) in &config.programs {
            for replica in 0..spec.numprocs {
                let key = WorkerKey::new(name.clone(), replica);
                workers.insert(key.clone(), Worker::new(key.clone()));
                if spec.autostart {
                    autostart_keys.push(key);
                }
            }
        }
        let mut supervisor = Self {
            specs: config.programs,
            workers,
            pid_index: HashMap::new(),
            pending_removal: HashSet::new(),
            pending_respawn: HashSet::new(),
            clock: Clock::new(timer_tx),
            exit_rx,
            timer_rx,
            command_rx,
            shutdown_pending: HashSet::new(),
            shutting_down: false,
        };

        for key in autostart_keys {
            supervisor.dispatch_event(&key, WorkerEvent::Start);
        }
        supervisor
    }

    /// The main loop. Returns once shutdown has stopped every worker.
    pub async fn run(mut self) {
        loop {
            if self.shutting_down && self.shutdown_pending.is_empty() {
                info!("all workers stopped, shutdown complete");
                return;
            }

            tokio::select! {
                biased;

                Some(event) = self.exit_rx.recv() => {
                    self.handle_exit(event);
                }

                Some(fired) = self.timer_rx.recv() => {
                    self.handle_timer(fired);
                }

                Some(request) = self.command_rx.recv() => {
                    let outcome = self.handle_command(request.command);
                    let _ = request.reply.send(outcome);
                }

                else => {
                    warn!("all supervisor input channels closed");
                    return;
                }
            }
        }
    }

    fn handle_exit(&mut self, event: ExitEvent) {
        let Some(key) = self.pid_index.remove(&event.pid) else {
            warn!(pid = event.pid, "reaped pid with no matching worker");
            return;
        };
        self.dispatch_event(
            &key,
            WorkerEvent::Exit {
                kind: event.kind,
                code: event.code_or_signal,
            },
        );
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        let event = match fired.purpose {
            TimerPurpose::Startup => WorkerEvent::StartupTimerFired,
            TimerPurpose::Stop => WorkerEvent::StopTimerFired,
            TimerPurpose::Backoff => WorkerEvent::BackoffTimerFired,
        };
        self.dispatch_event(&fired.key, event);
    }

    fn handle_command(&mut self, command: Command) -> CommandOutcome {
        if self.shutting_down && !matches!(command, Command::Status { .. } | Command::EscalateKill) {
            return CommandOutcome::ShuttingDown;
        }

        match command {
            Command::Status { program } => CommandOutcome::Status(self.status(program.as_deref())),
            Command::Start { program } => self.command_on_program(&program, WorkerEvent::Start),
            Command::Stop { program } => self.command_on_program(&program, WorkerEvent::Stop),
            Command::Restart { program } => self.restart_program(&program),
            Command::Reload { path } => self.reload(&path),
            Command::Shutdown => {
                self.begin_shutdown();
                CommandOutcome::Ack
            }
            Command::EscalateKill => {
                self.escalate_kill();
                CommandOutcome::Ack
            }
        }
    }

    fn status(&self, program: Option<&str>) -> Vec<WorkerStatus> {
        self.workers
            .values()
            .filter(|w| program.is_none_or(|p| w.key.program == p))
            .map(|w| WorkerStatus {
                key: w.key.clone(),
                state: w.state,
                pid: w.pid,
                uptime: w.time_in_state(),
                started_at: w.started_at,
            })
            .collect()
    }

    fn command_on_program(&mut self, program: &str, event: WorkerEvent) -> CommandOutcome {
        if !self.specs.contains_key(program) {
            return CommandOutcome::Error(SupervisorError::UnknownProgram {
                name: program.to_string(),
            });
        }
        let keys: Vec<WorkerKey> = self
            .workers
            .keys()
            .filter(|k| k.program == program)
            .cloned()
            .collect();
        if keys.is_empty() {
            return CommandOutcome::Error(SupervisorError::UnknownProgram {
                name: program.to_string(),
            });
        }
        for key in &keys {
            if !self.event_applies(key, &event) {
                return CommandOutcome::Error(SupervisorError::InvalidForState {
                    name: program.to_string(),
                    state: self.workers[key].state.as_str(),
                });
            }
        }
        for key in keys {
            self.dispatch_event(&key, event.clone());
        }
        CommandOutcome::Ack
    }

    fn restart_program(&mut self, program: &str) -> CommandOutcome {
        if !self.specs.contains_key(program) {
            return CommandOutcome::Error(SupervisorError::UnknownProgram {
                name: program.to_string(),
            });
        }
        let keys: Vec<WorkerKey> = self
            .workers
            .keys()
            .filter(|k| k.program == program)
            .cloned()
            .collect();
        for key in keys {
            let terminal = self
                .workers
                .get(&key)
                .map(|w| w.state.is_terminal())
                .unwrap_or(true);
            if terminal {
                self.dispatch_event(&key, WorkerEvent::Start);
            } else {
                self.pending_respawn.insert(key.clone());
                self.dispatch_event(&key, WorkerEvent::Stop);
            }
        }
        CommandOutcome::Ack
    }

    /// Whether `event` is valid to apply given the worker's current state,
    /// per the transitions `Worker::apply` actually implements. Kept
    /// here rather than in `worker` so the state machine itself never needs
    /// to know about command rejection semantics.
    fn event_applies(&self, key: &WorkerKey, event: &WorkerEvent) -> bool {
        let Some(worker) = self.workers.get(key) else {
            return false;
        };
        use WorkerState as S;
        matches!(
            (worker.state, event),
            (S::Stopped | S::Fatal | S::Exited, WorkerEvent::Start)
                | (S::Starting | S::Running, WorkerEvent::Stop)
                | (S::Backoff, WorkerEvent::Stop)
        )
    }

    fn reload(&mut self, path: &PathBuf) -> CommandOutcome {
        let new_config = match Config::load(path) {
            Ok(c) => c,
            Err(err) => return CommandOutcome::ConfigError(err.to_string()),
        };

        let mut existing_replicas: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for key in self.workers.keys() {
            existing_replicas
                .entry(key.program.clone())
                .or_default()
                .push(key.replica);
        }

        let actions = reconciler::reconcile(&self.specs, &new_config.programs, &existing_replicas);
        self.specs = new_config.programs;

        for action in actions {
            self.apply_reconcile_action(action);
        }

        CommandOutcome::Ack
    }

    fn apply_reconcile_action(&mut self, action: ReconcileAction) {
        match action {
            ReconcileAction::CreateWorker { key, autostart } => {
                if !self.specs.contains_key(&key.program) {
                    return;
                }
                self.workers
                    .entry(key.clone())
                    .or_insert_with(|| Worker::new(key.clone()));
                if autostart {
                    self.dispatch_event(&key, WorkerEvent::Start);
                }
            }
            ReconcileAction::RemoveWorker { key } => {
                let terminal = self
                    .workers
                    .get(&key)
                    .map(|w| w.state.is_terminal())
                    .unwrap_or(true);
                if terminal {
                    self.workers.remove(&key);
                } else {
                    self.pending_removal.insert(key.clone());
                    self.dispatch_event(&key, WorkerEvent::Stop);
                }
            }
            ReconcileAction::RespawnWorker { key } => {
                if !self.specs.contains_key(&key.program) {
                    return;
                }
                let terminal = self
                    .workers
                    .get(&key)
                    .map(|w| w.state.is_terminal())
                    .unwrap_or(true);
                if terminal {
                    self.dispatch_event(&key, WorkerEvent::Start);
                } else {
                    self.pending_respawn.insert(key.clone());
                    self.dispatch_event(&key, WorkerEvent::Stop);
                }
            }
            ReconcileAction::LeaveRunning { .. } => {}
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let keys: Vec<WorkerKey> = self.workers.keys().cloned().collect();
        for key in keys {
            let non_terminal = self
                .workers
                .get(&key)
                .map(|w| !w.state.is_terminal())
                .unwrap_or(false);
            if non_terminal {
                self.shutdown_pending.insert(key.clone());
                self.dispatch_event(&key, WorkerEvent::Stop);
            }
        }
    }

    /// The second shutdown signal: skip the graceful stop timers and
    /// send SIGKILL to every remaining worker's process group immediately.
    fn escalate_kill(&mut self) {
        let keys: Vec<WorkerKey> = self.shutdown_pending.iter().cloned().collect();
        for key in keys {
            if let Some(pid) = self.workers.get(&key).and_then(|w| w.pid) {
                send_signal(pid, NixSignal::SIGKILL);
            }
            self.clock.cancel_all(&key);
        }
    }

    /// Runs one event through a worker's state machine and carries out the
    /// resulting action. This is the only place I/O side effects happen.
    fn dispatch_event(&mut self, key: &WorkerKey, event: WorkerEvent) {
        let Some(spec) = self.specs.get(&key.program).cloned() else {
            warn!(%key, "event for worker with no matching program spec");
            return;
        };
        let policy = RestartPolicy::from_spec(&spec);
        let Some(worker) = self.workers.get_mut(key) else {
            return;
        };
        let was_non_terminal = !worker.state.is_terminal();
        let action = worker.apply(event, &policy);
        let now_terminal = worker.state.is_terminal();
        self.carry_out_action(key, &spec, action);

        if was_non_terminal && now_terminal {
            self.on_worker_terminal(key);
        }
    }

    fn carry_out_action(&mut self, key: &WorkerKey, spec: &ProgramSpec, action: WorkerAction) {
        match action {
            WorkerAction::None => {}

            WorkerAction::RequestSpawn => {
                let replica = key.replica;
                match launcher::spawn(spec, replica) {
                    Ok(handle) => {
                        self.pid_index.insert(handle.pid, key.clone());
                        if let Some(worker) = self.workers.get_mut(key) {
                            worker.pid = Some(handle.pid);
                            worker.spawned_at = Some(handle.spawned_at);
                            worker.started_at = Some(chrono::Utc::now());
                        }
                        // `handle.child` is dropped here without calling
                        // `.wait()`: dropping a `std::process::Child` closes
                        // its stdio handles but never reaps it. The Child
                        // Reaper is the sole `waitpid` caller for this pid.
                        drop(handle.child);
                        self.clock.arm(
                            key.clone(),
                            TimerPurpose::Startup,
                            Duration::from_secs(spec.starttime),
                        );
                    }
                    Err(err) => {
                        warn!(%key, %err, "spawn failed");
                        self.dispatch_event(key, WorkerEvent::SpawnFailed);
                    }
                }
            }

            WorkerAction::ArmBackoffTimer { delay } => {
                self.clock.arm(key.clone(), TimerPurpose::Backoff, delay);
            }

            WorkerAction::SendStopSignal => {
                if let Some(pid) = self.workers.get(key).and_then(|w| w.pid) {
                    send_signal(pid, spec.stopsignal.as_nix());
                }
                // A worker stopped out of STARTING still has its startup
                // timer armed; cancel it so at most one timer is ever
                // pending per worker. A no-op when stopped out of RUNNING,
                // where no startup timer exists.
                self.clock.cancel(key, TimerPurpose::Startup);
                self.clock.arm(
                    key.clone(),
                    TimerPurpose::Stop,
                    Duration::from_secs(spec.stoptime),
                );
            }

            WorkerAction::SendKill => {
                if let Some(pid) = self.workers.get(key).and_then(|w| w.pid) {
                    send_signal(pid, NixSignal::SIGKILL);
                }
            }

            WorkerAction::CancelTimer => {
                self.clock.cancel_all(key);
            }
        }
    }

    /// Runs the bookkeeping that only fires the moment a worker *becomes*
    /// terminal: dropping it from the pid index, finishing a pending
    /// removal/respawn/shutdown, or -- note this only triggers when the
    /// terminal transition was just crossed, not on every already-terminal
    /// event -- nothing at all otherwise.
    fn on_worker_terminal(&mut self, key: &WorkerKey) {
        self.shutdown_pending.remove(key);

        if self.pending_removal.remove(key) {
            self.workers.remove(key);
            return;
        }

        if self.pending_respawn.remove(key) {
            self.dispatch_event(key, WorkerEvent::Start);
        }
    }
}

fn send_signal(pid: u32, signal: NixSignal) {
    // Every child is placed in its own process group by the launcher
    // so signalling the negated pid reaches every descendant too.
    let pgid = Pid::from_raw(-(pid as i32));
    if let Err(err) = kill(pgid, signal) {
        warn!(pid, %signal, %err, "failed to signal process group");
    }
}
