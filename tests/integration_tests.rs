//! Integration tests driving the supervisor's event loop against real child
//! processes.
//!
//! These exercise the lifecycle transitions and the reconciler end to end
//! through real `/bin/sh` children: autostart, graceful stop,
//! restart-on-crash, and config reload, rather than through the pure
//! state-machine unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use taskmaster::config::{AutoRestart, Config, ProgramSpec, Signal, StreamSink};
use taskmaster::reaper::Reaper;
use taskmaster::supervisor::{Command, CommandOutcome, CommandRequest, Supervisor, WorkerStatus};
use taskmaster::worker::WorkerState;

fn program(command: Vec<&str>, autostart: bool, autorestart: AutoRestart) -> ProgramSpec {
    ProgramSpec {
        command: command.into_iter().map(String::from).collect(),
        numprocs: 1,
        autostart,
        autorestart,
        exitcodes: vec![0],
        starttime: 0,
        startretries: 3,
        stoptime: 2,
        stopsignal: Signal::Term,
        workingdir: None,
        umask: None,
        env: BTreeMap::new(),
        stdout: StreamSink::Discard,
        stderr: StreamSink::Discard,
        depends_on: vec![],
    }
}

struct Harness {
    command_tx: mpsc::UnboundedSender<CommandRequest>,
}

impl Harness {
    fn start(programs: BTreeMap<String, ProgramSpec>) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let reaper = Reaper::new(exit_tx);
        tokio::spawn(reaper.run());

        let supervisor = Supervisor::new(Config { programs }, exit_rx, timer_tx, timer_rx, command_rx);
        tokio::spawn(supervisor.run());

        Self { command_tx }
    }

    async fn ask(&self, command: Command) -> CommandOutcome {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(CommandRequest { command, reply })
            .expect("supervisor task alive");
        rx.await.expect("supervisor replies")
    }

    async fn status_for(&self, program: &str) -> WorkerStatus {
        let outcome = self
            .ask(Command::Status {
                program: Some(program.to_string()),
            })
            .await;
        let CommandOutcome::Status(mut statuses) = outcome else {
            panic!("expected status outcome");
        };
        statuses.remove(0)
    }
}

/// An autostart program with `starttime: 0` reaches RUNNING on its own,
/// with a pid and no supervisor intervention.
#[tokio::test]
async fn autostart_reaches_running_without_commands() {
    let mut programs = BTreeMap::new();
    programs.insert(
        "sleeper".to_string(),
        program(vec!["/bin/sleep", "5"], true, AutoRestart::Never),
    );
    let harness = Harness::start(programs);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = harness.status_for("sleeper").await;
    assert_eq!(status.state, WorkerState::Running);
    assert!(status.pid.is_some());
}

/// `stop` sends the configured signal and the worker reaches STOPPED
/// once the child actually exits, well before the stop timer would escalate
/// to SIGKILL.
#[tokio::test]
async fn stop_command_gracefully_stops_a_running_worker() {
    let mut programs = BTreeMap::new();
    programs.insert(
        "sleeper".to_string(),
        program(vec!["/bin/sleep", "30"], true, AutoRestart::Never),
    );
    let harness = Harness::start(programs);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcome = harness
        .ask(Command::Stop {
            program: "sleeper".to_string(),
        })
        .await;
    assert!(matches!(outcome, CommandOutcome::Ack));

    // Give the SIGTERM time to land and the reaper time to reap it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = harness.status_for("sleeper").await;
    assert_eq!(status.state, WorkerState::Stopped);
}

/// A program whose command always exits non-zero, with `autorestart:
/// never` and an empty exit code allowlist, lands in EXITED after its first
/// run -- no restart loop.
#[tokio::test]
async fn never_restart_worker_exits_cleanly_after_one_run() {
    let mut programs = BTreeMap::new();
    programs.insert(
        "failer".to_string(),
        program(vec!["/bin/false"], true, AutoRestart::Never),
    );
    let harness = Harness::start(programs);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = harness.status_for("failer").await;
    assert_eq!(status.state, WorkerState::Exited);
}

/// `autorestart: always` keeps respawning a fast-exiting program, so it
/// is never left sitting in a terminal state after a short observation
/// window.
#[tokio::test]
async fn always_restart_worker_keeps_respawning() {
    let mut programs = BTreeMap::new();
    programs.insert(
        "flapper".to_string(),
        program(vec!["/bin/true"], true, AutoRestart::Always),
    );
    let harness = Harness::start(programs);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = harness.status_for("flapper").await;
    assert!(!status.state.is_terminal());
}

/// Repeated spawn failures (nonexistent executable) exhaust
/// `startretries` and the worker lands in FATAL rather than retrying
/// forever.
#[tokio::test]
async fn exhausted_retries_reach_fatal() {
    let mut programs = BTreeMap::new();
    let mut spec = program(vec!["/nonexistent/executable"], true, AutoRestart::Never);
    spec.startretries = 2;
    programs.insert("broken".to_string(), spec);
    let harness = Harness::start(programs);

    // Backoff delays start at 1s; give the two attempts room to exhaust.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let status = harness.status_for("broken").await;
    assert_eq!(status.state, WorkerState::Fatal);
}

/// `reload` with a changed command respawns only the affected program;
/// an unrelated program already running is left untouched.
#[tokio::test]
async fn reload_respawns_only_the_changed_program() {
    let mut programs = BTreeMap::new();
    programs.insert(
        "unchanged".to_string(),
        program(vec!["/bin/sleep", "30"], true, AutoRestart::Never),
    );
    programs.insert(
        "changed".to_string(),
        program(vec!["/bin/sleep", "30"], true, AutoRestart::Never),
    );
    let harness = Harness::start(programs);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let unchanged_pid_before = harness.status_for("unchanged").await.pid;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("reload.yaml");
    std::fs::write(
        &path,
        r#"
programs:
  unchanged:
    command: ["/bin/sleep", "30"]
  changed:
    command: ["/bin/sleep", "31"]
    starttime: 0
"#,
    )
    .expect("write reload config");

    let outcome = harness.ask(Command::Reload { path }).await;
    assert!(matches!(outcome, CommandOutcome::Ack));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let unchanged_pid_after = harness.status_for("unchanged").await.pid;
    assert_eq!(unchanged_pid_before, unchanged_pid_after);

    let changed_status = harness.status_for("changed").await;
    assert_eq!(changed_status.state, WorkerState::Running);
}
