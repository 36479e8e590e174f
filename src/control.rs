//! Interactive control REPL: reads lines from stdin, tokenizes them
//! into a `Command`, and posts each one onto the Supervisor Core's shared
//! command queue, printing whatever outcome comes back.
//!
//! Grounded on `airssys-osl`'s preference for small, composable functions
//! over a single do-everything loop: tokenizing, dispatching, and rendering
//! are three separate functions here so each is independently testable.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::supervisor::{Command, CommandOutcome, CommandRequest, WorkerStatus};

/// Runs the REPL against stdin until EOF, which is treated the same as an
/// explicit `shutdown`: the process should not keep running headless just
/// because its controlling terminal went away.
pub async fn run(command_tx: mpsc::UnboundedSender<CommandRequest>, config_path: PathBuf) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                send(&command_tx, Command::Shutdown).await;
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "error reading from stdin");
                return;
            }
        };

        match parse_line(&line, &config_path) {
            Ok(None) => continue, // blank line
            Ok(Some(command)) => {
                let shut_down = matches!(command, Command::Shutdown);
                let outcome = send(&command_tx, command).await;
                render(&outcome);
                if shut_down {
                    return;
                }
            }
            Err(usage) => println!("{usage}"),
        }
    }
}

/// Tokenizes one REPL line into a `Command`. Returns `Ok(None)` for a blank
/// line (no state change, no output) and `Err(usage)` for anything that
/// doesn't match a known verb -- an unrecognized command must never mutate
/// state.
fn parse_line(line: &str, config_path: &PathBuf) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let verb = match words.next() {
        Some(verb) => verb,
        None => return Ok(None),
    };
    let rest: Vec<&str> = words.collect();

    match verb {
        "status" => Ok(Some(Command::Status {
            program: rest.first().map(|s| s.to_string()),
        })),
        "start" => require_program(&rest, verb).map(|program| Some(Command::Start { program })),
        "stop" => require_program(&rest, verb).map(|program| Some(Command::Stop { program })),
        "restart" => {
            require_program(&rest, verb).map(|program| Some(Command::Restart { program }))
        }
        "reload" => Ok(Some(Command::Reload {
            path: config_path.clone(),
        })),
        "shutdown" | "quit" | "exit" => Ok(Some(Command::Shutdown)),
        other => Err(format!(
            "unrecognized command '{other}' (try: status [program] | start <program> | stop <program> | restart <program> | reload | shutdown)"
        )),
    }
}

fn require_program(rest: &[&str], verb: &str) -> Result<String, String> {
    rest.first()
        .map(|s| s.to_string())
        .ok_or_else(|| format!("usage: {verb} <program>"))
}

async fn send(command_tx: &mpsc::UnboundedSender<CommandRequest>, command: Command) -> CommandOutcome {
    let (reply, rx) = oneshot::channel();
    if command_tx.send(CommandRequest { command, reply }).is_err() {
        return CommandOutcome::Error(crate::error::SupervisorError::Command {
            reason: "supervisor core is no longer running".to_string(),
        });
    }
    rx.await.unwrap_or(CommandOutcome::Error(
        crate::error::SupervisorError::Command {
            reason: "supervisor core dropped the reply channel".to_string(),
        },
    ))
}

fn render(outcome: &CommandOutcome) {
    match outcome {
        CommandOutcome::Status(statuses) => {
            for status in statuses {
                println!("{}", format_status(status));
            }
        }
        CommandOutcome::Ack => println!("ok"),
        CommandOutcome::ShuttingDown => println!("supervisor is shutting down"),
        CommandOutcome::ConfigError(reason) => println!("reload failed: {reason}"),
        CommandOutcome::Error(err) => println!("error: {err}"),
    }
}

fn format_status(status: &WorkerStatus) -> String {
    let started = status
        .started_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    match status.pid {
        Some(pid) => format!(
            "{:<24} {:<10} pid={pid} uptime={}s started={started}",
            status.key.to_string(),
            status.state.as_str(),
            status.uptime.as_secs()
        ),
        None => format!(
            "{:<24} {:<10} uptime={}s started={started}",
            status.key.to_string(),
            status.state.as_str(),
            status.uptime.as_secs()
        ),
    }
}
