//! OS signal wiring: translates SIGINT/SIGTERM/SIGHUP into
//! `Command`s posted onto the same queue the REPL uses, so the Supervisor
//! Core's priority ordering (exits, then timers, then commands) applies to
//! them unchanged.
//!
//! Grounded on `reaper.rs`'s use of `tokio::signal::unix` as the self-pipe
//! for SIGCHLD; this module does the same for the three signals a
//! supervisor process is expected to answer to.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::supervisor::{Command, CommandRequest};

/// Listens for SIGINT/SIGTERM/SIGHUP and posts the corresponding command.
///
/// SIGINT and SIGTERM both request a graceful shutdown; a *second* one of
/// either, received while a shutdown is already underway, escalates to an
/// immediate SIGKILL of every remaining worker rather than waiting out
/// their stop timers. SIGHUP requests a config reload from `config_path`.
pub async fn run(command_tx: mpsc::UnboundedSender<CommandRequest>, config_path: std::path::PathBuf) {
    let (mut sigint, mut sigterm, mut sighup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => {
            tracing::warn!("failed to install signal handlers");
            return;
        }
    };

    let mut shutdown_requested = false;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                handle_termination_signal(&command_tx, &mut shutdown_requested, "SIGINT").await;
            }
            _ = sigterm.recv() => {
                handle_termination_signal(&command_tx, &mut shutdown_requested, "SIGTERM").await;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                post(&command_tx, Command::Reload { path: config_path.clone() }).await;
            }
        }
    }
}

async fn handle_termination_signal(
    command_tx: &mpsc::UnboundedSender<CommandRequest>,
    shutdown_requested: &mut bool,
    name: &str,
) {
    if *shutdown_requested {
        info!(signal = name, "second termination signal, escalating to kill");
        post(command_tx, Command::EscalateKill).await;
    } else {
        info!(signal = name, "termination signal received, shutting down");
        *shutdown_requested = true;
        post(command_tx, Command::Shutdown).await;
    }
}

/// Posts a command and discards its reply; nothing in this module reads
/// the outcome of a signal-triggered command.
async fn post(command_tx: &mpsc::UnboundedSender<CommandRequest>, command: Command) {
    let (reply, _rx) = oneshot::channel();
    let _ = command_tx.send(CommandRequest { command, reply });
}
