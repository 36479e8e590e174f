//! `taskmaster` binary entry point: parses arguments, loads the
//! configuration, and runs the supervisor until shutdown completes.
//!
//! Grounded on the CLI shape `airssys-wasm-cli` uses for its entry point
//! (a `clap::Parser` struct plus `tracing_subscriber::fmt::init()`), pared
//! down to the single `-f <config>` flag this daemon needs -- there are no
//! subcommands, the REPL is the command surface once it's running.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use taskmaster::clock::TimerFired;
use taskmaster::config::Config;
use taskmaster::reaper::Reaper;
use taskmaster::supervisor::{CommandRequest, Supervisor};
use taskmaster::{control, shutdown};

#[derive(Parser)]
#[command(name = "taskmaster")]
#[command(version, about = "Launches, monitors, and controls a configured set of worker processes", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long = "config", value_name = "PATH")]
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build async runtime");
            return ExitCode::from(3);
        }
    };

    runtime.block_on(run(config, cli.config))
}

async fn run(config: Config, config_path: PathBuf) -> ExitCode {
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel::<TimerFired>();
    let (command_tx, command_rx) = mpsc::unbounded_channel::<CommandRequest>();

    let reaper = Reaper::new(exit_tx);
    let reaper_task = tokio::spawn(reaper.run());

    let supervisor = Supervisor::new(config, exit_rx, timer_tx, timer_rx, command_rx);
    let mut supervisor_task = tokio::spawn(supervisor.run());

    let shutdown_task = tokio::spawn(shutdown::run(command_tx.clone(), config_path.clone()));

    info!(config = %config_path.display(), "taskmaster started");

    let mut control_task = tokio::spawn(control::run(command_tx, config_path));

    // Either side can trigger the exit: the REPL hitting `shutdown`/EOF, or
    // a SIGINT/SIGTERM posting `Command::Shutdown` behind the REPL's back
    // while it's still blocked reading stdin. Whichever finishes first, the
    // other is no longer useful and is torn down rather than left dangling.
    tokio::select! {
        _ = &mut supervisor_task => {
            control_task.abort();
        }
        _ = &mut control_task => {
            let _ = supervisor_task.await;
        }
    }
    reaper_task.abort();
    shutdown_task.abort();

    ExitCode::SUCCESS
}
