//! taskmaster: a process supervisor that launches, monitors, and controls
//! a configured set of worker processes.
//!
//! # Core Components
//!
//! * [`config`] -- the YAML configuration model and program fingerprinting
//! * [`worker`] -- the per-replica lifecycle state machine
//! * [`reconciler`] -- diffs a config reload into worker actions
//! * [`launcher`] -- forks and execs one replica
//! * [`reaper`] -- turns SIGCHLD into normalized exit events
//! * [`streams`] -- resolves stdout/stderr sink configuration to `Stdio`
//! * [`clock`] -- one-shot cancellable per-worker timers
//! * [`supervisor`] -- the event loop that owns every worker record
//! * [`control`] -- the interactive stdin REPL
//! * [`shutdown`] -- OS signal handling and shutdown escalation
//! * [`error`] -- the config/supervisor/spawn error taxonomy

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod launcher;
pub mod reaper;
pub mod reconciler;
pub mod shutdown;
pub mod streams;
pub mod supervisor;
pub mod worker;

pub use config::Config;
pub use error::{ConfigError, SpawnError, SupervisorError};
pub use supervisor::Supervisor;
