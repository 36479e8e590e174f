//! Error taxonomy for the supervisor.
//!
//! Three structured error enums, one per concern named in the error-handling
//! design: configuration, supervisor commands, and process spawning. Each
//! carries enough context to be rendered to the REPL or mapped to a process
//! exit code without any string parsing downstream.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a configuration file.
///
/// `Parse` and `Io` are detected before any worker record exists; `Semantics`
/// is raised by post-parse validation (duplicate names, unknown `depends_on`
/// targets, dependency cycles). All three prevent the new configuration from
/// ever reaching the reconciler, so a reload on a bad file leaves the running
/// set untouched.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file's contents are not valid YAML, or don't match the schema.
    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
    },

    /// The document parsed, but violates a semantic constraint (e.g. an
    /// empty `command`, a `depends_on` referring to an undefined program).
    #[error("config error in program '{program}': {reason}")]
    Semantics { program: String, reason: String },
}

impl ConfigError {
    pub fn semantics(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Semantics {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Maps this error to the CLI exit code documented for config failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Io { .. } | ConfigError::Parse { .. } => 1,
            ConfigError::Semantics { .. } => 2,
        }
    }
}

/// Result type alias for supervisor command handling.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors raised while dispatching a REPL command or reconciling state.
///
/// None of these represent a process crash; they are all "the request made
/// no sense" cases and never mutate a worker record: command errors cause
/// no state change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// `start`/`stop`/`restart` named a program that isn't in the current
    /// configuration.
    #[error("unknown program '{name}'")]
    UnknownProgram { name: String },

    /// The command doesn't apply to the worker's current state (e.g.
    /// `start` on an already-RUNNING worker).
    #[error("program '{name}' is {state}, command has no effect")]
    InvalidForState { name: String, state: &'static str },

    /// The REPL line didn't tokenize into a recognized command.
    #[error("unrecognized command: {reason}")]
    Command { reason: String },
}

/// Result type alias for a single spawn attempt.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// The three spawn failure kinds named by the launcher's contract.
///
/// These never escape as Rust panics or bare `io::Error`s past the launcher
/// boundary: the state machine consumes them as a synthetic early-exit event,
/// identical in effect to a real process dying before `starttime` elapses.
#[derive(Error, Debug, Clone)]
pub enum SpawnError {
    /// `fork`/`posix_spawn` itself failed (resource exhaustion, etc).
    #[error("fork failed for '{command}': {reason}")]
    ForkFailed { command: String, reason: String },

    /// The child was created but `exec` failed before replacing its image
    /// (bad executable path, missing permissions); the child exits 127.
    #[error("exec failed for '{command}': {reason}")]
    ExecFailed { command: String, reason: String },

    /// A configured stdout/stderr sink could not be opened.
    #[error("failed to open sink for '{path}': {reason}")]
    SinkOpenFailed { path: PathBuf, reason: String },
}
