//! Process Launcher: stateless -- given a resolved spawn request,
//! forks a child with the requested working directory, umask, environment,
//! and redirected streams, and returns a child handle or a classified
//! `SpawnError`.
//!
//! Grounded on `airssys-osl`'s `executors/process/spawn.rs`, which builds a
//! command the same way; extended here with a `pre_exec` hook (the
//! `nix`-based approach `airssys-osl`'s signal executor already depends on
//! `nix` for) to place the child in its own process group before `exec`, as
//! required so the supervisor can signal the whole group.
//!
//! Deliberately built on `std::process::Command`, not `tokio::process`: the
//! Child Reaper is the sole owner of `waitpid` for every child this
//! process spawns. Tokio's own process driver runs a second, independent
//! SIGCHLD-triggered reap loop for any `tokio::process::Child` it manages,
//! which would race our reaper for the same pids. Spawning is a single
//! fork+exec either way, so there is no async benefit to `tokio::process`
//! once we own the wait loop ourselves.

use std::collections::BTreeMap;
use std::os::unix::process::CommandExt as _;
use std::process::{Child, Command};

use tracing::debug;

use crate::config::ProgramSpec;
use crate::error::SpawnError;
use crate::streams::open_streams;

/// A live child process, as handed back to the Supervisor Core. The `Child`
/// handle is kept only to retain ownership of the process's stdio pipes
/// (when not redirected to a file/null) -- `.wait()` is never called on it;
/// the Child Reaper does all reaping.
#[derive(Debug)]
pub struct ChildHandle {
    pub pid: u32,
    pub child: Child,
    pub spawned_at: std::time::Instant,
}

/// Spawns one replica of `spec`. Stream sinks are opened in the caller
/// (parent) process before this is called.
pub fn spawn(spec: &ProgramSpec, replica_index: u32) -> Result<ChildHandle, SpawnError> {
    let command_name = spec.command.first().cloned().unwrap_or_default();
    let streams = open_streams(&spec.stdout, &spec.stderr)?;

    if let Some(dir) = &spec.workingdir {
        if !dir.is_dir() {
            return Err(SpawnError::ExecFailed {
                command: command_name,
                reason: format!("working directory does not exist: {}", dir.display()),
            });
        }
    }

    let mut cmd = Command::new(&command_name);
    cmd.args(&spec.command[1..]);
    cmd.env_clear();
    cmd.envs(env_with_replica(&spec.env, replica_index));
    cmd.stdout(streams.stdout);
    cmd.stderr(streams.stderr);
    cmd.stdin(std::process::Stdio::null());

    if let Some(dir) = &spec.workingdir {
        cmd.current_dir(dir);
    }

    let umask = spec.umask;

    // SAFETY: the closure only calls async-signal-safe functions (setsid,
    // umask) between fork and exec, as required by `pre_exec`'s contract.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            if let Some(mask) = umask {
                nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(mask as _));
            }
            Ok(())
        });
    }

    let spawned_at = std::time::Instant::now();
    let child = cmd.spawn().map_err(|err| {
        // `ENOENT`/`EACCES` looking up the executable surfaces through
        // `spawn()` itself on Unix (the exec happens in the child, but the
        // parent's posix_spawn-style path resolution fails first for these
        // two kinds); anything else is treated as the fork itself failing.
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
        ) {
            SpawnError::ExecFailed {
                command: command_name.clone(),
                reason: err.to_string(),
            }
        } else {
            SpawnError::ForkFailed {
                command: command_name.clone(),
                reason: err.to_string(),
            }
        }
    })?;

    let pid = child.id();
    debug!(pid, command = %command_name, replica_index, "spawned worker");
    Ok(ChildHandle {
        pid,
        child,
        spawned_at,
    })
}

fn env_with_replica(
    env: &BTreeMap<String, String>,
    replica_index: u32,
) -> BTreeMap<String, String> {
    let mut merged = env.clone();
    merged.insert("TASKMASTER_REPLICA".to_string(), replica_index.to_string());
    merged
}
