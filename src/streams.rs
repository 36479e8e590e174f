//! Stream Redirection: opens the configured stdout/stderr sinks
//! before fork, in the parent, so a failure surfaces as `SinkOpenFailed`
//! rather than a silently-broken child fd.
//!
//! Grounded on `airssys-osl`'s convention of small, focused functions per
//! operation kind (see `executors/process/spawn.rs`), adapted here to the
//! four sink kinds named in the config model instead of a generic executor
//! trait.

use std::fs::OpenOptions;
use std::process::Stdio;

use crate::config::{FileMode, StreamSink};
use crate::error::SpawnError;

/// The stdout/stderr `Stdio` handles to hand to `std::process::Command`,
/// already resolved from the program's sink configuration.
#[derive(Debug)]
pub struct ResolvedStreams {
    pub stdout: Stdio,
    pub stderr: Stdio,
}

/// Opens a program's configured `stdout` and `stderr` sinks.
///
/// `Combined` opens a single file and duplicates its descriptor for both
/// streams so writes from both fds share one open file description and stay
/// ordered, the same way shell `2>&1` does.
pub fn open_streams(stdout: &StreamSink, stderr: &StreamSink) -> Result<ResolvedStreams, SpawnError> {
    // A `Combined` sink on either side takes priority: both fds must share
    // one open file description, which `open_sink` alone cannot express
    // because it returns independent `Stdio` handles per call. Config
    // validation rejects `stdout`/`stderr` both set to `Combined` with
    // different paths, so whichever branch fires below opens the only
    // path either side could have named.
    if let StreamSink::Combined { path, mode } = stdout {
        let file = open_file(path, *mode)?;
        let dup = file.try_clone().map_err(|err| SpawnError::SinkOpenFailed {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        return Ok(ResolvedStreams {
            stdout: Stdio::from(file),
            stderr: Stdio::from(dup),
        });
    }
    if let StreamSink::Combined { path, mode } = stderr {
        let file = open_file(path, *mode)?;
        let dup = file.try_clone().map_err(|err| SpawnError::SinkOpenFailed {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        return Ok(ResolvedStreams {
            stdout: Stdio::from(dup),
            stderr: Stdio::from(file),
        });
    }

    Ok(ResolvedStreams {
        stdout: open_sink(stdout)?,
        stderr: open_sink(stderr)?,
    })
}

fn open_sink(sink: &StreamSink) -> Result<Stdio, SpawnError> {
    match sink {
        StreamSink::Discard => Ok(Stdio::null()),
        StreamSink::Inherit => Ok(Stdio::inherit()),
        StreamSink::File { path, mode } => Ok(Stdio::from(open_file(path, *mode)?)),
        StreamSink::Combined { .. } => {
            unreachable!("Combined sinks are resolved in open_streams")
        }
    }
}

fn open_file(path: &std::path::Path, mode: FileMode) -> Result<std::fs::File, SpawnError> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true);
    match mode {
        FileMode::Truncate => opts.truncate(true),
        FileMode::Append => opts.append(true),
    };
    opts.open(path).map_err(|err| SpawnError::SinkOpenFailed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn discard_and_inherit_always_succeed() {
        assert!(open_streams(&StreamSink::Discard, &StreamSink::Inherit).is_ok());
    }

    #[test]
    fn file_sink_opens_truncate_and_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.log");
        let sink = StreamSink::File {
            path: path.clone(),
            mode: FileMode::Truncate,
        };
        assert!(open_streams(&sink, &StreamSink::Discard).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn combined_sink_shares_one_file_description() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("combined.log");
        let sink = StreamSink::Combined {
            path,
            mode: FileMode::Truncate,
        };
        let resolved = open_streams(&sink, &StreamSink::Discard);
        assert!(resolved.is_ok());
    }

    #[test]
    fn unwritable_sink_path_surfaces_sink_open_failed() {
        let sink = StreamSink::File {
            path: std::path::PathBuf::from("/nonexistent-dir-xyz/out.log"),
            mode: FileMode::Truncate,
        };
        let err = open_streams(&sink, &StreamSink::Discard).unwrap_err();
        assert!(matches!(err, SpawnError::SinkOpenFailed { .. }));
    }
}
