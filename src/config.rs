//! Configuration model: the validated value produced by parsing a config
//! file, plus the fingerprint used by the reconciler to decide respawn.
//!
//! Grounded on the `christophermaier-habitat` supervisor's YAML-driven
//! service manifests, and structured the way `airssys-osl`'s `core::result`
//! types are: plain serde data types with constructor/validation methods,
//! no builder-pattern ceremony since every field is required-or-defaulted
//! up front by `#[serde(default)]`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConfigError, ConfigResult};

/// Top-level configuration document: program name -> program spec.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub programs: BTreeMap<String, ProgramSpec>,
}

impl Config {
    /// Loads and validates a configuration file from disk.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses and validates a configuration document from a string.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        for (name, spec) in &self.programs {
            if spec.command.is_empty() {
                return Err(ConfigError::semantics(name, "command must not be empty"));
            }
            if spec.numprocs == 0 {
                return Err(ConfigError::semantics(name, "numprocs must be >= 1"));
            }
            for dep in &spec.depends_on {
                if !self.programs.contains_key(dep) {
                    return Err(ConfigError::semantics(
                        name,
                        format!("depends_on references unknown program '{dep}'"),
                    ));
                }
            }
            if let (StreamSink::Combined { path: out_path, .. }, StreamSink::Combined { path: err_path, .. }) =
                (&spec.stdout, &spec.stderr)
            {
                if out_path != err_path {
                    return Err(ConfigError::semantics(
                        name,
                        "stdout and stderr cannot both be 'combined' with different paths",
                    ));
                }
            }
        }
        self.check_dependency_cycles()?;
        Ok(())
    }

    /// `depends_on` is parsed and validated but does not influence start
    /// ordering; a cycle is still rejected as a semantics error because it
    /// can never be satisfied by any future ordering-aware extension.
    fn check_dependency_cycles(&self) -> ConfigResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            name: &'a str,
            programs: &'a BTreeMap<String, ProgramSpec>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), String> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(name.to_string()),
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(spec) = programs.get(name) {
                for dep in &spec.depends_on {
                    visit(dep, programs, marks)?;
                }
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        for name in self.programs.keys() {
            if let Err(cycle_at) = visit(name, &self.programs, &mut marks) {
                return Err(ConfigError::semantics(
                    cycle_at.clone(),
                    "depends_on forms a cycle",
                ));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_numprocs() -> u32 {
    1
}

fn default_starttime() -> u64 {
    1
}

fn default_startretries() -> u32 {
    3
}

fn default_stoptime() -> u64 {
    10
}

fn default_stopsignal() -> Signal {
    Signal::Term
}

fn default_exitcodes() -> Vec<i32> {
    vec![0]
}

fn default_stream() -> StreamSink {
    StreamSink::Discard
}

/// A single program's immutable specification, as produced by the config
/// parser. See `Config::validate` for the semantic checks applied on load.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProgramSpec {
    /// argv; `command[0]` is the executable path.
    pub command: Vec<String>,

    #[serde(default = "default_numprocs")]
    pub numprocs: u32,

    #[serde(default = "default_true")]
    pub autostart: bool,

    #[serde(default)]
    pub autorestart: AutoRestart,

    #[serde(default = "default_exitcodes")]
    pub exitcodes: Vec<i32>,

    #[serde(default = "default_starttime")]
    pub starttime: u64,

    #[serde(default = "default_startretries")]
    pub startretries: u32,

    #[serde(default = "default_stoptime")]
    pub stoptime: u64,

    #[serde(default = "default_stopsignal")]
    pub stopsignal: Signal,

    #[serde(default)]
    pub workingdir: Option<PathBuf>,

    #[serde(default)]
    pub umask: Option<u32>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_stream")]
    pub stdout: StreamSink,

    #[serde(default = "default_stream")]
    pub stderr: StreamSink,

    /// Inert metadata: validated at load time (no cycles, all names exist)
    /// but does not change start ordering.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ProgramSpec {
    /// Deterministic digest over the fields that affect the running process
    /// image: command, env, workingdir, umask, numprocs, stream
    /// bindings, stopsignal. Monitoring-only fields (autostart, autorestart,
    /// exitcodes, startretries, starttime, stoptime) are deliberately
    /// excluded: changing only those must never trigger a respawn.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.command.join("\u{1}").as_bytes());
        hasher.update(self.numprocs.to_le_bytes());
        for (k, v) in &self.env {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        if let Some(dir) = &self.workingdir {
            hasher.update(dir.to_string_lossy().as_bytes());
        }
        if let Some(mask) = self.umask {
            hasher.update(mask.to_le_bytes());
        }
        hasher.update([self.stopsignal as u8]);
        hasher.update(format!("{:?}", self.stdout).as_bytes());
        hasher.update(format!("{:?}", self.stderr).as_bytes());

        let digest = hasher.finalize();
        u64::from_le_bytes(digest[0..8].try_into().unwrap_or([0; 8]))
    }
}

/// Restart policy applied when a RUNNING worker exits.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    Never,
    Always,
    #[default]
    Unexpected,
}

/// POSIX signal used to request a graceful stop.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Term,
    Int,
    Hup,
    Usr1,
    Usr2,
    Quit,
}

impl Signal {
    /// Maps to the `nix::sys::signal::Signal` sent to the process group.
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as NixSignal;
        match self {
            Signal::Term => NixSignal::SIGTERM,
            Signal::Int => NixSignal::SIGINT,
            Signal::Hup => NixSignal::SIGHUP,
            Signal::Usr1 => NixSignal::SIGUSR1,
            Signal::Usr2 => NixSignal::SIGUSR2,
            Signal::Quit => NixSignal::SIGQUIT,
        }
    }
}

/// One of the four stream-redirection sink kinds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamSink {
    Discard,
    Inherit,
    File { path: PathBuf, mode: FileMode },
    Combined { path: PathBuf, mode: FileMode },
}

/// How a `File`/`Combined` sink opens its target path.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    Truncate,
    Append,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    const SAMPLE: &str = r#"
programs:
  sleeper:
    command: ["/bin/sleep", "300"]
    numprocs: 1
    autostart: true
    autorestart: always
    starttime: 1
    stdout:
      kind: file
      path: /tmp/sleeper.out
      mode: append
    stderr: discard
"#;

    #[test]
    fn parses_sample_document() {
        let config = Config::parse(SAMPLE).expect("valid config");
        let spec = config.programs.get("sleeper").expect("sleeper program");
        assert_eq!(spec.command, vec!["/bin/sleep", "300"]);
        assert_eq!(spec.autorestart, AutoRestart::Always);
        assert_eq!(spec.startretries, 3); // default
        assert_eq!(spec.stopsignal, Signal::Term); // default
    }

    #[test]
    fn rejects_empty_command() {
        let doc = "programs:\n  bad:\n    command: []\n";
        let err = Config::parse(doc).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rejects_mismatched_combined_sinks() {
        let doc = "\
programs:
  bad:
    command: [\"/bin/true\"]
    stdout:
      kind: combined
      path: /tmp/a.log
      mode: append
    stderr:
      kind: combined
      path: /tmp/b.log
      mode: append
";
        let err = Config::parse(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Semantics { .. }));
    }

    #[test]
    fn accepts_matching_combined_sinks() {
        let doc = "\
programs:
  ok:
    command: [\"/bin/true\"]
    stdout:
      kind: combined
      path: /tmp/a.log
      mode: append
    stderr:
      kind: combined
      path: /tmp/a.log
      mode: append
";
        assert!(Config::parse(doc).is_ok());
    }

    #[test]
    fn rejects_unknown_depends_on() {
        let doc = "programs:\n  a:\n    command: [\"/bin/true\"]\n    depends_on: [\"b\"]\n";
        let err = Config::parse(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Semantics { .. }));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let doc = "\
programs:
  a:
    command: [\"/bin/true\"]
    depends_on: [\"b\"]
  b:
    command: [\"/bin/true\"]
    depends_on: [\"a\"]
";
        let err = Config::parse(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Semantics { .. }));
    }

    #[test]
    fn fingerprint_ignores_monitoring_fields() {
        let mut spec = ProgramSpec {
            command: vec!["/bin/true".into()],
            numprocs: 1,
            autostart: true,
            autorestart: AutoRestart::Never,
            exitcodes: vec![0],
            starttime: 1,
            startretries: 3,
            stoptime: 10,
            stopsignal: Signal::Term,
            workingdir: None,
            umask: None,
            env: BTreeMap::new(),
            stdout: StreamSink::Discard,
            stderr: StreamSink::Discard,
            depends_on: vec![],
        };
        let before = spec.fingerprint();
        spec.autorestart = AutoRestart::Always;
        spec.exitcodes = vec![0, 1];
        spec.startretries = 10;
        spec.starttime = 5;
        spec.stoptime = 30;
        let after = spec.fingerprint();
        assert_eq!(before, after, "monitoring-only change must not respawn");
    }

    #[test]
    fn fingerprint_changes_with_command() {
        let a = ProgramSpec {
            command: vec!["/bin/true".into()],
            numprocs: 1,
            autostart: true,
            autorestart: AutoRestart::Never,
            exitcodes: vec![0],
            starttime: 1,
            startretries: 3,
            stoptime: 10,
            stopsignal: Signal::Term,
            workingdir: None,
            umask: None,
            env: BTreeMap::new(),
            stdout: StreamSink::Discard,
            stderr: StreamSink::Discard,
            depends_on: vec![],
        };
        let mut b = a.clone();
        b.command = vec!["/bin/false".into()];
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
