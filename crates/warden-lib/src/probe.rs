//! Process liveness probing
//!
//! Reads the OS process table to decide whether a PID still belongs to the
//! process we expect. The command line is compared against an expected
//! signature so a recycled PID never reads as alive.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default process table location
const DEFAULT_PROC_ROOT: &str = "/proc";

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Zombie,
    NotFound,
    /// The PID is running a different program (PID reuse)
    SignatureMismatch,
    /// The process table could not be read; callers must not act on this
    Unknown,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }

    /// Definitely gone: safe to treat the owner as dead
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Liveness::Zombie | Liveness::NotFound | Liveness::SignatureMismatch
        )
    }
}

/// Trait for liveness probe implementations
pub trait LivenessProbe: Send + Sync {
    /// Check a PID, optionally matching its command line against a signature
    fn is_alive(&self, pid: u32, expected_signature: Option<&str>) -> Liveness;
}

/// Probe backed by a procfs-style directory tree
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    proc_root: PathBuf,
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcfsProbe {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn read_state(&self, pid: u32) -> Result<Option<char>, ErrorKind> {
        let stat_path = self.proc_root.join(pid.to_string()).join("stat");
        match std::fs::read_to_string(&stat_path) {
            Ok(content) => Ok(parse_stat_state(&content)),
            Err(e) => Err(e.kind()),
        }
    }

    fn read_cmdline(&self, pid: u32) -> Result<String, ErrorKind> {
        let path = self.proc_root.join(pid.to_string()).join("cmdline");
        match std::fs::read(&path) {
            Ok(bytes) => Ok(parse_cmdline(&bytes)),
            Err(e) => Err(e.kind()),
        }
    }
}

impl LivenessProbe for ProcfsProbe {
    fn is_alive(&self, pid: u32, expected_signature: Option<&str>) -> Liveness {
        if pid == 0 {
            return Liveness::NotFound;
        }

        let state = match self.read_state(pid) {
            Ok(state) => state,
            Err(ErrorKind::NotFound) => {
                // A missing process table is not evidence of death
                if !self.proc_root.is_dir() {
                    debug!(root = %self.proc_root.display(), "Process table not readable");
                    return Liveness::Unknown;
                }
                return Liveness::NotFound;
            }
            Err(kind) => {
                debug!(pid, error = ?kind, "Failed to read process state");
                return Liveness::Unknown;
            }
        };

        match state {
            Some('Z') => return Liveness::Zombie,
            Some('X') | Some('x') => return Liveness::NotFound,
            Some(_) => {}
            None => return Liveness::Unknown,
        }

        let expected = match expected_signature.map(str::trim) {
            Some(sig) if !sig.is_empty() => sig,
            _ => return Liveness::Alive,
        };

        match self.read_cmdline(pid) {
            Ok(cmdline) if cmdline.contains(expected) => Liveness::Alive,
            Ok(cmdline) => {
                debug!(pid, cmdline = %cmdline, expected = %expected, "PID signature mismatch");
                Liveness::SignatureMismatch
            }
            // Exited between the two reads
            Err(ErrorKind::NotFound) => Liveness::NotFound,
            Err(_) => Liveness::Unknown,
        }
    }
}

/// Extract the state character from `/proc/<pid>/stat`
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the state follows the last closing parenthesis.
fn parse_stat_state(content: &str) -> Option<char> {
    let after_comm = &content[content.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

/// Join NUL-separated argv into a single space-separated string
fn parse_cmdline(bytes: &[u8]) -> String {
    bytes
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
