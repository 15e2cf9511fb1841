//! Distributed-mutex layer over a shared lock directory.
//!
//! Every named lock is one file in the lock directory, created with the
//! OS's exclusive-create primitive and holding the owner's PID in ASCII.
//! Multiple manager processes on the same host coordinate exclusively
//! through this directory (and the message bus); there is no shared memory.
//!
//! A lock whose recorded PID no longer maps to a live process is *stale*
//! and can be reclaimed with [`LockService::break_stale`]. Waits are plain
//! polling (1 s cadence by default); the resulting unfairness is acceptable
//! because contention is rare and coarse-grained.

mod name;

pub use name::LockName;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors raised by lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock is held by a live process.
    #[error("lock busy, held by pid {holder}")]
    Busy { holder: u32 },

    /// A wait budget expired before the lock(s) cleared.
    #[error("timed out after {budget:?} waiting for '{pattern}'")]
    Timeout { pattern: String, budget: Duration },

    /// The pattern passed to a scan operation is not a valid regex.
    #[error("invalid lock pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Underlying filesystem failure.
    #[error("lock I/O error on '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive named locks on a shared directory.
///
/// All operations are safe to call from multiple processes against the same
/// directory; atomicity relies on `O_CREAT|O_EXCL`.
#[derive(Debug, Clone)]
pub struct LockService {
    dir: PathBuf,
}

impl LockService {
    /// Create a lock service rooted at `dir`, creating the directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| LockError::Io {
            name: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// The lock directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Acquire `name` for the current process.
    ///
    /// Fails with [`LockError::Busy`] when a live process holds the lock.
    /// A stale holder does not grant the lock implicitly; callers decide
    /// whether to [`break_stale`](Self::break_stale) first.
    pub fn acquire(&self, name: &str) -> Result<(), LockError> {
        let path = self.lock_path(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(std::process::id().to_string().as_bytes())
                    .map_err(|source| LockError::Io {
                        name: name.to_string(),
                        source,
                    })?;
                debug!(lock = name, "acquired");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_holder(&path).unwrap_or(0);
                trace!(lock = name, holder, "busy");
                Err(LockError::Busy { holder })
            }
            Err(source) => Err(LockError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Release `name`. A lock that is already absent is not an error.
    pub fn release(&self, name: &str) -> Result<(), LockError> {
        let path = self.lock_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(lock = name, "released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Whether any lock matching `pattern` (full-match regex) exists.
    ///
    /// With `stale_ok = false` only locks whose holder is alive count; with
    /// `stale_ok = true` any matching file counts.
    pub fn is_held(&self, pattern: &str, stale_ok: bool) -> Result<bool, LockError> {
        let re = compile_pattern(pattern)?;
        for name in self.list()? {
            if !re.is_match(&name) {
                continue;
            }
            if stale_ok {
                return Ok(true);
            }
            match read_holder(&self.lock_path(&name)) {
                Some(pid) if is_process_alive(pid) => return Ok(true),
                Some(pid) => trace!(lock = %name, pid, "ignoring stale lock"),
                None => trace!(lock = %name, "ignoring unreadable lock"),
            }
        }
        Ok(false)
    }

    /// Block until no live lock matches `pattern`, polling at `poll`.
    ///
    /// Fails with [`LockError::Timeout`] after `budget` expires.
    pub async fn wait_clear(
        &self,
        pattern: &str,
        budget: Duration,
        poll: Duration,
    ) -> Result<(), LockError> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if !self.is_held(pattern, false)? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pattern, ?budget, "wait_clear timed out");
                return Err(LockError::Timeout {
                    pattern: pattern.to_string(),
                    budget,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Wait for `name` to clear, then acquire it.
    ///
    /// Not atomic against a third party: a competitor can take the lock
    /// between the wait and the acquire, in which case we keep waiting
    /// until the budget expires.
    pub async fn spin_acquire(&self, name: &str, budget: Duration) -> Result<(), LockError> {
        let deadline = tokio::time::Instant::now() + budget;
        let poll = Duration::from_secs(crate::config::DEFAULT_LOCK_POLL_SECS);
        loop {
            match self.acquire(name) {
                Ok(()) => return Ok(()),
                Err(LockError::Busy { holder }) => {
                    if holder != 0 && !is_process_alive(holder) {
                        warn!(lock = name, holder, "breaking stale lock");
                        self.break_stale(name)?;
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(LockError::Timeout {
                            pattern: name.to_string(),
                            budget,
                        });
                    }
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove `name` iff its recorded holder is no longer alive.
    ///
    /// Returns `true` when a stale lock was removed.
    pub fn break_stale(&self, name: &str) -> Result<bool, LockError> {
        let path = self.lock_path(name);
        match read_holder(&path) {
            None => Ok(false),
            Some(pid) if is_process_alive(pid) => Ok(false),
            Some(pid) => {
                debug!(lock = name, pid, "removing stale lock");
                match fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(source) => Err(LockError::Io {
                        name: name.to_string(),
                        source,
                    }),
                }
            }
        }
    }

    /// The PID recorded in `name`, if the lock exists and is parseable.
    pub fn holder(&self, name: &str) -> Option<u32> {
        read_holder(&self.lock_path(name))
    }

    /// All lock names currently present (held or stale).
    pub fn list(&self) -> Result<Vec<String>, LockError> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|source| LockError::Io {
            name: self.dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| LockError::Io {
                name: self.dir.display().to_string(),
                source,
            })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, LockError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| LockError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Read and parse a PID from a lock file.
fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

/// Check whether a process with the given PID is currently running.
///
/// `kill(pid, 0)` probes for existence without delivering a signal; EPERM
/// still means the process exists.
fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs no action beyond the check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
