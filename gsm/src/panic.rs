//! Panic hook that records state before the process dies.
//!
//! Managers hold host-visible state (locks, mounts, children); a silent
//! panic leaves an operator guessing. The hook logs the panic location
//! and the held locks of this process, then chains to the default
//! handler. Lockfiles themselves are left in place: the staleness check
//! makes them reclaimable, and removing them from a dying process could
//! race a healthy one.

use std::panic::{self, PanicHookInfo};
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::error;

static LOCK_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Install the panic hook.
///
/// Call once early in process startup, after settings are loaded so the
/// lock directory is known. Subsequent calls are ignored.
pub fn init(lock_dir: PathBuf) {
    if LOCK_DIR.set(lock_dir).is_err() {
        return;
    }

    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        log_panic(info);
        original_hook(info);
    }));
}

fn log_panic(info: &PanicHookInfo<'_>) {
    let location = info
        .location()
        .map(|l| format!("{}:{}", l.file(), l.line()))
        .unwrap_or_else(|| "unknown".to_string());
    error!(location = %location, "panic: {info}");

    let Some(lock_dir) = LOCK_DIR.get() else {
        return;
    };
    let own_pid = std::process::id().to_string();
    let Ok(entries) = std::fs::read_dir(lock_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let holder = std::fs::read_to_string(entry.path()).unwrap_or_default();
        if holder.trim() == own_pid {
            error!(
                lock = %entry.file_name().to_string_lossy(),
                "lock held by panicking process (stale-reclaimable)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        init(tmp.path().to_path_buf());
        init(tmp.path().join("other"));
        // First directory wins.
        assert_eq!(LOCK_DIR.get().unwrap(), &tmp.path().to_path_buf());
    }
}
