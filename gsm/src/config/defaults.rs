//! Default values for settings not present in the environment.

/// Root for the lock and bus directories. Recommended on tmpfs so that a
/// host reboot clears all coordination state.
pub const DEFAULT_MANAGER_TMPDIR: &str = "/tmp/gsm";

/// Root for game files, config checkouts, overlay layers and logs.
pub const DEFAULT_SERVER_FILES_ROOT: &str = "/opt/gsm";

/// Upstream tarball for bootstrapping the content tool.
pub const DEFAULT_STEAMCMD_DOWNLOAD_URL: &str =
    "https://steamcdn-a.akamaihd.net/client/installer/steamcmd_linux.tar.gz";

/// Budget for acquiring a driver's own lock and for pattern waits.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// Poll cadence for lock waits. Contention is rare and coarse-grained, so
/// one second is fine.
pub const DEFAULT_LOCK_POLL_SECS: u64 = 1;

/// Grace window between SIGTERM and SIGKILL when stopping a game process.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 30;

/// Budget for unmount retries when the mountpoint is busy.
pub const DEFAULT_UNMOUNT_BUDGET_SECS: u64 = 30;

/// Hard exit delay after a clean shutdown has been initiated.
pub const FORCE_EXIT_AFTER_SECS: u64 = 5;
