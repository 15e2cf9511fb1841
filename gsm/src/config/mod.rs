//! Configuration for the GSM managers.
//!
//! All configuration comes from the process environment (the managers are
//! designed to run under a supervisor or a container entrypoint, where the
//! environment is the natural configuration surface). [`Settings::from_env`]
//! reads every recognized variable, applies defaults, and validates the
//! values that have a grammar (instance ids, repository sources).
//!
//! Path layout derived from the two root directories:
//!
//! ```text
//! <MANAGER_TMPDIR>/lock            lockfiles (one file per named lock)
//! <MANAGER_TMPDIR>/ipc             message bus queue directory
//! <SERVER_FILES_ROOT_DIR>/base/<game>                   shared base layer
//! <SERVER_FILES_ROOT_DIR>/config/<game>/<instance>      config layers
//! <SERVER_FILES_ROOT_DIR>/steamcmd                      content tool
//! <SERVER_FILES_ROOT_DIR>/persist/<game>/<instance>     writable layer
//! <SERVER_FILES_ROOT_DIR>/merged/<game>/<instance>      overlay mountpoint
//! <SERVER_FILES_ROOT_DIR>/workdir/<game>/<instance>     overlay workdir
//! <SERVER_FILES_ROOT_DIR>/manifests                     game manifest files
//! <SERVER_FILES_ROOT_DIR>/logs                          manager log files
//! ```

mod defaults;
mod parser;
mod settings;

pub use defaults::{
    DEFAULT_LOCK_POLL_SECS, DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_MANAGER_TMPDIR,
    DEFAULT_SERVER_FILES_ROOT, DEFAULT_STEAMCMD_DOWNLOAD_URL, DEFAULT_STOP_GRACE_SECS,
    DEFAULT_UNMOUNT_BUDGET_SECS, FORCE_EXIT_AFTER_SECS,
};
pub use parser::{expand_tilde, parse_bool, parse_repo_source, RepoSource};
pub use settings::{validate_instance_id, ConfigError, Settings, SteamLogin};
