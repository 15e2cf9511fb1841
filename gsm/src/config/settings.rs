//! Runtime settings assembled from the environment.

use std::env;
use std::path::PathBuf;

use regex::Regex;
use thiserror::Error;

use super::defaults::{
    DEFAULT_MANAGER_TMPDIR, DEFAULT_SERVER_FILES_ROOT, DEFAULT_STEAMCMD_DOWNLOAD_URL,
};
use super::parser::{expand_tilde, parse_bool, parse_repo_source, RepoSource};

/// Errors produced while reading the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was present but its value does not satisfy the grammar.
    #[error("invalid value for {name}: '{value}' ({reason})")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },

    /// A variable required by the current entrypoint is missing.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

/// Steam login material for the content tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteamLogin {
    /// Anonymous login; sufficient for most dedicated-server app ids.
    Anonymous,
    /// Username/password login for apps that require ownership.
    Credentials { username: String, password: String },
}

/// All environment-derived settings.
///
/// Constructed once at process start; immutable afterwards. A configuration
/// change requires restarting the manager.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root for `lock/` and `ipc/`.
    pub manager_tmpdir: PathBuf,
    /// Root for base/config/steamcmd/persist/merged/workdir trees.
    pub server_files_root: PathBuf,
    /// Game identifier (required for the lifecycle coordinator).
    pub game_id: Option<String>,
    /// Instance identifier, `[A-Za-z0-9_-]+` (required for the coordinator).
    pub instance_id: Option<String>,
    /// Remove the content tool directory before downloading.
    pub steamcmd_files_force: bool,
    /// Remove the base layer before downloading.
    pub server_files_force: bool,
    /// Remove the config checkout before fetching.
    pub server_config_files_force: bool,
    /// Login material for the content tool.
    pub steam_login: SteamLogin,
    /// Two-factor auth toggle. Unsupported: requests with it set are
    /// rejected before any lock is taken.
    pub steamcmd_twofactor_enabled: bool,
    /// Run `app_update` with validation on the initial download.
    pub steamcmd_initial_download_validate: bool,
    /// Configuration repository (URL + branch), when configured.
    pub server_config_repo: Option<RepoSource>,
    /// Private key path for SSH repository access.
    pub server_config_ssh_key: Option<PathBuf>,
    /// Tarball URL for the initial content-tool bootstrap.
    pub steamcmd_download_url: String,
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a present variable fails its
    /// grammar (instance id, repository source). Missing optional variables
    /// fall back to their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let manager_tmpdir = env::var("MANAGER_TMPDIR")
            .map(|v| expand_tilde(&v))
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_MANAGER_TMPDIR));
        let server_files_root = env::var("SERVER_FILES_ROOT_DIR")
            .map(|v| expand_tilde(&v))
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SERVER_FILES_ROOT));

        let game_id = env::var("GAME_ID").ok().filter(|v| !v.trim().is_empty());
        let instance_id = env::var("INSTANCE_ID").ok().filter(|v| !v.trim().is_empty());
        if let Some(ref id) = instance_id {
            validate_instance_id(id)?;
        }

        let login_anon = env_bool("STEAMCMD_LOGIN_ANON").unwrap_or(true);
        let username = env::var("STEAMCMD_LOGIN_USERNAME").ok();
        let password = env::var("STEAMCMD_LOGIN_PASSWORD").ok();
        let steam_login = if login_anon {
            SteamLogin::Anonymous
        } else {
            match (username, password) {
                (Some(username), Some(password)) => SteamLogin::Credentials { username, password },
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "STEAMCMD_LOGIN_ANON".to_string(),
                        value: "false".to_string(),
                        reason: "non-anonymous login requires STEAMCMD_LOGIN_USERNAME and \
                                 STEAMCMD_LOGIN_PASSWORD"
                            .to_string(),
                    });
                }
            }
        };

        let server_config_repo = match env::var("SERVER_CONFIG_REPO") {
            Ok(v) if !v.trim().is_empty() => Some(parse_repo_source(&v)?),
            _ => None,
        };

        Ok(Self {
            manager_tmpdir,
            server_files_root,
            game_id,
            instance_id,
            steamcmd_files_force: env_bool("STEAMCMD_FILES_FORCE").unwrap_or(false),
            server_files_force: env_bool("SERVER_FILES_FORCE").unwrap_or(false),
            server_config_files_force: env_bool("SERVER_CONFIG_FILES_FORCE").unwrap_or(false),
            steam_login,
            steamcmd_twofactor_enabled: env_bool("STEAMCMD_TWOFACTOR_ENABLED").unwrap_or(false),
            steamcmd_initial_download_validate: env_bool("STEAMCMD_INITIAL_DOWNLOAD_VALIDATE")
                .unwrap_or(false),
            server_config_repo,
            server_config_ssh_key: env::var("SERVER_CONFIG_SSH_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| expand_tilde(&v)),
            steamcmd_download_url: env::var("STEAMCMD_DOWNLOAD_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STEAMCMD_DOWNLOAD_URL.to_string()),
        })
    }

    /// Game id, or an error when the entrypoint requires one.
    pub fn require_game_id(&self) -> Result<&str, ConfigError> {
        self.game_id.as_deref().ok_or(ConfigError::Missing("GAME_ID"))
    }

    /// Instance id, or an error when the entrypoint requires one.
    pub fn require_instance_id(&self) -> Result<&str, ConfigError> {
        self.instance_id
            .as_deref()
            .ok_or(ConfigError::Missing("INSTANCE_ID"))
    }

    /// Lockfile directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.manager_tmpdir.join("lock")
    }

    /// Message bus queue directory.
    pub fn ipc_dir(&self) -> PathBuf {
        self.manager_tmpdir.join("ipc")
    }

    /// Shared read-only base layer for a game.
    pub fn base_dir(&self, game_id: &str) -> PathBuf {
        self.server_files_root.join("base").join(game_id)
    }

    /// Instance-scoped config checkout directory.
    pub fn config_dir(&self, game_id: &str, instance_id: &str) -> PathBuf {
        self.server_files_root
            .join("config")
            .join(game_id)
            .join(instance_id)
    }

    /// Content tool installation directory.
    pub fn steamcmd_dir(&self) -> PathBuf {
        self.server_files_root.join("steamcmd")
    }

    /// Writable persistence layer for an instance.
    pub fn persist_dir(&self, game_id: &str, instance_id: &str) -> PathBuf {
        self.instance_tree("persist", game_id, instance_id)
    }

    /// Overlay mountpoint for an instance.
    pub fn merged_dir(&self, game_id: &str, instance_id: &str) -> PathBuf {
        self.instance_tree("merged", game_id, instance_id)
    }

    /// Overlay work directory for an instance.
    pub fn work_dir(&self, game_id: &str, instance_id: &str) -> PathBuf {
        self.instance_tree("workdir", game_id, instance_id)
    }

    /// Directory holding game manifest JSON files.
    pub fn manifest_dir(&self) -> PathBuf {
        self.server_files_root.join("manifests")
    }

    /// Directory for manager log files.
    pub fn log_dir(&self) -> PathBuf {
        self.server_files_root.join("logs")
    }

    /// Instance configuration file inside the config checkout.
    pub fn instance_file(&self, game_id: &str, instance_id: &str) -> PathBuf {
        self.config_dir(game_id, instance_id).join("instance.json")
    }

    fn instance_tree(&self, kind: &str, game_id: &str, instance_id: &str) -> PathBuf {
        self.server_files_root
            .join(kind)
            .join(game_id)
            .join(instance_id)
    }
}

/// Validate an instance id against the `[A-Za-z0-9_-]+` grammar.
pub fn validate_instance_id(id: &str) -> Result<(), ConfigError> {
    // The regex is tiny; recompiling per call keeps this dependency-free of
    // global state and the call sites are one-shot.
    let re = Regex::new("^[A-Za-z0-9_-]+$").expect("static regex");
    if re.is_match(id) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            name: "INSTANCE_ID".to_string(),
            value: id.to_string(),
            reason: "must match [A-Za-z0-9_-]+".to_string(),
        })
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| parse_bool(&v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    // Settings::from_env reads the real process environment, so these tests
    // exercise the pure helpers and path derivation instead of mutating
    // global env state under the parallel test runner.

    fn test_settings() -> Settings {
        Settings {
            manager_tmpdir: PathBuf::from("/tmp/gsm"),
            server_files_root: PathBuf::from("/opt/gsm"),
            game_id: Some("csgo".to_string()),
            instance_id: Some("main-1".to_string()),
            steamcmd_files_force: false,
            server_files_force: false,
            server_config_files_force: false,
            steam_login: SteamLogin::Anonymous,
            steamcmd_twofactor_enabled: false,
            steamcmd_initial_download_validate: false,
            server_config_repo: None,
            server_config_ssh_key: None,
            steamcmd_download_url: DEFAULT_STEAMCMD_DOWNLOAD_URL.to_string(),
        }
    }

    #[test]
    fn test_path_layout() {
        let settings = test_settings();
        assert_eq!(settings.lock_dir(), Path::new("/tmp/gsm/lock"));
        assert_eq!(settings.ipc_dir(), Path::new("/tmp/gsm/ipc"));
        assert_eq!(settings.base_dir("csgo"), Path::new("/opt/gsm/base/csgo"));
        assert_eq!(
            settings.config_dir("csgo", "main-1"),
            Path::new("/opt/gsm/config/csgo/main-1")
        );
        assert_eq!(
            settings.merged_dir("csgo", "main-1"),
            Path::new("/opt/gsm/merged/csgo/main-1")
        );
        assert_eq!(
            settings.work_dir("csgo", "main-1"),
            Path::new("/opt/gsm/workdir/csgo/main-1")
        );
        assert_eq!(settings.steamcmd_dir(), Path::new("/opt/gsm/steamcmd"));
    }

    #[test]
    fn test_instance_id_grammar() {
        assert!(validate_instance_id("main-1").is_ok());
        assert!(validate_instance_id("A_b-3").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("bad id").is_err());
        assert!(validate_instance_id("semi;colon").is_err());
    }

    #[test]
    fn test_require_accessors() {
        let mut settings = test_settings();
        assert_eq!(settings.require_game_id().unwrap(), "csgo");
        assert_eq!(settings.require_instance_id().unwrap(), "main-1");

        settings.game_id = None;
        assert!(matches!(
            settings.require_game_id(),
            Err(ConfigError::Missing("GAME_ID"))
        ));
    }
}
