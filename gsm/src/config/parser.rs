//! Parsing helpers for environment values.
//!
//! This is the single place where the loose string grammars accepted in the
//! environment (booleans, `~` paths, repository sources) are mapped to typed
//! values.

use std::path::PathBuf;

use super::settings::ConfigError;

/// Parse a boolean value from an environment string.
/// Accepts: true/false, yes/no, 1/0, on/off (case-insensitive)
pub fn parse_bool(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v == "true" || v == "1" || v == "yes" || v == "on"
}

/// Expand ~ to home directory in paths.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// A parsed configuration-repository source.
///
/// The environment form carries the branch as a `#` suffix on the URL, in
/// both the scp-like and the HTTPS form:
///
/// ```text
/// git@github.com:example/csgo-config#production
/// https://github.com/example/csgo-config#production
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSource {
    /// Clone URL with the branch suffix removed.
    pub url: String,
    /// Branch to check out. Defaults to `main` when no suffix is present.
    pub branch: String,
}

/// Parse a repository source string into URL and branch.
pub fn parse_repo_source(value: &str) -> Result<RepoSource, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Invalid {
            name: "SERVER_CONFIG_REPO".to_string(),
            value: value.to_string(),
            reason: "repository source must not be empty".to_string(),
        });
    }

    let (url, branch) = match value.split_once('#') {
        Some((url, branch)) if !branch.trim().is_empty() => (url, branch.trim()),
        Some((url, _)) => (url, "main"),
        None => (value, "main"),
    };

    if url.trim().is_empty() {
        return Err(ConfigError::Invalid {
            name: "SERVER_CONFIG_REPO".to_string(),
            value: value.to_string(),
            reason: "repository URL must not be empty".to_string(),
        });
    }

    Ok(RepoSource {
        url: url.trim().to_string(),
        branch: branch.to_string(),
    })
}
