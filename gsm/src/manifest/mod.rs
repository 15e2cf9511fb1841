//! Game manifests and instance configuration.
//!
//! A *game manifest* describes a supported game: how its base files are
//! obtained and where its server binary lives inside them. Manifests are
//! immutable at runtime and looked up by game id. A small built-in set is
//! always available; additional manifests can be dropped as JSON files into
//! the manifest directory (`<name>.json`, one manifest per file).
//!
//! An *instance configuration* carries the per-server parameters (port,
//! player cap, passwords, startup map, binary or command-line overrides).
//! It lives inside the instance's config checkout as `instance.json` and is
//! immutable per lifecycle; a change requires a restart.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by manifest and instance-file handling.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Requested game id has no manifest. The message is matched by
    /// callers' operators, keep the `gameId unsupported` phrase stable.
    #[error("gameId unsupported: {0}")]
    UnknownGame(String),

    /// Requested download type is not implemented.
    #[error("downloadType unsupported: {0}")]
    UnsupportedDownloadType(String),

    /// Manifest or instance file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Manifest or instance file is not valid JSON for the schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// How a game's base files are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadType {
    /// Steam content client (`steamcmd`).
    Steamcmd,
}

/// A supported game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameManifest {
    /// Game id; also the manifest's lookup key.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Content delivery mechanism.
    pub download_type: DownloadType,
    /// App id passed to the content tool.
    pub download_id: u32,
    /// Directory (relative to the base layer) containing the server binary.
    pub bin_dir: String,
    /// Server binary name inside `bin_dir`.
    pub bin_name: String,
}

/// Per-instance server parameters.
///
/// Known fields are typed; game-specific parameters (`srcds_*`, `csgo_*`,
/// ...) are collected in `extra` and consumed by the launch-plan assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
    pub uuid: String,
    pub display_name: String,
    pub port: u16,
    pub maxplayers: u32,
    #[serde(default)]
    pub rcon: Option<String>,
    #[serde(default)]
    pub bin_dir_override: Option<String>,
    #[serde(default)]
    pub bin_name_override: Option<String>,
    #[serde(default)]
    pub cmdline_override: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl InstanceConfig {
    /// Load an instance configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Get a game-specific string parameter from `extra`.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// Registry of game manifests.
pub struct ManifestStore {
    manifests: BTreeMap<String, GameManifest>,
}

impl ManifestStore {
    /// The built-in manifest set.
    pub fn builtin() -> Self {
        let mut manifests = BTreeMap::new();
        for manifest in [
            GameManifest {
                name: "csgo".to_string(),
                display_name: "Counter-Strike: Global Offensive".to_string(),
                download_type: DownloadType::Steamcmd,
                download_id: 740,
                bin_dir: ".".to_string(),
                bin_name: "srcds_run".to_string(),
            },
            GameManifest {
                name: "tf2".to_string(),
                display_name: "Team Fortress 2".to_string(),
                download_type: DownloadType::Steamcmd,
                download_id: 232250,
                bin_dir: ".".to_string(),
                bin_name: "srcds_run".to_string(),
            },
        ] {
            manifests.insert(manifest.name.clone(), manifest);
        }
        Self { manifests }
    }

    /// Built-in manifests overlaid with `<dir>/*.json` files.
    ///
    /// A file manifest with the same name replaces the built-in one. A
    /// missing directory is fine; unreadable individual files are errors so
    /// that a typo does not silently drop a game.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let mut store = Self::builtin();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(source) => {
                return Err(ManifestError::Io {
                    path: dir.display().to_string(),
                    source,
                })
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| ManifestError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|source| ManifestError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let manifest: GameManifest =
                serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            store.manifests.insert(manifest.name.clone(), manifest);
        }
        Ok(store)
    }

    /// Look up a manifest by game id.
    pub fn get(&self, game_id: &str) -> Result<&GameManifest, ManifestError> {
        self.manifests
            .get(game_id)
            .ok_or_else(|| ManifestError::UnknownGame(game_id.to_string()))
    }

    /// All known game ids, sorted.
    pub fn game_ids(&self) -> Vec<&str> {
        self.manifests.keys().map(|k| k.as_str()).collect()
    }
}
