//! Lock name constructors.
//!
//! Name grammar: `<role>-<gameId>[-<instanceId>]`. Keeping every name and
//! pattern behind a constructor means a renamed role cannot drift between
//! the process that acquires and the process that waits.

/// Builders for the lock names and wait patterns used across the managers.
pub struct LockName;

impl LockName {
    /// Game-wide exclusive lock.
    pub fn global_game(game_id: &str) -> String {
        format!("globalGame-{game_id}")
    }

    /// Instance-wide exclusive lock.
    pub fn global_instance(game_id: &str, instance_id: &str) -> String {
        format!("globalInstance-{game_id}-{instance_id}")
    }

    /// Held while the base layer for a game is being downloaded.
    pub fn download_game(game_id: &str) -> String {
        format!("downloadGame-{game_id}")
    }

    /// Held while an instance's config repository is being fetched.
    pub fn repo_download(instance_id: &str) -> String {
        format!("repoDownload-{instance_id}")
    }

    /// Held while an instance's config is being downloaded.
    pub fn config_download(instance_id: &str) -> String {
        format!("configDownload-{instance_id}")
    }

    /// Held while the base layer is part of a mounted view.
    pub fn base_mount(game_id: &str, instance_id: &str) -> String {
        format!("baseMount-{game_id}-{instance_id}")
    }

    /// Pattern matching every base mount of a game.
    pub fn base_mount_pattern(game_id: &str) -> String {
        format!("baseMount-{game_id}-.*")
    }

    /// Held while the config layers are part of a mounted view.
    pub fn config_mount(game_id: &str, instance_id: &str) -> String {
        format!("configMount-{game_id}-{instance_id}")
    }

    /// Pattern matching the config mount of an instance under any game.
    pub fn config_mount_pattern(instance_id: &str) -> String {
        format!("configMount-.*-{instance_id}")
    }

    /// Held while the game process for an instance is running.
    pub fn running(game_id: &str, instance_id: &str) -> String {
        format!("running-{game_id}-{instance_id}")
    }

    /// Held by a lifecycle coordinator driving an instance.
    pub fn lifecycle(game_id: &str, instance_id: &str) -> String {
        format!("lifecycleManager-{game_id}-{instance_id}")
    }

    /// A manager module's own startup lock.
    pub fn module(module: &str) -> String {
        module.to_string()
    }
}
