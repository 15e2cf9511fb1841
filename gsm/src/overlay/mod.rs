//! Overlay composer: the merged read-write view of an instance.
//!
//! Stacks the game-wide read-only base layer, any number of instance
//! config layers (earlier listed = lower) and one writable persistence
//! layer into a single overlay mount. The OS primitive is an
//! overlay-style union mount driven through the `mount`/`umount` binaries;
//! the [`Mounter`] trait keeps that seam mockable.
//!
//! The mount locks `baseMount-<g>-<i>` and `configMount-<g>-<i>` are taken
//! as a pair: both succeed or both roll back. Holding them marks the base
//! and config layers as having an active reader, which the download
//! drivers wait on before touching those trees.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_UNMOUNT_BUDGET_SECS;
use crate::lock::{LockError, LockName, LockService};

/// Errors raised by the overlay composer.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("already mounted: {game_id}-{instance_id}")]
    AlreadyMounted {
        game_id: String,
        instance_id: String,
    },

    #[error("no mount recorded for {game_id}-{instance_id}")]
    NotMounted {
        game_id: String,
        instance_id: String,
    },

    #[error("precondition lock '{0}' is held")]
    PreconditionHeld(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("unmount of {merged} kept failing within {budget:?}: {last_error}")]
    UnmountBudgetExhausted {
        merged: String,
        budget: Duration,
        last_error: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The layers and directories of one merged view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub game_id: String,
    pub instance_id: String,
    /// Game-wide read-only base layer.
    pub base: PathBuf,
    /// Instance config layers, earlier listed = lower.
    pub config_layers: Vec<PathBuf>,
    /// Writable persistence layer (receives all runtime changes).
    pub persist: PathBuf,
    /// Overlay work directory (same filesystem as `persist`).
    pub work: PathBuf,
    /// Mountpoint presenting the merged tree.
    pub merged: PathBuf,
}

impl MountSpec {
    /// The `lowerdir=...,upperdir=...,workdir=...` mount option string.
    ///
    /// In the overlay option grammar the leftmost lower directory is the
    /// topmost layer, so the config layers are emitted in reverse request
    /// order with the base at the end.
    pub fn overlay_options(&self) -> String {
        let mut lower: Vec<String> = self
            .config_layers
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect();
        lower.push(self.base.display().to_string());
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.join(":"),
            self.persist.display(),
            self.work.display()
        )
    }
}

/// The OS mount seam.
pub trait Mounter: Send + Sync + 'static {
    /// Mount the merged view described by `spec`.
    fn mount(&self, spec: &MountSpec) -> impl Future<Output = Result<(), OverlayError>> + Send;

    /// Unmount the view at `merged`.
    fn unmount(&self, merged: &Path) -> impl Future<Output = Result<(), OverlayError>> + Send;
}

/// Real overlay mounts via the system `mount`/`umount` binaries.
pub struct SystemMounter;

impl Mounter for SystemMounter {
    async fn mount(&self, spec: &MountSpec) -> Result<(), OverlayError> {
        let output = tokio::process::Command::new("mount")
            .arg("-t")
            .arg("overlay")
            .arg("overlay")
            .arg("-o")
            .arg(spec.overlay_options())
            .arg(&spec.merged)
            .output()
            .await?;
        if !output.status.success() {
            return Err(OverlayError::MountFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn unmount(&self, merged: &Path) -> Result<(), OverlayError> {
        let output = tokio::process::Command::new("umount")
            .arg(merged)
            .output()
            .await?;
        if !output.status.success() {
            return Err(OverlayError::MountFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Tracks and manages the merged views of this host.
pub struct OverlayComposer<M: Mounter> {
    locks: Arc<LockService>,
    mounter: M,
    mounts: Mutex<HashMap<(String, String), MountSpec>>,
    unmount_budget: Duration,
    unmount_backoff: Duration,
}

impl<M: Mounter> OverlayComposer<M> {
    pub fn new(locks: Arc<LockService>, mounter: M) -> Self {
        Self {
            locks,
            mounter,
            mounts: Mutex::new(HashMap::new()),
            unmount_budget: Duration::from_secs(DEFAULT_UNMOUNT_BUDGET_SECS),
            unmount_backoff: Duration::from_secs(1),
        }
    }

    /// Override the unmount retry budget and initial backoff.
    pub fn with_unmount_budget(mut self, budget: Duration, backoff: Duration) -> Self {
        self.unmount_budget = budget;
        self.unmount_backoff = backoff;
        self
    }

    /// Whether a merged view is recorded for the instance.
    pub fn is_mounted(&self, game_id: &str, instance_id: &str) -> bool {
        self.mounts
            .lock()
            .expect("mount registry poisoned")
            .contains_key(&(game_id.to_string(), instance_id.to_string()))
    }

    /// Currently recorded mounts, sorted by key.
    pub fn list(&self) -> Vec<MountSpec> {
        let mounts = self.mounts.lock().expect("mount registry poisoned");
        let mut specs: Vec<MountSpec> = mounts.values().cloned().collect();
        specs.sort_by(|a, b| {
            (a.game_id.clone(), a.instance_id.clone())
                .cmp(&(b.game_id.clone(), b.instance_id.clone()))
        });
        specs
    }

    /// Compose and mount the merged view described by `spec`.
    pub async fn setup_mount(&self, spec: MountSpec) -> Result<(), OverlayError> {
        let key = (spec.game_id.clone(), spec.instance_id.clone());
        if self
            .mounts
            .lock()
            .expect("mount registry poisoned")
            .contains_key(&key)
        {
            return Err(OverlayError::AlreadyMounted {
                game_id: spec.game_id,
                instance_id: spec.instance_id,
            });
        }

        // Quiescence preconditions: nobody may be writing the base layer,
        // and no game may already be reading the view.
        for name in [
            LockName::download_game(&spec.game_id),
            LockName::running(&spec.game_id, &spec.instance_id),
        ] {
            if self.locks.is_held(&regex::escape(&name), false)? {
                return Err(OverlayError::PreconditionHeld(name));
            }
        }

        // Mount locks are a pair: roll back the first when the second is
        // contended.
        let base_lock = LockName::base_mount(&spec.game_id, &spec.instance_id);
        let config_lock = LockName::config_mount(&spec.game_id, &spec.instance_id);
        self.locks.acquire(&base_lock)?;
        if let Err(e) = self.locks.acquire(&config_lock) {
            let _ = self.locks.release(&base_lock);
            return Err(e.into());
        }

        for dir in [&spec.persist, &spec.work, &spec.merged] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                let _ = self.locks.release(&config_lock);
                let _ = self.locks.release(&base_lock);
                return Err(e.into());
            }
        }

        if let Err(e) = self.mounter.mount(&spec).await {
            warn!(game_id = %spec.game_id, instance_id = %spec.instance_id, "mount failed: {e}");
            let _ = self.locks.release(&config_lock);
            let _ = self.locks.release(&base_lock);
            return Err(e);
        }

        info!(
            game_id = %spec.game_id,
            instance_id = %spec.instance_id,
            merged = %spec.merged.display(),
            "merged view mounted"
        );
        self.mounts
            .lock()
            .expect("mount registry poisoned")
            .insert(key, spec);
        Ok(())
    }

    /// Unmount the merged view of an instance.
    ///
    /// A busy mountpoint is retried with doubling backoff inside the
    /// configured budget; when the budget runs out the mount (and its
    /// locks) stay in place and the error is reported.
    pub async fn remove_mount(
        &self,
        game_id: &str,
        instance_id: &str,
    ) -> Result<(), OverlayError> {
        let key = (game_id.to_string(), instance_id.to_string());
        let spec = self
            .mounts
            .lock()
            .expect("mount registry poisoned")
            .get(&key)
            .cloned()
            .ok_or_else(|| OverlayError::NotMounted {
                game_id: game_id.to_string(),
                instance_id: instance_id.to_string(),
            })?;

        let deadline = tokio::time::Instant::now() + self.unmount_budget;
        let mut backoff = self.unmount_backoff;
        loop {
            match self.mounter.unmount(&spec.merged).await {
                Ok(()) => break,
                Err(e) => {
                    if tokio::time::Instant::now() + backoff > deadline {
                        return Err(OverlayError::UnmountBudgetExhausted {
                            merged: spec.merged.display().to_string(),
                            budget: self.unmount_budget,
                            last_error: e.to_string(),
                        });
                    }
                    debug!(merged = %spec.merged.display(), "unmount busy, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        self.locks
            .release(&LockName::config_mount(game_id, instance_id))?;
        self.locks
            .release(&LockName::base_mount(game_id, instance_id))?;
        self.mounts
            .lock()
            .expect("mount registry poisoned")
            .remove(&key);
        info!(game_id, instance_id, "merged view unmounted");
        Ok(())
    }
}
