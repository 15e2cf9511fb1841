//! Configuration-repository driver.
//!
//! Fetches an instance's config layer from a version-control repository:
//! `clone` for the first fetch (optionally after removing a previous
//! checkout), `pull` for updates (fast-forward only, a diverged checkout
//! is an error rather than a merge). Both finish by checking out the
//! requested branch.
//!
//! libgit2 work is blocking, so the worker runs it on the blocking pool
//! and forwards progress through the task's output stream as
//! `git.<method> <stage> <pct>%` lines.

use std::path::PathBuf;

use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::task::{TaskContext, TaskError, TaskOutcome, TaskWorker};

/// Errors raised by the repo driver.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("pull would not fast-forward (local history diverged)")]
    NonFastForward,

    #[error("branch '{0}' not found in repository")]
    MissingBranch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repo fetch canceled")]
    Canceled,
}

/// What to do with the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoAction {
    Clone,
    Pull,
}

impl RepoAction {
    /// Parse the wire spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clone" => Some(RepoAction::Clone),
            "pull" => Some(RepoAction::Pull),
            _ => None,
        }
    }

    fn method(&self) -> &'static str {
        match self {
            RepoAction::Clone => "clone",
            RepoAction::Pull => "pull",
        }
    }
}

/// Everything one repo-fetch task needs.
#[derive(Debug, Clone)]
pub struct RepoRequest {
    pub instance_id: String,
    pub repo_url: String,
    pub repo_dir: PathBuf,
    pub branch: String,
    pub action: RepoAction,
    /// Remove the checkout before cloning.
    pub clean: bool,
    /// SSH private key; without it only public HTTPS repos are reachable.
    pub ssh_key: Option<PathBuf>,
}

/// The repo-fetch task worker.
pub struct RepoWorker {
    pub request: RepoRequest,
}

impl TaskWorker for RepoWorker {
    async fn run(self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        let request = self.request;
        let output = ctx.output.clone();
        let cancel = ctx.cancel.clone();

        let result = tokio::task::spawn_blocking(move || run_sync(&request, &output, &cancel))
            .await
            .map_err(|e| TaskError::Failed(format!("repo task panicked: {e}")))?;

        match result {
            Ok(()) => Ok(TaskOutcome::Completed),
            Err(RepoError::Canceled) => Ok(TaskOutcome::Canceled),
            // A canceled transfer surfaces as a callback error from git2.
            Err(RepoError::Git(_)) if ctx.cancel.is_cancelled() => Ok(TaskOutcome::Canceled),
            Err(e) => Err(TaskError::Failed(e.to_string())),
        }
    }
}

fn run_sync(
    request: &RepoRequest,
    output: &mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
) -> Result<(), RepoError> {
    if cancel.is_cancelled() {
        return Err(RepoError::Canceled);
    }

    match request.action {
        RepoAction::Clone => {
            if request.clean {
                match std::fs::remove_dir_all(&request.repo_dir) {
                    Ok(()) => emit(output, "clone", "cleaned", 0),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(RepoError::Io(e)),
                }
            }
            if let Some(parent) = request.repo_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }

            info!(url = %request.repo_url, dir = %request.repo_dir.display(), "cloning");
            let mut builder = RepoBuilder::new();
            builder.fetch_options(fetch_options(request, output, cancel));
            let repo = builder.clone(&request.repo_url, &request.repo_dir)?;
            emit(output, "clone", "done", 100);

            checkout_branch(&repo, &request.branch)?;
            emit(output, "checkout", &request.branch, 100);
        }
        RepoAction::Pull => {
            info!(dir = %request.repo_dir.display(), "pulling");
            let repo = Repository::open(&request.repo_dir)?;
            {
                let mut remote = repo.find_remote("origin")?;
                let mut options = fetch_options(request, output, cancel);
                remote.fetch(&[request.branch.as_str()], Some(&mut options), None)?;
            }
            fast_forward(&repo, &request.branch)?;
            emit(output, "pull", "done", 100);

            checkout_branch(&repo, &request.branch)?;
            emit(output, "checkout", &request.branch, 100);
        }
    }

    if cancel.is_cancelled() {
        return Err(RepoError::Canceled);
    }
    Ok(())
}

fn fetch_options<'a>(
    request: &'a RepoRequest,
    output: &'a mpsc::UnboundedSender<String>,
    cancel: &'a CancellationToken,
) -> FetchOptions<'a> {
    let mut callbacks = RemoteCallbacks::new();

    if let Some(key) = request.ssh_key.clone() {
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            Cred::ssh_key(username_from_url.unwrap_or("git"), None, &key, None)
        });
    }

    let method = request.action.method();
    let mut last_pct: i64 = -1;
    let output = output.clone();
    let cancel = cancel.clone();
    callbacks.transfer_progress(move |stats| {
        if cancel.is_cancelled() {
            return false;
        }
        let total = stats.total_objects();
        if total > 0 {
            let pct = (stats.received_objects() * 100 / total) as i64;
            // Coarse steps keep the stream readable on big repos.
            if pct == 100 || pct >= last_pct + 10 {
                last_pct = pct;
                emit(&output, method, "receiving", pct as u32);
            }
        }
        true
    });

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

/// Format and send one progress line.
fn emit(output: &mpsc::UnboundedSender<String>, method: &str, stage: &str, pct: u32) {
    let _ = output.send(format!("git.{method} {stage} {pct}%"));
}

/// Fast-forward the local branch to FETCH_HEAD, or fail.
fn fast_forward(repo: &Repository, branch: &str) -> Result<(), RepoError> {
    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetch_commit])?;

    if analysis.is_up_to_date() {
        debug!(branch, "already up to date");
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        return Err(RepoError::NonFastForward);
    }

    let refname = format!("refs/heads/{branch}");
    let mut reference = repo.find_reference(&refname)?;
    reference.set_target(fetch_commit.id(), "fast-forward")?;
    repo.set_head(&refname)?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
    Ok(())
}

/// Check out `branch`, creating a local tracking branch from
/// `origin/<branch>` when it only exists remotely.
fn checkout_branch(repo: &Repository, branch: &str) -> Result<(), RepoError> {
    let refname = format!("refs/heads/{branch}");

    if repo.find_reference(&refname).is_err() {
        let remote_name = format!("refs/remotes/origin/{branch}");
        let Ok(remote_ref) = repo.find_reference(&remote_name) else {
            return Err(RepoError::MissingBranch(branch.to_string()));
        };
        let commit = remote_ref.peel_to_commit()?;
        repo.branch(branch, &commit, false)?;
    }

    repo.set_head(&refname)?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
    Ok(())
}
