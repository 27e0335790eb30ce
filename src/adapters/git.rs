//! Source-control puller.
//!
//! Before a build the pipeline's working copy is moved to the requested
//! commit by shelling out to the `git` CLI. Failures are mapped onto the
//! typed errors the trigger boundary reports (missing repo vs. missing
//! commit vs. missing revision), matching on git's stderr text.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors from pulling a commit into a working copy
#[derive(Debug, Error)]
pub enum GitPullError {
    #[error("{0} is not a git repository (is git installed and the repo path configured?)")]
    NotARepository(PathBuf),

    #[error("Commit {0} was not found in the repository")]
    CommitNotFound(String),

    #[error("Revision {0} does not name a known branch")]
    BranchNotFound(String),

    #[error("git failed: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks out specific commits into pipeline working copies
#[derive(Debug, Default)]
pub struct GitPuller;

impl GitPuller {
    pub fn new() -> Self {
        Self
    }

    /// Bring `repo`'s working copy to `commit_id`.
    ///
    /// Fetches first so commits pushed since the last build are visible,
    /// then checks the commit out directly.
    pub async fn pull(&self, repo: &Path, commit_id: &str) -> Result<(), GitPullError> {
        info!(repo = %repo.display(), commit = %commit_id, "Pulling commit");

        self.run(repo, &["fetch", "--all"], commit_id).await?;
        self.run(repo, &["checkout", commit_id], commit_id).await?;

        Ok(())
    }

    async fn run(&self, repo: &Path, args: &[&str], commit_id: &str) -> Result<(), GitPullError> {
        debug!(?args, "Running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(map_git_error(repo, commit_id, &stderr))
    }
}

/// Classify git stderr into the boundary's typed failures
fn map_git_error(repo: &Path, commit_id: &str, stderr: &str) -> GitPullError {
    if stderr.contains("not a git repository") {
        GitPullError::NotARepository(repo.to_path_buf())
    } else if stderr.contains("did not match any file") {
        GitPullError::CommitNotFound(commit_id.to_string())
    } else if stderr.contains("unknown revision") {
        GitPullError::BranchNotFound(commit_id.to_string())
    } else {
        GitPullError::Git(stderr.trim().to_string())
    }
}
