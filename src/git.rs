//! Fixture branch publishing.
//!
//! A prepared workspace is pushed as an orphan branch of the project's git
//! remote so a deploy hook can build it. The branch is deleted again during
//! teardown.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::config::GitIdentity;
use crate::error::{Error, Result};

/// Publishes prepared workspaces as remote branches.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes everything in `directory` as `branch`.
    async fn publish(&self, directory: &Path, branch: &str, committed_at: DateTime<Utc>) -> Result<()>;

    /// Deletes a previously published branch.
    async fn delete(&self, directory: &Path, branch: &str) -> Result<()>;
}

/// Pushes workspaces to orphan branches of one git remote.
#[derive(Debug, Clone)]
pub struct BranchPublisher {
    remote: String,
    identity: GitIdentity,
}

impl BranchPublisher {
    pub fn new(remote: impl Into<String>, identity: GitIdentity) -> Self {
        Self {
            remote: remote.into(),
            identity,
        }
    }
}

#[async_trait]
impl Publisher for BranchPublisher {
    /// Commits everything in `directory` to a fresh orphan `branch` and
    /// force-pushes it.
    async fn publish(&self, directory: &Path, branch: &str, committed_at: DateTime<Utc>) -> Result<()> {
        tracing::info!(
            directory = %directory.display(),
            remote = %self.remote,
            branch = %branch,
            "publishing fixture branch"
        );

        let name = format!("user.name={}", self.identity.username);
        let email = format!("user.email={}", self.identity.email);
        let author = format!("{} <{}>", self.identity.username, self.identity.email);
        let message = format!("{} @ {}", branch, committed_at.timestamp_millis());
        let date = committed_at.to_rfc3339();

        run_git(directory, &["init", "."]).await?;
        run_git(directory, &["remote", "add", "origin", &self.remote]).await?;
        run_git(directory, &["checkout", "--orphan", branch]).await?;
        run_git(directory, &["add", "."]).await?;
        run_git(
            directory,
            &[
                "-c", &name, "-c", &email, "commit", "-m", &message, "--author", &author, "--date", &date,
            ],
        )
        .await?;
        run_git(directory, &["push", "-f", "origin", branch]).await?;

        tracing::info!(branch = %branch, "published fixture branch");
        Ok(())
    }

    async fn delete(&self, directory: &Path, branch: &str) -> Result<()> {
        tracing::info!(branch = %branch, "deleting git branch");
        run_git(directory, &["push", "origin", "--delete", branch]).await?;
        Ok(())
    }
}

async fn run_git(directory: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(directory)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Git(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    if !stdout.trim().is_empty() {
        tracing::debug!(command = %args.join(" "), output = %stdout.trim(), "git");
    }
    Ok(stdout)
}
