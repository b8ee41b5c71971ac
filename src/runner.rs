//! Test runner seam.
//!
//! Deployed fixture URLs are handed to a [`TestRunner`]; the shipped
//! implementation runs a shell command once per fixture.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::future;
use tokio::process::Command;

use crate::error::{Error, Result};

/// A fixture whose deployment is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedFixture {
    pub name: String,
    pub url: String,
    /// Workspace the fixture was prepared in.
    pub directory: PathBuf,
}

/// Result of testing one fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureTestResult {
    pub fixture: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}

/// Aggregate result of a test run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOutcome {
    pub results: Vec<FixtureTestResult>,
}

impl TestOutcome {
    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &FixtureTestResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Runs the test suite against deployed fixtures.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, deployments: &[DeployedFixture]) -> Result<TestOutcome>;
}

/// Runs a shell command per fixture with `DEPLOYMENT_URL` and `FIXTURE`
/// set, in the fixture's workspace.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: String,
}

impl CommandTestRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run_one(&self, deployment: &DeployedFixture) -> Result<FixtureTestResult> {
        tracing::info!(fixture = %deployment.name, url = %deployment.url, "running tests");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&deployment.directory)
            .env("DEPLOYMENT_URL", &deployment.url)
            .env("FIXTURE", &deployment.name)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::TestRun(format!("failed to run '{}': {}", self.command, e)))?;

        if status.success() {
            tracing::info!(fixture = %deployment.name, "tests passed");
        } else {
            tracing::error!(fixture = %deployment.name, code = ?status.code(), "tests failed");
        }
        Ok(FixtureTestResult {
            fixture: deployment.name.clone(),
            success: status.success(),
            exit_code: status.code(),
        })
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, deployments: &[DeployedFixture]) -> Result<TestOutcome> {
        let results = future::join_all(deployments.iter().map(|d| self.run_one(d))).await;
        Ok(TestOutcome {
            results: results.into_iter().collect::<Result<Vec<_>>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployed(name: &str, directory: PathBuf) -> DeployedFixture {
        DeployedFixture {
            name: name.to_string(),
            url: format!("https://{}.proj.pages.dev", name),
            directory,
        }
    }

    #[tokio::test]
    async fn command_sees_deployment_env() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandTestRunner::new(r#"printf '%s %s' "$FIXTURE" "$DEPLOYMENT_URL" > seen.txt"#);

        let outcome = runner
            .run(&[deployed("basic", dir.path().to_path_buf())])
            .await
            .unwrap();

        assert!(outcome.success());
        let seen = std::fs::read_to_string(dir.path().join("seen.txt")).unwrap();
        assert_eq!(seen, "basic https://basic.proj.pages.dev");
    }

    #[tokio::test]
    async fn failing_command_fails_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandTestRunner::new(r#"test "$FIXTURE" = good"#);

        let outcome = runner
            .run(&[
                deployed("good", dir.path().to_path_buf()),
                deployed("bad", dir.path().to_path_buf()),
            ])
            .await
            .unwrap();

        assert!(!outcome.success());
        let failed: Vec<_> = outcome.failed().map(|r| r.fixture.as_str()).collect();
        assert_eq!(failed, vec!["bad"]);
        assert_eq!(outcome.results[1].exit_code, Some(1));
    }

    #[test]
    fn empty_outcome_is_success() {
        assert!(TestOutcome::default().success());
    }
}
