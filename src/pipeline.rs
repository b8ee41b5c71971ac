//! Per-fixture deployment pipeline and the multi-fixture orchestrator.
//!
//! Within one fixture every step is sequential: publish, hook, mutex,
//! configure, invoke, release, poll, provision. Fixtures run concurrently
//! and fail independently; only the project mutex serializes them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future;
use tokio::process::Command;
use tracing::Instrument;

use crate::clock::Clock;
use crate::config::{Environment, RunConfig, Trigger};
use crate::error::{Error, Result};
use crate::fixture::{FixtureConfig, FIXTURE_FILE};
use crate::git::Publisher;
use crate::http::HttpClient;
use crate::mutex::{self, MutexClient};
use crate::pages::{
    DeploymentPoller, DeploymentTrigger, DesiredProjectConfig, PagesClient, ProjectConfigurator,
    ProvisioningPoller,
};
use crate::runner::{DeployedFixture, TestOutcome, TestRunner};
use crate::teardown::TeardownService;

/// Drives one deployment from deploy hook to a live URL.
#[derive(Clone)]
pub struct DeploymentCoordinator {
    environment: Environment,
    mutex_key: String,
    mutex: MutexClient,
    teardown: Arc<TeardownService>,
    trigger: DeploymentTrigger,
    configurator: ProjectConfigurator,
    poller: DeploymentPoller,
    provisioner: ProvisioningPoller,
}

impl DeploymentCoordinator {
    pub fn new(
        config: &RunConfig,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        teardown: Arc<TeardownService>,
    ) -> Result<Self> {
        let host = config.host()?.clone();
        let mutex_key = mutex::encode_key(&format!(
            "{}:{}:{}",
            host.api, config.project.account_id, config.project.project_name
        ));
        let api = PagesClient::new(http.clone(), host, config.project.clone());

        Ok(Self {
            environment: config.environment,
            mutex_key,
            mutex: MutexClient::new(http.clone(), clock, &config.lock_service_url, config.mutex),
            trigger: DeploymentTrigger::new(api.clone(), teardown.clone()),
            teardown,
            configurator: ProjectConfigurator::new(api.clone()),
            poller: DeploymentPoller::new(api, config.deployment),
            provisioner: ProvisioningPoller::new(http, config.provisioning),
        })
    }

    /// Deploys `branch` with `desired` project settings, returning the URL.
    pub async fn deploy(&self, branch: &str, desired: &DesiredProjectConfig) -> Result<String> {
        let hook_id = self.trigger.create_hook(branch).await?;

        tracing::info!(key = %self.mutex_key, "acquiring mutex");
        let lock = self.mutex.acquire(&self.mutex_key).await?;

        // Covers a run cancelled while the lock is held.
        let released = Arc::new(AtomicBool::new(false));
        let (client, held, flag) = (self.mutex.clone(), lock.clone(), released.clone());
        self.teardown.register("Release Mutex", move || async move {
            if flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            client.release(&held).await
        });

        let deployment_id = async {
            self.configurator.reconcile(desired).await?;
            self.trigger.fire(&hook_id).await
        }
        .await;

        match self.mutex.release(&lock).await {
            Ok(()) => released.store(true, Ordering::SeqCst),
            Err(e) => {
                tracing::warn!(key = %self.mutex_key, error = %e, "failed to release mutex, retrying at teardown")
            }
        }
        let deployment_id = deployment_id?;

        let url = self.poller.await_completion(&deployment_id).await?;
        if self.environment == Environment::Production {
            self.provisioner.await_provisioned(&url).await?;
        }
        Ok(url)
    }
}

/// Selects fixtures by name.
#[derive(Debug, Clone, Default)]
pub struct FixtureFilter {
    /// Names to run; empty or `*` means all.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl FixtureFilter {
    pub fn matches(&self, name: &str) -> bool {
        let included = self.include.is_empty()
            || self.include.iter().any(|i| i == "*" || i == name);
        included && !self.exclude.iter().any(|e| e == name)
    }
}

/// A fixture whose pipeline failed.
#[derive(Debug)]
pub struct FixtureFailure {
    pub fixture: String,
    pub error: Error,
}

/// Outcome of a whole run, before teardown.
#[derive(Debug, Default)]
pub struct RunReport {
    pub deployed: Vec<DeployedFixture>,
    pub failures: Vec<FixtureFailure>,
    pub tests: Option<TestOutcome>,
    /// Set when the test runner itself could not run.
    pub test_error: Option<Error>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
            && self.test_error.is_none()
            && self.tests.as_ref().map_or(true, TestOutcome::success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

/// Prepares, deploys and tests fixtures.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    coordinator: DeploymentCoordinator,
    publisher: Arc<dyn Publisher>,
    runner: Arc<dyn TestRunner>,
    clock: Arc<dyn Clock>,
    teardown: Arc<TeardownService>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        publisher: Arc<dyn Publisher>,
        runner: Arc<dyn TestRunner>,
        teardown: Arc<TeardownService>,
    ) -> Result<Self> {
        if config.trigger == Trigger::DirectUpload {
            return Err(Error::Config(
                "the direct-upload trigger is not supported".to_string(),
            ));
        }
        let coordinator = DeploymentCoordinator::new(&config, http, clock.clone(), teardown.clone())?;
        Ok(Self {
            config,
            coordinator,
            publisher,
            runner,
            clock,
            teardown,
        })
    }

    /// Fixture directories under the fixtures dir that pass `filter`, sorted.
    pub fn discover(&self, filter: &FixtureFilter) -> Result<Vec<String>> {
        let mut fixtures = Vec::new();
        for entry in std::fs::read_dir(&self.config.fixtures_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if filter.matches(&name) {
                fixtures.push(name);
            }
        }
        fixtures.sort();
        Ok(fixtures)
    }

    /// Deploys every fixture concurrently, then tests the ones that deployed.
    ///
    /// Teardown is left to the caller so it runs even if this panics.
    pub async fn run(&self, fixtures: &[String]) -> RunReport {
        let started = self.clock.now();
        tracing::info!(count = fixtures.len(), "running fixtures");

        let pipelines = fixtures.iter().map(|name| {
            let span = tracing::info_span!("fixture", name = %name);
            async move { (name.clone(), self.run_fixture(name, started).await) }.instrument(span)
        });

        let mut report = RunReport::default();
        for (fixture, outcome) in future::join_all(pipelines).await {
            match outcome {
                Ok(deployed) => report.deployed.push(deployed),
                Err(error) => {
                    tracing::error!(fixture = %fixture, error = %error, "fixture failed");
                    report.failures.push(FixtureFailure { fixture, error });
                }
            }
        }

        if report.deployed.is_empty() {
            tracing::warn!("no fixtures deployed; skipping tests");
            return report;
        }
        match self.runner.run(&report.deployed).await {
            Ok(outcome) => report.tests = Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, "test run failed");
                report.test_error = Some(e);
            }
        }
        report
    }

    async fn run_fixture(&self, name: &str, started: DateTime<Utc>) -> Result<DeployedFixture> {
        let timestamp = started.timestamp_millis();
        let directory = workspace_dir(&self.config.workspaces_dir, name, timestamp);

        let source = self.config.fixtures_dir.join(name);
        tracing::info!(from = %source.display(), to = %directory.display(), "copying fixture");
        copy_fixture(&source, &directory)?;

        let fixture = FixtureConfig::load(directory.join(FIXTURE_FILE))?;
        run_setup(&fixture, &directory).await?;
        run_feature_setup(&fixture.features, &self.config.features_dir, &directory).await?;
        let desired = DesiredProjectConfig::from_fixture(&fixture, self.config.environment)?;

        let branch = format!("{}-{}", name, timestamp);
        self.publisher.publish(&directory, &branch, started).await?;
        let publisher = self.publisher.clone();
        let (dir, br) = (directory.clone(), branch.clone());
        self.teardown.register("Delete Git branch", move || async move {
            publisher.delete(&dir, &br).await
        });

        let url = self.coordinator.deploy(&branch, &desired).await?;
        Ok(DeployedFixture {
            name: name.to_string(),
            url,
            directory,
        })
    }
}

/// Directory a fixture is copied into for one run.
pub fn workspace_dir(workspaces: &Path, fixture: &str, timestamp: i64) -> PathBuf {
    workspaces.join(format!("{}-{}", fixture, timestamp))
}

const SKIPPED_ENTRIES: [&str; 2] = [".git", "node_modules"];

/// Recursively copies a fixture into its workspace.
fn copy_fixture(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if SKIPPED_ENTRIES.iter().any(|s| name == *s) {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_fixture(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn run_setup(fixture: &FixtureConfig, directory: &Path) -> Result<()> {
    let Some(command) = fixture.setup.as_deref().filter(|c| !c.trim().is_empty()) else {
        tracing::info!("no setup command found, continuing");
        return Ok(());
    };

    tracing::info!(command = %command, "configuring fixture");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(directory)
        .output()
        .await
        .map_err(|e| Error::Setup(format!("failed to run '{}': {}", command, e)))?;

    if !output.status.success() {
        return Err(Error::Setup(format!(
            "'{}' exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    tracing::debug!(output = %String::from_utf8_lossy(&output.stdout).trim(), "setup output");
    Ok(())
}

/// Runs `make setup` for each feature in `{features_dir}/{feature}` with
/// `WORKSPACE_DIR` pointing at the fixture workspace. Features without a
/// `setup` target are skipped.
async fn run_feature_setup(features: &[String], features_dir: &Path, workspace: &Path) -> Result<()> {
    if features.is_empty() {
        return Ok(());
    }
    let workspace = std::fs::canonicalize(workspace)?;
    tracing::info!(features = ?features, "setting up fixture features");

    for feature in features {
        let directory = features_dir.join(feature);
        if !directory.is_dir() {
            return Err(Error::Setup(format!(
                "unknown feature '{}': {} is not a directory",
                feature,
                directory.display()
            )));
        }

        tracing::info!(feature = %feature, "setting up feature");
        let output = Command::new("make")
            .arg("setup")
            .current_dir(&directory)
            .env("WORKSPACE_DIR", &workspace)
            .output()
            .await
            .map_err(|e| Error::Setup(format!("failed to run make for feature '{}': {}", feature, e)))?;

        if output.status.success() {
            continue;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No rule to make target") {
            tracing::info!(feature = %feature, "no setup command found, continuing");
            continue;
        }
        return Err(Error::Setup(format!(
            "feature '{}' setup exited with {}: {}",
            feature,
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}
