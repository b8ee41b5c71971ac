//! Pages e2e CLI
//!
//! Deploys fixtures, runs the test command against each live deployment and
//! tears down everything it created.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pages_e2e::{
    BranchPublisher, CommandTestRunner, Environment, Error, FixtureFilter, Orchestrator,
    ReqwestClient, Result, RunConfig, SystemClock, TeardownService, Validate,
};

#[derive(Parser)]
#[command(
    name = "pages-e2e",
    version,
    about = "End-to-end tests against ephemeral Pages deployments"
)]
struct Cli {
    /// Path to the run configuration
    #[arg(long, default_value = "pages-e2e.toml")]
    config: PathBuf,

    /// Target environment (overrides the config file)
    #[arg(long)]
    environment: Option<Environment>,

    /// Fixtures to run (default: all)
    #[arg(long)]
    include: Vec<String>,

    /// Fixtures to skip
    #[arg(long)]
    exclude: Vec<String>,

    /// Command run per deployed fixture with DEPLOYMENT_URL and FIXTURE set
    #[arg(long, default_value = "npm test")]
    test_command: String,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let teardown = Arc::new(TeardownService::new());
    let code = match prepare(&cli, teardown.clone()) {
        Ok((orchestrator, fixtures)) => {
            tokio::select! {
                report = orchestrator.run(&fixtures) => {
                    for failure in &report.failures {
                        tracing::error!(fixture = %failure.fixture, "{}", failure.error);
                    }
                    report.exit_code()
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, tearing down");
                    130
                }
            }
        }
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    };

    let report = teardown.teardown().await;
    if !report.is_clean() {
        tracing::warn!(failures = report.failures.len(), "teardown finished with failures");
    }
    std::process::exit(code);
}

fn prepare(cli: &Cli, teardown: Arc<TeardownService>) -> Result<(Orchestrator, Vec<String>)> {
    let mut config = RunConfig::load(&cli.config)?;
    if let Some(environment) = cli.environment {
        config = config.with_environment(environment);
    }
    tracing::info!(environment = %config.environment, trigger = ?config.trigger, "loaded configuration");
    for warning in config.validate().into_result()? {
        tracing::warn!("{}", warning);
    }

    let remote = config
        .project
        .git_repo
        .clone()
        .ok_or_else(|| Error::Config("project.git_repo is required".to_string()))?;
    let publisher = Arc::new(BranchPublisher::new(remote, config.git.clone()));
    let runner = Arc::new(CommandTestRunner::new(&cli.test_command));
    let http = Arc::new(ReqwestClient::new(config.request_timeout())?);

    let orchestrator = Orchestrator::new(
        Arc::new(config),
        http,
        Arc::new(SystemClock),
        publisher,
        runner,
        teardown,
    )?;

    let filter = FixtureFilter {
        include: cli.include.clone(),
        exclude: cli.exclude.clone(),
    };
    let fixtures = orchestrator.discover(&filter)?;
    if fixtures.is_empty() {
        return Err(Error::Config("no fixtures matched".to_string()));
    }
    tracing::info!(fixtures = ?fixtures, "starting run");
    Ok((orchestrator, fixtures))
}
