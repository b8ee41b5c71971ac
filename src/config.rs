//! Run configuration.
//!
//! A single [`RunConfig`] is built once at process start and threaded
//! through every component. Nothing below `main` reads the environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::completion::PollSchedule;
use crate::error::{Error, Operation, Result};

/// Target platform environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Local,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
            Environment::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "production" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "local" => Ok(Environment::Local),
            other => Err(Error::Config(format!("unknown environment '{}'", other))),
        }
    }
}

/// How deployments are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Trigger {
    #[default]
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "gitlab")]
    GitLab,
    #[serde(rename = "direct-upload")]
    DirectUpload,
}

/// API and dashboard origins for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub api: String,
    pub dash: String,
}

/// Hosts keyed by environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hosts {
    #[serde(default = "default_production_host")]
    pub production: Host,
    #[serde(default = "default_staging_host")]
    pub staging: Host,
}

fn default_production_host() -> Host {
    Host {
        api: "https://api.cloudflare.com".to_string(),
        dash: "https://dash.cloudflare.com".to_string(),
    }
}

fn default_staging_host() -> Host {
    Host {
        api: "https://api.staging.cloudflare.com".to_string(),
        dash: "https://dash.staging.cloudflare.com".to_string(),
    }
}

impl Default for Hosts {
    fn default() -> Self {
        Self {
            production: default_production_host(),
            staging: default_staging_host(),
        }
    }
}

impl Hosts {
    /// Returns the host for a remote environment.
    pub fn for_environment(&self, environment: Environment) -> Result<&Host> {
        match environment {
            Environment::Production => Ok(&self.production),
            Environment::Staging => Ok(&self.staging),
            Environment::Local => Err(Error::Config(
                "the local environment has no remote host".to_string(),
            )),
        }
    }
}

/// Credentials for the Pages project fixtures are deployed to.
#[derive(Clone, PartialEq, Eq)]
pub struct ProjectCredentials {
    pub account_id: String,
    pub project_name: String,
    pub git_repo: Option<String>,
    pub api_token: String,
}

impl fmt::Debug for ProjectCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectCredentials")
            .field("account_id", &self.account_id)
            .field("project_name", &self.project_name)
            .field("git_repo", &self.git_repo)
            .field("api_token", &"[REDACTED]")
            .finish()
    }
}

/// Identity used for fixture branch commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitIdentity {
    #[serde(default = "default_git_username")]
    pub username: String,
    #[serde(default = "default_git_email")]
    pub email: String,
}

fn default_git_username() -> String {
    "Pages e2e Tests Bot".to_string()
}

fn default_git_email() -> String {
    "pages-e2e-bot@example.com".to_string()
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            username: default_git_username(),
            email: default_git_email(),
        }
    }
}

/// Distributed mutex timings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MutexTimings {
    #[serde(default = "default_mutex_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_mutex_stale")]
    pub stale_after_secs: u64,
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,
}

fn default_mutex_timeout() -> u64 {
    600 // 10 minutes
}

fn default_mutex_stale() -> u64 {
    60
}

fn default_check_interval() -> u64 {
    5
}

impl Default for MutexTimings {
    fn default() -> Self {
        Self {
            timeout_secs: default_mutex_timeout(),
            stale_after_secs: default_mutex_stale(),
            interval_secs: default_check_interval(),
        }
    }
}

impl MutexTimings {
    pub fn schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Operation::MutexAcquisition,
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.timeout_secs),
        )
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Deployment completion polling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeploymentTimings {
    /// Builds get 20 minutes; the extra 3 cover queueing.
    #[serde(default = "default_deployment_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,
    /// Not-OK API responses tolerated before erroring.
    #[serde(default = "default_api_failure_threshold")]
    pub api_failure_threshold: u32,
}

fn default_deployment_timeout() -> u64 {
    23 * 60
}

fn default_api_failure_threshold() -> u32 {
    5
}

impl Default for DeploymentTimings {
    fn default() -> Self {
        Self {
            timeout_secs: default_deployment_timeout(),
            interval_secs: default_check_interval(),
            api_failure_threshold: default_api_failure_threshold(),
        }
    }
}

impl DeploymentTimings {
    pub fn schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Operation::DeploymentCompletion,
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// Edge provisioning polling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProvisioningTimings {
    #[serde(default = "default_provisioning_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,
}

fn default_provisioning_timeout() -> u64 {
    30
}

impl Default for ProvisioningTimings {
    fn default() -> Self {
        Self {
            timeout_secs: default_provisioning_timeout(),
            interval_secs: default_check_interval(),
        }
    }
}

impl ProvisioningTimings {
    pub fn schedule(&self) -> PollSchedule {
        PollSchedule::new(
            Operation::Provisioning,
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// Project section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectSection {
    account_id: String,
    project_name: String,
    #[serde(default)]
    git_repo: Option<String>,
    #[serde(default = "default_api_token_env")]
    api_token_env: String,
}

fn default_api_token_env() -> String {
    "CLOUDFLARE_API_TOKEN".to_string()
}

/// On-disk form of [`RunConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunConfigFile {
    #[serde(default)]
    environment: Environment,
    #[serde(default)]
    trigger: Trigger,
    #[serde(default)]
    hosts: Hosts,
    project: ProjectSection,
    #[serde(default = "default_lock_service_url")]
    lock_service_url: String,
    #[serde(default)]
    git: GitIdentity,
    #[serde(default = "default_fixtures_dir")]
    fixtures_dir: PathBuf,
    #[serde(default = "default_features_dir")]
    features_dir: PathBuf,
    #[serde(default = "default_workspaces_dir")]
    workspaces_dir: PathBuf,
    #[serde(default = "default_request_timeout")]
    request_timeout_secs: u64,
    #[serde(default)]
    mutex: MutexTimings,
    #[serde(default)]
    deployment: DeploymentTimings,
    #[serde(default)]
    provisioning: ProvisioningTimings,
}

fn default_lock_service_url() -> String {
    "https://mutex.uno".to_string()
}

fn default_fixtures_dir() -> PathBuf {
    PathBuf::from("fixtures")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_features_dir() -> PathBuf {
    PathBuf::from("features")
}

fn default_workspaces_dir() -> PathBuf {
    PathBuf::from("workspaces")
}

/// Fully-resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub environment: Environment,
    pub trigger: Trigger,
    pub hosts: Hosts,
    pub project: ProjectCredentials,
    pub lock_service_url: String,
    pub git: GitIdentity,
    pub fixtures_dir: PathBuf,
    /// Shared features fixtures opt into by name.
    pub features_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    pub mutex: MutexTimings,
    pub deployment: DeploymentTimings,
    pub provisioning: ProvisioningTimings,
}

impl RunConfig {
    /// Loads configuration from a TOML file, reading the API token from
    /// the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
        Self::from_toml(&content, |name| std::env::var(name).ok())
    }

    /// Parses configuration, resolving the API token through `lookup`.
    pub fn from_toml(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: RunConfigFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        let api_token = lookup(&file.project.api_token_env).ok_or_else(|| {
            Error::Config(format!(
                "environment variable '{}' not set",
                file.project.api_token_env
            ))
        })?;

        Ok(Self {
            environment: file.environment,
            trigger: file.trigger,
            hosts: file.hosts,
            project: ProjectCredentials {
                account_id: file.project.account_id,
                project_name: file.project.project_name,
                git_repo: file.project.git_repo,
                api_token,
            },
            lock_service_url: file.lock_service_url.trim_end_matches('/').to_string(),
            git: file.git,
            fixtures_dir: file.fixtures_dir,
            features_dir: file.features_dir,
            workspaces_dir: file.workspaces_dir,
            request_timeout_secs: file.request_timeout_secs,
            mutex: file.mutex,
            deployment: file.deployment,
            provisioning: file.provisioning,
        })
    }

    /// Sets the target environment.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Host for the configured environment.
    pub fn host(&self) -> Result<&Host> {
        self.hosts.for_environment(self.environment)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for RunConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.project.account_id.trim().is_empty() {
            result.add_error("project.account_id cannot be empty");
        }
        if self.project.project_name.trim().is_empty() {
            result.add_error("project.project_name cannot be empty");
        }
        if self.project.api_token.trim().is_empty() {
            result.add_error("API token cannot be empty");
        }

        if self.environment == Environment::Local {
            result.add_error("the local environment is not supported");
        }

        match self.trigger {
            Trigger::DirectUpload => {
                result.add_error("the direct-upload trigger is not supported");
            }
            Trigger::GitHub | Trigger::GitLab => {
                if self.project.git_repo.is_none() {
                    result.add_error("project.git_repo is required for git triggers");
                }
            }
        }

        if self.mutex.interval_secs == 0
            || self.deployment.interval_secs == 0
            || self.provisioning.interval_secs == 0
        {
            result.add_error("poll intervals must be at least 1 second");
        }

        if self.mutex.stale_after_secs >= self.mutex.timeout_secs {
            result.add_warning(
                "mutex stale threshold is not shorter than the acquire timeout; stale locks will never be taken over",
            );
        }

        if self.request_timeout_secs == 0 {
            result.add_error("request_timeout_secs must be at least 1 second");
        }

        if self.deployment.api_failure_threshold == 0 {
            result.add_warning("api_failure_threshold = 0 means the first not-OK response is fatal");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[project]
account_id = "acc"
project_name = "pages-e2e-tests"
git_repo = "git@github.com:example/pages-e2e-tests.git"
"#;

    fn token(name: &str) -> Option<String> {
        (name == "CLOUDFLARE_API_TOKEN").then(|| "secret-token".to_string())
    }

    #[test]
    fn minimal_config_uses_documented_defaults() {
        let config = RunConfig::from_toml(MINIMAL, token).unwrap();

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.trigger, Trigger::GitHub);
        assert_eq!(config.lock_service_url, "https://mutex.uno");
        assert_eq!(config.mutex.timeout_secs, 600);
        assert_eq!(config.mutex.stale_after_secs, 60);
        assert_eq!(config.mutex.interval_secs, 5);
        assert_eq!(config.deployment.timeout_secs, 23 * 60);
        assert_eq!(config.deployment.api_failure_threshold, 5);
        assert_eq!(config.provisioning.timeout_secs, 30);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.features_dir, PathBuf::from("features"));
        assert_eq!(config.project.api_token, "secret-token");
        assert!(config.validate().is_valid());
    }

    #[test]
    fn token_env_name_is_configurable() {
        let toml = r#"
environment = "staging"
trigger = "gitlab"

[project]
account_id = "acc"
project_name = "proj"
git_repo = "git@gitlab.com:example/proj.git"
api_token_env = "STAGING_TOKEN"
"#;
        let config = RunConfig::from_toml(toml, |name| {
            (name == "STAGING_TOKEN").then(|| "t".to_string())
        })
        .unwrap();
        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.trigger, Trigger::GitLab);
        assert_eq!(
            config.host().unwrap().api,
            "https://api.staging.cloudflare.com"
        );
    }

    #[test]
    fn request_timeout_is_configurable_and_validated() {
        let config =
            RunConfig::from_toml(&format!("request_timeout_secs = 10\n{}", MINIMAL), token).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));

        let zero =
            RunConfig::from_toml(&format!("request_timeout_secs = 0\n{}", MINIMAL), token).unwrap();
        let validation = zero.validate();
        assert!(validation
            .errors
            .iter()
            .any(|e| e.contains("request_timeout_secs")));
    }

    #[test]
    fn missing_token_is_config_error() {
        let err = RunConfig::from_toml(MINIMAL, |_| None).unwrap_err();
        assert!(err.to_string().contains("CLOUDFLARE_API_TOKEN"));
    }

    #[test]
    fn debug_output_redacts_token() {
        let config = RunConfig::from_toml(MINIMAL, token).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn local_environment_fails_validation() {
        let config = RunConfig::from_toml(MINIMAL, token)
            .unwrap()
            .with_environment(Environment::Local);
        assert!(config.host().is_err());
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn git_trigger_requires_repo() {
        let toml = r#"
[project]
account_id = "acc"
project_name = "proj"
"#;
        let config = RunConfig::from_toml(toml, token).unwrap();
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.contains("git_repo")));
    }

    #[test]
    fn direct_upload_is_rejected() {
        let toml = format!("trigger = \"direct-upload\"\n{}", MINIMAL);
        let config = RunConfig::from_toml(&toml, token).unwrap();
        assert!(config.validate().into_result().is_err());
    }

    #[test]
    fn stale_threshold_longer_than_timeout_warns() {
        let mut config = RunConfig::from_toml(MINIMAL, token).unwrap();
        config.mutex.stale_after_secs = 900;
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("stale")));
    }

    #[test]
    fn environment_parses_from_str() {
        assert_eq!("staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert!("moon".parse::<Environment>().is_err());
    }
}
