//! Fixture project configuration.
//!
//! Each fixture directory carries a `main.fixture` file describing how the
//! Pages project must be built and bound. The file is YAML; plain JSON
//! fixture files parse too.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::{Environment, Validate, ValidationResult};
use crate::error::{Error, Result};

/// File name of the fixture config inside a fixture directory.
pub const FIXTURE_FILE: &str = "main.fixture";

/// A value that differs between production and staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerEnvironment<T> {
    pub production: T,
    pub staging: T,
}

impl<T> PerEnvironment<T> {
    /// Value for a remote environment; `None` for local.
    pub fn get(&self, environment: Environment) -> Option<&T> {
        match environment {
            Environment::Production => Some(&self.production),
            Environment::Staging => Some(&self.staging),
            Environment::Local => None,
        }
    }

    fn both(&self) -> [(&'static str, &T); 2] {
        [("production", &self.production), ("staging", &self.staging)]
    }
}

/// Reference to a resource by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: String,
}

/// Reference to a resource by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRef {
    pub name: String,
}

/// Reference to a Worker service environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    pub environment: String,
}

/// Build settings for the project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildSettings {
    /// Command run to build the project.
    pub build_command: String,
    /// Directory of static assets to serve.
    pub build_output_directory: String,
    pub root_directory: String,
}

/// Runtime settings and bindings for preview deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentSettings {
    pub environment_variables: BTreeMap<String, String>,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    pub d1_databases: BTreeMap<String, PerEnvironment<IdRef>>,
    pub durable_object_namespaces: BTreeMap<String, PerEnvironment<IdRef>>,
    pub kv_namespaces: BTreeMap<String, PerEnvironment<IdRef>>,
    pub r2_buckets: BTreeMap<String, PerEnvironment<NameRef>>,
    pub services: BTreeMap<String, PerEnvironment<ServiceRef>>,
    pub queue_producers: BTreeMap<String, PerEnvironment<NameRef>>,
    pub analytics_engine_datasets: BTreeMap<String, PerEnvironment<NameRef>>,
}

fn default_compatibility_date() -> String {
    "2023-03-26".to_string()
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            environment_variables: BTreeMap::new(),
            compatibility_date: default_compatibility_date(),
            compatibility_flags: Vec::new(),
            d1_databases: BTreeMap::new(),
            durable_object_namespaces: BTreeMap::new(),
            kv_namespaces: BTreeMap::new(),
            r2_buckets: BTreeMap::new(),
            services: BTreeMap::new(),
            queue_producers: BTreeMap::new(),
            analytics_engine_datasets: BTreeMap::new(),
        }
    }
}

/// A fixture project's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixtureConfig {
    /// Features applied to this fixture.
    pub features: Vec<String>,
    /// Shell command run in the workspace before publishing.
    pub setup: Option<String>,
    pub build_config: BuildSettings,
    pub deployment_config: DeploymentSettings,
}

impl FixtureConfig {
    /// Loads and validates a fixture config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(Error::Io)?;
        let config = Self::parse(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
        for warning in config.validate().into_result()? {
            tracing::warn!(path = %path.display(), "{}", warning);
        }
        Ok(config)
    }

    /// Parses a fixture config without validating it.
    pub fn parse(content: &str) -> Result<Self> {
        // An empty document is an all-defaults fixture.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse fixture: {}", e)))
    }
}

fn is_uuid_v4(value: &str) -> bool {
    uuid::Uuid::parse_str(value)
        .map(|id| id.get_version_num() == 4 && value.len() == 36)
        .unwrap_or(false)
}

fn is_hex32(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_ids(
    result: &mut ValidationResult,
    field: &str,
    entries: &BTreeMap<String, PerEnvironment<IdRef>>,
    valid: fn(&str) -> bool,
    expected: &str,
) {
    for (binding, per_env) in entries {
        for (env, id) in per_env.both() {
            if !valid(&id.id) {
                result.add_error(format!(
                    "deploymentConfig.{}.{}.{}.id must be {}, got '{}'",
                    field, binding, env, expected, id.id
                ));
            }
        }
    }
}

fn check_names<T>(
    result: &mut ValidationResult,
    field: &str,
    entries: &BTreeMap<String, PerEnvironment<T>>,
    names: fn(&T) -> Vec<(&'static str, &str)>,
) {
    for (binding, per_env) in entries {
        for (env, value) in per_env.both() {
            for (key, name) in names(value) {
                if name.trim().is_empty() {
                    result.add_error(format!(
                        "deploymentConfig.{}.{}.{}.{} cannot be empty",
                        field, binding, env, key
                    ));
                }
            }
        }
    }
}

fn name_of(r: &NameRef) -> Vec<(&'static str, &str)> {
    vec![("name", r.name.as_str())]
}

fn service_names(r: &ServiceRef) -> Vec<(&'static str, &str)> {
    vec![("name", r.name.as_str()), ("environment", r.environment.as_str())]
}

impl Validate for FixtureConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let deployment = &self.deployment_config;

        if self.features.iter().any(|f| f.trim().is_empty()) {
            result.add_error("features cannot contain empty names");
        }

        if deployment.compatibility_date.len() != 10
            || NaiveDate::parse_from_str(&deployment.compatibility_date, "%Y-%m-%d").is_err()
        {
            result.add_error(format!(
                "deploymentConfig.compatibilityDate must be YYYY-MM-DD, got '{}'",
                deployment.compatibility_date
            ));
        }
        if deployment.compatibility_flags.iter().any(|f| f.trim().is_empty()) {
            result.add_error("deploymentConfig.compatibilityFlags cannot contain empty flags");
        }

        check_ids(&mut result, "d1Databases", &deployment.d1_databases, is_uuid_v4, "a UUIDv4");
        check_ids(
            &mut result,
            "durableObjectNamespaces",
            &deployment.durable_object_namespaces,
            is_hex32,
            "32 hex characters",
        );
        check_ids(
            &mut result,
            "kvNamespaces",
            &deployment.kv_namespaces,
            is_hex32,
            "32 hex characters",
        );

        check_names(&mut result, "r2Buckets", &deployment.r2_buckets, name_of);
        check_names(&mut result, "queueProducers", &deployment.queue_producers, name_of);
        check_names(
            &mut result,
            "analyticsEngineDatasets",
            &deployment.analytics_engine_datasets,
            name_of,
        );
        check_names(&mut result, "services", &deployment.services, service_names);

        if self.setup.as_deref().is_some_and(|s| s.trim().is_empty()) {
            result.add_warning("setup is set but empty; it will be skipped");
        }

        result
    }
}
