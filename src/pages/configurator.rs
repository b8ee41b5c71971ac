//! Project configurator.
//!
//! Reconciles the remote project's build settings and preview bindings
//! against a fixture's desired configuration, then verifies the stored
//! project matches exactly. Must run while holding the project mutex.

use serde_json::{json, Value};

use crate::config::Environment;
use crate::error::{DriftKind, Error, Result};
use crate::fixture::FixtureConfig;
use crate::pages::api::{PagesClient, Project};
use crate::pages::bindings::{self, BindingKind, BindingMap, ProjectBindingSet};

/// Project settings a fixture needs, resolved for one environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredProjectConfig {
    pub build_command: String,
    pub build_output_directory: String,
    pub root_directory: String,
    pub compatibility_date: String,
    pub compatibility_flags: Vec<String>,
    pub bindings: ProjectBindingSet,
}

impl DesiredProjectConfig {
    /// Resolves a fixture's per-environment bindings into API descriptors.
    pub fn from_fixture(fixture: &FixtureConfig, environment: Environment) -> Result<Self> {
        let deployment = &fixture.deployment_config;
        let mut set = ProjectBindingSet::new();

        for (name, value) in &deployment.environment_variables {
            set.insert(
                BindingKind::EnvVars,
                name.clone(),
                json!({ "type": "plain_text", "value": value }),
            );
        }

        let unsupported = || {
            Error::Config(format!(
                "project bindings cannot be resolved for the {} environment",
                environment
            ))
        };

        for (name, per_env) in &deployment.d1_databases {
            let db = per_env.get(environment).ok_or_else(unsupported)?;
            set.insert(BindingKind::D1Databases, name.clone(), json!({ "id": db.id }));
        }
        for (name, per_env) in &deployment.durable_object_namespaces {
            let ns = per_env.get(environment).ok_or_else(unsupported)?;
            set.insert(
                BindingKind::DurableObjectNamespaces,
                name.clone(),
                json!({ "namespace_id": ns.id }),
            );
        }
        for (name, per_env) in &deployment.kv_namespaces {
            let ns = per_env.get(environment).ok_or_else(unsupported)?;
            set.insert(
                BindingKind::KvNamespaces,
                name.clone(),
                json!({ "namespace_id": ns.id }),
            );
        }
        for (name, per_env) in &deployment.r2_buckets {
            let bucket = per_env.get(environment).ok_or_else(unsupported)?;
            set.insert(BindingKind::R2Buckets, name.clone(), json!({ "name": bucket.name }));
        }
        for (name, per_env) in &deployment.services {
            let service = per_env.get(environment).ok_or_else(unsupported)?;
            set.insert(
                BindingKind::Services,
                name.clone(),
                json!({ "service": service.name, "environment": service.environment }),
            );
        }
        for (name, per_env) in &deployment.queue_producers {
            let queue = per_env.get(environment).ok_or_else(unsupported)?;
            set.insert(BindingKind::QueueProducers, name.clone(), json!({ "name": queue.name }));
        }
        for (name, per_env) in &deployment.analytics_engine_datasets {
            let dataset = per_env.get(environment).ok_or_else(unsupported)?;
            set.insert(
                BindingKind::AnalyticsEngineDatasets,
                name.clone(),
                json!({ "dataset": dataset.name }),
            );
        }

        Ok(Self {
            build_command: fixture.build_config.build_command.clone(),
            build_output_directory: fixture.build_config.build_output_directory.clone(),
            root_directory: fixture.build_config.root_directory.clone(),
            compatibility_date: deployment.compatibility_date.clone(),
            compatibility_flags: deployment.compatibility_flags.clone(),
            bindings: set,
        })
    }
}

/// Builds the PATCH payload that moves `current` to `desired`.
pub fn build_patch(current: &Project, desired: &DesiredProjectConfig) -> Value {
    let existing = current.deployment_configs.preview.binding_set();

    let mut preview = serde_json::Map::new();
    preview.insert("compatibility_date".to_string(), json!(desired.compatibility_date));
    preview.insert("compatibility_flags".to_string(), json!(desired.compatibility_flags));
    for (kind, diff) in bindings::reconcile_all(&existing, &desired.bindings) {
        preview.insert(kind.field().to_string(), diff.to_patch());
    }

    json!({
        "build_config": {
            "build_command": desired.build_command,
            "destination_dir": desired.build_output_directory,
            "root_dir": desired.root_directory,
        },
        "deployment_configs": { "preview": preview },
    })
}

fn drift(kind: DriftKind, expected: impl serde::Serialize, actual: impl serde::Serialize) -> Error {
    Error::ConfigurationDrift {
        kind,
        expected: serde_json::to_string(&expected).unwrap_or_default(),
        actual: serde_json::to_string(&actual).unwrap_or_default(),
    }
}

/// Checks that a stored project matches `desired` exactly.
///
/// Fails on the first mismatch, naming the setting or binding kind.
pub fn verify(project: &Project, desired: &DesiredProjectConfig) -> Result<()> {
    let build = &project.build_config;
    let scalars = [
        (DriftKind::BuildCommand, &build.build_command, &desired.build_command),
        (
            DriftKind::BuildOutputDirectory,
            &build.destination_dir,
            &desired.build_output_directory,
        ),
        (DriftKind::RootDirectory, &build.root_dir, &desired.root_directory),
    ];
    for (kind, actual, expected) in scalars {
        let actual = actual.as_deref().unwrap_or_default();
        if actual != expected.as_str() {
            return Err(drift(kind, expected, actual));
        }
    }

    let preview = &project.deployment_configs.preview;
    if preview.compatibility_date.as_deref() != Some(desired.compatibility_date.as_str()) {
        return Err(drift(
            DriftKind::CompatibilityDate,
            &desired.compatibility_date,
            &preview.compatibility_date,
        ));
    }
    let flags = preview.compatibility_flags.clone().unwrap_or_default();
    if flags != desired.compatibility_flags {
        return Err(drift(
            DriftKind::CompatibilityFlags,
            &desired.compatibility_flags,
            &flags,
        ));
    }

    let stored = preview.binding_set();
    for kind in BindingKind::ALL {
        let actual: BindingMap = stored.get(kind);
        let expected = desired.bindings.get(kind);
        if actual != expected {
            return Err(drift(DriftKind::Binding(kind), &expected, &actual));
        }
    }
    Ok(())
}

/// Applies desired project configuration with verify-after-write.
#[derive(Clone)]
pub struct ProjectConfigurator {
    api: PagesClient,
}

impl ProjectConfigurator {
    pub fn new(api: PagesClient) -> Self {
        Self { api }
    }

    /// Reconciles the remote project and returns it as stored.
    pub async fn reconcile(&self, desired: &DesiredProjectConfig) -> Result<Project> {
        tracing::info!(project = %self.api.credentials().project_name, "configuring project");

        let current = self.api.get_project().await?;
        tracing::debug!(?current, "fetched initial project state");

        let payload = build_patch(&current, desired);
        tracing::debug!(%payload, "computed required changes");

        let updated = self.api.patch_project(&payload).await?;
        verify(&updated, desired)?;

        tracing::info!(project = %self.api.credentials().project_name, "project configured");
        Ok(updated)
    }
}
