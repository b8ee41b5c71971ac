//! Project bindings and the per-kind reconciliation diff.
//!
//! Reconciliation is a full replace per kind: every existing name missing
//! from the desired set is nulled out and every desired name is set.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of binding on a Pages project's deployment config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    EnvVars,
    D1Databases,
    DurableObjectNamespaces,
    KvNamespaces,
    R2Buckets,
    Services,
    QueueProducers,
    AnalyticsEngineDatasets,
}

impl BindingKind {
    pub const ALL: [BindingKind; 8] = [
        BindingKind::EnvVars,
        BindingKind::D1Databases,
        BindingKind::DurableObjectNamespaces,
        BindingKind::KvNamespaces,
        BindingKind::R2Buckets,
        BindingKind::Services,
        BindingKind::QueueProducers,
        BindingKind::AnalyticsEngineDatasets,
    ];

    /// Field name under `deployment_configs.preview`.
    pub fn field(&self) -> &'static str {
        match self {
            BindingKind::EnvVars => "env_vars",
            BindingKind::D1Databases => "d1_databases",
            BindingKind::DurableObjectNamespaces => "durable_object_namespaces",
            BindingKind::KvNamespaces => "kv_namespaces",
            BindingKind::R2Buckets => "r2_buckets",
            BindingKind::Services => "services",
            BindingKind::QueueProducers => "queue_producers",
            BindingKind::AnalyticsEngineDatasets => "analytics_engine_datasets",
        }
    }

    /// Human label used in drift errors.
    pub fn label(&self) -> &'static str {
        match self {
            BindingKind::EnvVars => "Environment variables",
            BindingKind::D1Databases => "D1 database bindings",
            BindingKind::DurableObjectNamespaces => "Durable Object namespace bindings",
            BindingKind::KvNamespaces => "KV namespace bindings",
            BindingKind::R2Buckets => "R2 bucket bindings",
            BindingKind::Services => "Service bindings",
            BindingKind::QueueProducers => "Queue Producer bindings",
            BindingKind::AnalyticsEngineDatasets => "Analytics Engine dataset bindings",
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// Binding name to descriptor, as the control plane represents it.
pub type BindingMap = BTreeMap<String, Value>;

/// Bindings partitioned by kind. Kinds not present are empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectBindingSet {
    kinds: BTreeMap<BindingKind, BindingMap>,
}

impl ProjectBindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one binding.
    pub fn insert(&mut self, kind: BindingKind, name: impl Into<String>, descriptor: Value) {
        self.kinds.entry(kind).or_default().insert(name.into(), descriptor);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, kind: BindingKind, name: impl Into<String>, descriptor: Value) -> Self {
        self.insert(kind, name, descriptor);
        self
    }

    /// Bindings of one kind (empty if none).
    pub fn get(&self, kind: BindingKind) -> BindingMap {
        self.kinds.get(&kind).cloned().unwrap_or_default()
    }

    /// Reads a binding set out of a `deployment_configs.preview` object.
    ///
    /// Missing or `null` kinds read as empty; `null` entries are dropped.
    pub fn from_preview(preview: &serde_json::Map<String, Value>) -> Self {
        let mut set = Self::new();
        for kind in BindingKind::ALL {
            if let Some(Value::Object(entries)) = preview.get(kind.field()) {
                for (name, descriptor) in entries {
                    if !descriptor.is_null() {
                        set.insert(kind, name.clone(), descriptor.clone());
                    }
                }
            }
        }
        set
    }
}

/// What to change for one binding kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingDiff {
    /// Existing names to null out.
    pub to_null: Vec<String>,
    /// Desired names and their descriptors.
    pub to_set: BindingMap,
}

impl BindingDiff {
    /// Renders the diff as a PATCH fragment.
    pub fn to_patch(&self) -> Value {
        let mut patch = serde_json::Map::new();
        for name in &self.to_null {
            patch.insert(name.clone(), Value::Null);
        }
        for (name, descriptor) in &self.to_set {
            patch.insert(name.clone(), descriptor.clone());
        }
        Value::Object(patch)
    }

    /// True if applying this diff to `existing` changes nothing.
    pub fn is_noop_for(&self, existing: &BindingMap) -> bool {
        self.to_null.is_empty()
            && self.to_set.len() == existing.len()
            && self
                .to_set
                .iter()
                .all(|(name, descriptor)| existing.get(name) == Some(descriptor))
    }
}

/// Computes the full-replace diff for one binding kind.
pub fn reconcile<'a>(
    existing: impl IntoIterator<Item = &'a String>,
    desired: &BindingMap,
) -> BindingDiff {
    let mut to_null: Vec<String> = existing
        .into_iter()
        .filter(|name| !desired.contains_key(*name))
        .cloned()
        .collect();
    to_null.sort();
    to_null.dedup();

    BindingDiff {
        to_null,
        to_set: desired.clone(),
    }
}

/// Computes diffs for every kind.
pub fn reconcile_all(
    existing: &ProjectBindingSet,
    desired: &ProjectBindingSet,
) -> BTreeMap<BindingKind, BindingDiff> {
    BindingKind::ALL
        .into_iter()
        .map(|kind| {
            let current = existing.get(kind);
            (kind, reconcile(current.keys(), &desired.get(kind)))
        })
        .collect()
}
