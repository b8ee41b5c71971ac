//! Best-effort cleanup of remote side effects.
//!
//! Actions are registered the moment a resource is created and all run
//! concurrently at the end of the run. A failing or panicking action never
//! prevents another from running, and each action runs at most once.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use futures::future::{self, BoxFuture};
use futures::FutureExt;

use crate::error::Result;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct TeardownEntry {
    name: String,
    action: Action,
}

/// A cleanup action that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of a teardown pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Names of actions that completed, in registration order.
    pub completed: Vec<String>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Append-only registry of cleanup actions.
#[derive(Default)]
pub struct TeardownService {
    entries: Mutex<Vec<TeardownEntry>>,
}

impl TeardownService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup action.
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(action = %name, "registered teardown action");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TeardownEntry {
                name,
                action: Box::new(move || action().boxed()),
            });
    }

    /// Number of actions waiting to run.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered action concurrently and reports the outcome.
    ///
    /// Failures are logged as warnings and returned, never raised.
    pub async fn teardown(&self) -> TeardownReport {
        let entries: Vec<TeardownEntry> =
            std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()));
        if entries.is_empty() {
            return TeardownReport::default();
        }
        tracing::info!(actions = entries.len(), "running teardown");

        let runs = entries.into_iter().map(|entry| async move {
            let outcome = AssertUnwindSafe((entry.action)()).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            (entry.name, error)
        });

        let mut report = TeardownReport::default();
        for (name, error) in future::join_all(runs).await {
            match error {
                None => report.completed.push(name),
                Some(error) => report.failures.push(TeardownFailure { name, error }),
            }
        }

        tracing::info!("cleanup complete");
        for failure in &report.failures {
            tracing::warn!(action = %failure.name, error = %failure.error, "teardown action failed");
        }
        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
