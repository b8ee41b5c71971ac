//! Error types for the Pages e2e orchestrator.
//!
//! Every remote-call failure is normalized into an [`ApiError`] carrying the
//! HTTP status, status text and raw body. Formatting happens only in the
//! `Display` impls.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::http::HttpResponse;
use crate::pages::bindings::BindingKind;

/// Long-running operation that can hit a hard deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Acquiring the distributed mutex.
    MutexAcquisition,
    /// Waiting for a deployment to reach a terminal stage.
    DeploymentCompletion,
    /// Waiting for a deployment to be served at the edge.
    Provisioning,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::MutexAcquisition => write!(f, "mutex acquisition"),
            Operation::DeploymentCompletion => write!(f, "deployment completion"),
            Operation::Provisioning => write!(f, "edge provisioning"),
        }
    }
}

/// A remote call that returned something other than what we expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Optional human message prefixed to the rendered error.
    pub message: Option<String>,
    /// HTTP status code.
    pub status: u16,
    /// HTTP status text (canonical reason phrase).
    pub status_text: String,
    /// Raw response body.
    pub body: String,
}

impl ApiError {
    /// Captures the status line and body of a response.
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            message: None,
            status: response.status,
            status_text: response.status_text.clone(),
            body: response.body.clone(),
        }
    }

    /// Attaches a human message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            write!(f, "{}\n\n", message)?;
        }
        write!(f, "{} {}\n{}", self.status, self.status_text, self.body)
    }
}

impl std::error::Error for ApiError {}

/// Project setting that failed post-write verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    BuildCommand,
    BuildOutputDirectory,
    RootDirectory,
    CompatibilityDate,
    CompatibilityFlags,
    Binding(BindingKind),
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftKind::BuildCommand => write!(f, "Build command"),
            DriftKind::BuildOutputDirectory => write!(f, "Build output directory"),
            DriftKind::RootDirectory => write!(f, "Root directory"),
            DriftKind::CompatibilityDate => write!(f, "Compatibility date"),
            DriftKind::CompatibilityFlags => write!(f, "Compatibility flags"),
            DriftKind::Binding(kind) => write!(f, "{}", kind.label()),
        }
    }
}

/// Top-level error type for orchestrator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A hard deadline was exceeded.
    #[error("{operation} did not complete within the timeout of {} ms", .timeout.as_millis())]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },

    /// A remote call returned a non-OK or unparseable response.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// Too many transient failures while polling.
    #[error("number of not-OK API responses ({failures}) exceeded allowed threshold {threshold}: {last}")]
    TransientLimitExceeded {
        failures: u32,
        threshold: u32,
        #[source]
        last: Box<Error>,
    },

    /// The deployment reached a terminal non-success status.
    #[error("deployment {deployment_id} has failed.\n\nStage: {stage}\nStatus: {status}\n\n{dashboard_url}")]
    DeploymentFailed {
        deployment_id: String,
        stage: String,
        status: String,
        dashboard_url: String,
    },

    /// Project configuration did not match after being written.
    #[error("{kind} not set correctly: expected {expected}, found {actual}")]
    ConfigurationDrift {
        kind: DriftKind,
        expected: String,
        actual: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// A fixture's setup command failed.
    #[error("fixture setup failed: {0}")]
    Setup(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The test runner could not be executed.
    #[error("test run failed: {0}")]
    TestRun(String),
}

impl Error {
    /// Returns true for timeouts, which are always fatal to a fixture.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;
