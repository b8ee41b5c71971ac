//! Pages e2e - end-to-end test orchestrator for ephemeral Pages deployments
//!
//! This library deploys fixture projects to a shared Pages project, waits for
//! each deployment to build and go live at the edge, hands the URLs to a test
//! runner and cleans up every remote side effect afterwards.

pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod fixture;
pub mod git;
pub mod http;
pub mod mutex;
pub mod pages;
pub mod pipeline;
pub mod runner;
pub mod teardown;

pub use error::{ApiError, DriftKind, Error, Operation, Result};

pub use clock::{Clock, FakeClock, SystemClock};
pub use completion::{Completion, PollCheck, PollSchedule, Tick};
pub use config::{
    Environment, GitIdentity, Host, Hosts, ProjectCredentials, RunConfig, Trigger, Validate,
    ValidationResult,
};
pub use fixture::FixtureConfig;
pub use git::{BranchPublisher, Publisher};
pub use http::{HttpClient, HttpRequest, HttpResponse, Method, ReqwestClient};
pub use mutex::{Mutex, MutexClient};
pub use pipeline::{DeploymentCoordinator, FixtureFilter, Orchestrator, RunReport};
pub use runner::{CommandTestRunner, DeployedFixture, TestOutcome, TestRunner};
pub use teardown::{TeardownFailure, TeardownReport, TeardownService};
