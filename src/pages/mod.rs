//! Pages control-plane integration: deploy hooks, deployment and
//! provisioning polling, and project configuration.

pub mod api;
pub mod bindings;
pub mod configurator;
pub mod poller;
pub mod provision;
pub mod trigger;

pub use api::{Deployment, PagesClient, Project, Stage, StageStatus};
pub use bindings::{BindingDiff, BindingKind, ProjectBindingSet};
pub use configurator::{DesiredProjectConfig, ProjectConfigurator};
pub use poller::DeploymentPoller;
pub use provision::ProvisioningPoller;
pub use trigger::DeploymentTrigger;
