//! Deployment poller.
//!
//! Polls the deployment endpoint until the `deploy` stage succeeds or a
//! stage reports a failure status. Failed fetches are tolerated up to a
//! threshold; the failure count is cumulative over the whole poll and is
//! never reset by a clean response.

use async_trait::async_trait;

use crate::completion::{self, PollCheck, Tick};
use crate::config::DeploymentTimings;
use crate::error::{Error, Result};
use crate::pages::api::PagesClient;

/// Waits for deployments to reach a terminal stage.
#[derive(Clone)]
pub struct DeploymentPoller {
    api: PagesClient,
    timings: DeploymentTimings,
}

impl DeploymentPoller {
    pub fn new(api: PagesClient, timings: DeploymentTimings) -> Self {
        Self { api, timings }
    }

    /// Resolves with the deployment URL once the deployment succeeds.
    pub async fn await_completion(&self, deployment_id: &str) -> Result<String> {
        tracing::info!(deployment_id = %deployment_id, "awaiting deployment completion");
        let mut check = DeploymentCheck {
            api: &self.api,
            deployment_id,
            failures: 0,
            threshold: self.timings.api_failure_threshold,
        };
        let url = completion::poll(&mut check, self.timings.schedule()).await?;
        tracing::info!(deployment_id = %deployment_id, url = %url, "deployment complete");
        Ok(url)
    }
}

struct DeploymentCheck<'a> {
    api: &'a PagesClient,
    deployment_id: &'a str,
    failures: u32,
    threshold: u32,
}

#[async_trait]
impl PollCheck for DeploymentCheck<'_> {
    type Output = String;

    async fn check(&mut self) -> Result<Tick<String>> {
        let deployment = match self.api.get_deployment(self.deployment_id).await {
            Ok(deployment) => deployment,
            Err(e) => {
                self.failures += 1;
                if self.failures > self.threshold {
                    tracing::error!(
                        threshold = self.threshold,
                        "number of not-OK deployment API responses exceeded allowed threshold"
                    );
                    return Err(Error::TransientLimitExceeded {
                        failures: self.failures,
                        threshold: self.threshold,
                        last: Box::new(e),
                    });
                }
                tracing::debug!(
                    failures = self.failures,
                    threshold = self.threshold,
                    error = %e,
                    "suppressing not-OK deployment API response"
                );
                return Ok(Tick::Continue);
            }
        };

        let stage = &deployment.latest_stage;
        if stage.is_complete() {
            return Ok(Tick::Done(deployment.url));
        }
        if stage.status().is_failure() {
            return Err(Error::DeploymentFailed {
                deployment_id: self.deployment_id.to_string(),
                stage: stage.name.clone(),
                status: stage.status.clone(),
                dashboard_url: self.api.dashboard_url(self.deployment_id),
            });
        }

        tracing::debug!(stage = %stage.name, status = %stage.status, "deployment is ongoing");
        Ok(Tick::Continue)
    }
}
