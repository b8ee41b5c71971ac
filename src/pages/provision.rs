//! Edge provisioning poller.
//!
//! A deployment that succeeded on the control plane may still be served
//! the platform placeholder page at the edge. Polling stops as soon as the
//! URL serves anything else, including unrelated error pages and failed
//! fetches.

use std::sync::Arc;

use async_trait::async_trait;

use crate::completion::{self, PollCheck, Tick};
use crate::config::ProvisioningTimings;
use crate::error::Result;
use crate::http::{HttpClient, HttpRequest};

const PLACEHOLDER_MARKERS: [&str; 2] = ["Nothing is here yet", "Cloudflare Pages"];

/// True if `body` is the "not yet provisioned" placeholder page.
pub fn is_placeholder(body: &str) -> bool {
    PLACEHOLDER_MARKERS.iter().all(|marker| body.contains(marker))
}

/// Waits for a deployment URL to be live at the edge.
#[derive(Clone)]
pub struct ProvisioningPoller {
    http: Arc<dyn HttpClient>,
    timings: ProvisioningTimings,
}

impl ProvisioningPoller {
    pub fn new(http: Arc<dyn HttpClient>, timings: ProvisioningTimings) -> Self {
        Self { http, timings }
    }

    pub async fn await_provisioned(&self, url: &str) -> Result<()> {
        tracing::info!(url = %url, "awaiting deployment to be live at the edge");
        let mut check = ProvisionCheck {
            http: self.http.as_ref(),
            url,
        };
        completion::poll(&mut check, self.timings.schedule()).await?;
        tracing::info!(url = %url, "deployment available");
        Ok(())
    }
}

struct ProvisionCheck<'a> {
    http: &'a dyn HttpClient,
    url: &'a str,
}

#[async_trait]
impl PollCheck for ProvisionCheck<'_> {
    type Output = ();

    async fn check(&mut self) -> Result<Tick<()>> {
        match self.http.send(HttpRequest::get(self.url)).await {
            Ok(response) if is_placeholder(&response.body) => {
                tracing::debug!(url = %self.url, "deployment is not yet available at the edge");
                Ok(Tick::Continue)
            }
            Ok(_) => Ok(Tick::Done(())),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "could not check the deployment URL");
                Ok(Tick::Done(()))
            }
        }
    }
}
