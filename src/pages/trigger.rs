//! Deployment trigger: a branch-scoped deploy hook plus its invocation.
//!
//! Creating and firing are separate calls so the project lock only has to
//! be held around the invocation.

use std::sync::Arc;

use crate::error::Result;
use crate::pages::api::PagesClient;
use crate::teardown::TeardownService;

/// Creates deploy hooks and fires them.
#[derive(Clone)]
pub struct DeploymentTrigger {
    api: PagesClient,
    teardown: Arc<TeardownService>,
}

impl DeploymentTrigger {
    pub fn new(api: PagesClient, teardown: Arc<TeardownService>) -> Self {
        Self { api, teardown }
    }

    /// Creates a deploy hook for `branch` and registers its deletion.
    ///
    /// Deletion is registered before the hook is ever invoked, so a hook
    /// that never fires is still cleaned up.
    pub async fn create_hook(&self, branch: &str) -> Result<String> {
        tracing::info!(branch = %branch, "creating deploy hook");
        let hook_id = self.api.create_deploy_hook(branch, branch).await?;
        tracing::info!(hook_id = %hook_id, "created deploy hook");

        let api = self.api.clone();
        let id = hook_id.clone();
        self.teardown.register("Delete Deploy Hook", move || async move {
            tracing::info!(hook_id = %id, "deleting deploy hook");
            api.delete_deploy_hook(&id).await
        });

        Ok(hook_id)
    }

    /// Invokes a deploy hook, returning the new deployment's id.
    pub async fn fire(&self, hook_id: &str) -> Result<String> {
        tracing::info!(hook_id = %hook_id, "creating deployment with deploy hook");
        let deployment_id = self.api.invoke_deploy_hook(hook_id).await?;
        tracing::info!(deployment_id = %deployment_id, "created deployment");
        Ok(deployment_id)
    }
}
