//! Pages control-plane client.
//!
//! Every call is bearer-authenticated except the public deploy hook
//! webhook. Responses are wrapped in a `{result: ...}` envelope; any non-2xx
//! status, unparseable body or missing required field is normalized into an
//! [`ApiError`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Host, ProjectCredentials};
use crate::error::{ApiError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::pages::bindings::ProjectBindingSet;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CreatedHook {
    hook_id: String,
}

#[derive(Debug, Deserialize)]
struct InvokedHook {
    id: String,
}

/// Status of a deployment's latest stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Idle,
    Active,
    Success,
    Failure,
    Canceled,
    Unknown(String),
}

impl StageStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "idle" => StageStatus::Idle,
            "active" => StageStatus::Active,
            "success" => StageStatus::Success,
            "failure" => StageStatus::Failure,
            "canceled" => StageStatus::Canceled,
            other => StageStatus::Unknown(other.to_string()),
        }
    }

    /// Idle, active and success are the only statuses that are not failures.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            StageStatus::Idle | StageStatus::Active | StageStatus::Success
        )
    }
}

/// A deployment's current pipeline phase.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Stage {
    pub name: String,
    pub status: String,
}

impl Stage {
    pub fn status(&self) -> StageStatus {
        StageStatus::parse(&self.status)
    }

    /// True once the final `deploy` stage has succeeded.
    pub fn is_complete(&self) -> bool {
        self.name == "deploy" && self.status() == StageStatus::Success
    }
}

/// Deployment state as read from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub latest_stage: Stage,
}

/// Project build settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub destination_dir: Option<String>,
    #[serde(default)]
    pub root_dir: Option<String>,
}

/// Preview deployment settings. Binding maps stay untyped in `bindings`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PreviewConfig {
    #[serde(default)]
    pub compatibility_date: Option<String>,
    #[serde(default)]
    pub compatibility_flags: Option<Vec<String>>,
    #[serde(flatten)]
    pub bindings: serde_json::Map<String, Value>,
}

impl PreviewConfig {
    pub fn binding_set(&self) -> ProjectBindingSet {
        ProjectBindingSet::from_preview(&self.bindings)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeploymentConfigs {
    #[serde(default)]
    pub preview: PreviewConfig,
}

/// The subset of a Pages project this tool reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub build_config: BuildConfig,
    #[serde(default)]
    pub deployment_configs: DeploymentConfigs,
}

/// Client for one Pages project.
#[derive(Clone)]
pub struct PagesClient {
    http: Arc<dyn HttpClient>,
    host: Host,
    project: ProjectCredentials,
}

impl PagesClient {
    pub fn new(http: Arc<dyn HttpClient>, host: Host, project: ProjectCredentials) -> Self {
        Self {
            http,
            host,
            project,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn credentials(&self) -> &ProjectCredentials {
        &self.project
    }

    fn project_url(&self) -> String {
        format!(
            "{}/client/v4/accounts/{}/pages/projects/{}",
            self.host.api, self.project.account_id, self.project.project_name
        )
    }

    /// Dashboard link for a deployment.
    pub fn dashboard_url(&self, deployment_id: &str) -> String {
        format!(
            "{}/{}/pages/view/{}/{}",
            self.host.dash, self.project.account_id, self.project.project_name, deployment_id
        )
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.http.send(request.bearer(&self.project.api_token)).await
    }

    /// Creates a deploy hook targeting `branch`, returning its id.
    pub async fn create_deploy_hook(&self, name: &str, branch: &str) -> Result<String> {
        let request = HttpRequest::post(format!("{}/deploy_hooks", self.project_url()))
            .json(&serde_json::json!({ "name": name, "branch": branch }))?;
        let response = self.send(request).await?;

        let created: CreatedHook = parse_result(&response, Some("Could not create Deploy Hook."))?;
        if created.hook_id.is_empty() {
            return Err(invalid(&response, Some("Could not create Deploy Hook.")).into());
        }
        Ok(created.hook_id)
    }

    pub async fn delete_deploy_hook(&self, hook_id: &str) -> Result<()> {
        let request = HttpRequest::delete(format!("{}/deploy_hooks/{}", self.project_url(), hook_id));
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(invalid(&response, Some("Could not delete Deploy Hook.")).into());
        }
        Ok(())
    }

    /// Invokes a deploy hook, returning the id of the deployment it started.
    ///
    /// The webhook endpoint is public and takes no credentials.
    pub async fn invoke_deploy_hook(&self, hook_id: &str) -> Result<String> {
        let request = HttpRequest::post(format!(
            "{}/client/v4/pages/webhooks/deploy_hooks/{}",
            self.host.api, hook_id
        ));
        let response = self.http.send(request).await?;

        let invoked: InvokedHook = parse_result(&response, Some("Could not create Deployment."))?;
        if invoked.id.is_empty() {
            return Err(invalid(&response, Some("Could not create Deployment.")).into());
        }
        Ok(invoked.id)
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        let request = HttpRequest::get(format!("{}/deployments/{}", self.project_url(), deployment_id));
        let response = self.send(request).await?;

        let mut deployment: Deployment = parse_result(&response, None)?;
        if deployment.url.is_empty() || deployment.latest_stage.status.is_empty() {
            return Err(invalid(&response, None).into());
        }
        if deployment.id.is_empty() {
            deployment.id = deployment_id.to_string();
        }
        Ok(deployment)
    }

    pub async fn get_project(&self) -> Result<Project> {
        let response = self.send(HttpRequest::get(self.project_url())).await?;
        parse_result(&response, None)
    }

    /// Applies a partial update and returns the project as stored.
    pub async fn patch_project(&self, payload: &Value) -> Result<Project> {
        let request = HttpRequest::patch(self.project_url()).json(payload)?;
        let response = self.send(request).await?;
        parse_result(&response, Some("Could not update project."))
    }
}

fn invalid(response: &HttpResponse, message: Option<&str>) -> ApiError {
    let error = ApiError::from_response(response);
    match message {
        Some(message) => error.with_message(message),
        None => error,
    }
}

fn parse_result<T: DeserializeOwned>(response: &HttpResponse, message: Option<&str>) -> Result<T> {
    if !response.is_success() {
        return Err(invalid(response, message).into());
    }
    let envelope: Envelope<T> = response.json().map_err(|_| invalid(response, message))?;
    Ok(envelope.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::http::testing::ScriptedClient;
    use crate::http::Method;

    fn credentials() -> ProjectCredentials {
        ProjectCredentials {
            account_id: "acc".to_string(),
            project_name: "proj".to_string(),
            git_repo: Some("git@github.com:example/proj.git".to_string()),
            api_token: "tok".to_string(),
        }
    }

    fn host() -> Host {
        Host {
            api: "https://api.test".to_string(),
            dash: "https://dash.test".to_string(),
        }
    }

    fn client(http: Arc<ScriptedClient>) -> PagesClient {
        PagesClient::new(http, host(), credentials())
    }

    #[tokio::test]
    async fn create_deploy_hook_posts_name_and_branch() {
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Post,
            "/pages/projects/proj/deploy_hooks",
            HttpResponse::new(200, r#"{"result":{"hook_id":"hook-1"}}"#),
        );

        let id = client(http.clone())
            .create_deploy_hook("basic-1", "basic-1")
            .await
            .unwrap();

        assert_eq!(id, "hook-1");
        let request = &http.requests()[0];
        assert_eq!(
            request.url,
            "https://api.test/client/v4/accounts/acc/pages/projects/proj/deploy_hooks"
        );
        assert_eq!(request.header_value("authorization"), Some("Bearer tok"));
        assert_eq!(
            request.body.as_deref(),
            Some(r#"{"branch":"basic-1","name":"basic-1"}"#)
        );
    }

    #[tokio::test]
    async fn create_deploy_hook_missing_field_is_descriptive() {
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Post,
            "/deploy_hooks",
            HttpResponse::new(200, r#"{"result":{}}"#),
        );

        let err = client(http).create_deploy_hook("a", "a").await.unwrap_err();
        match err {
            Error::Api(api) => {
                assert_eq!(api.message.as_deref(), Some("Could not create Deploy Hook."));
                assert_eq!(api.status, 200);
                assert_eq!(api.body, r#"{"result":{}}"#);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn invoke_deploy_hook_uses_public_webhook() {
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Post,
            "/pages/webhooks/deploy_hooks/hook-1",
            HttpResponse::new(200, r#"{"result":{"id":"dep-1"}}"#),
        );

        let id = client(http.clone()).invoke_deploy_hook("hook-1").await.unwrap();

        assert_eq!(id, "dep-1");
        assert_eq!(http.requests()[0].header_value("authorization"), None);
    }

    #[tokio::test]
    async fn invoke_deploy_hook_error_status_is_wrapped() {
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Post,
            "/webhooks/deploy_hooks/hook-1",
            HttpResponse::new(404, "not found"),
        );

        let err = client(http).invoke_deploy_hook("hook-1").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not create Deployment.\n\n404 Not Found\nnot found"
        );
    }

    #[tokio::test]
    async fn get_deployment_reads_latest_stage() {
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Get,
            "/deployments/dep-1",
            HttpResponse::new(
                200,
                r#"{"result":{"url":"https://abc.proj.pages.dev","latest_stage":{"name":"build","status":"active"}}}"#,
            ),
        );

        let deployment = client(http).get_deployment("dep-1").await.unwrap();
        assert_eq!(deployment.id, "dep-1");
        assert_eq!(deployment.url, "https://abc.proj.pages.dev");
        assert_eq!(deployment.latest_stage.status(), StageStatus::Active);
        assert!(!deployment.latest_stage.is_complete());
    }

    #[tokio::test]
    async fn get_deployment_without_url_is_an_error() {
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Get,
            "/deployments/dep-1",
            HttpResponse::new(
                200,
                r#"{"result":{"url":"","latest_stage":{"name":"build","status":"active"}}}"#,
            ),
        );

        assert!(matches!(
            client(http).get_deployment("dep-1").await,
            Err(Error::Api(_))
        ));
    }

    #[tokio::test]
    async fn get_project_reads_bindings() {
        let http = Arc::new(ScriptedClient::new());
        http.push(
            Method::Get,
            "/pages/projects/proj",
            HttpResponse::new(
                200,
                r#"{"result":{"name":"proj","build_config":{"build_command":"npm run build","destination_dir":"dist","root_dir":null},"deployment_configs":{"preview":{"compatibility_date":"2023-03-26","compatibility_flags":[],"kv_namespaces":{"KV":{"namespace_id":"abc"}}}}}}"#,
            ),
        );

        let project = client(http).get_project().await.unwrap();
        assert_eq!(project.build_config.build_command.as_deref(), Some("npm run build"));
        assert_eq!(project.build_config.root_dir, None);
        let bindings = project.deployment_configs.preview.binding_set();
        assert_eq!(
            bindings.get(crate::pages::bindings::BindingKind::KvNamespaces).len(),
            1
        );
    }

    #[test]
    fn stage_statuses_outside_known_progress_are_failures() {
        assert!(!StageStatus::parse("idle").is_failure());
        assert!(!StageStatus::parse("active").is_failure());
        assert!(!StageStatus::parse("success").is_failure());
        assert!(StageStatus::parse("failure").is_failure());
        assert!(StageStatus::parse("canceled").is_failure());
        assert!(StageStatus::parse("skipped").is_failure());
    }

    #[test]
    fn dashboard_url_points_at_deployment() {
        let client = client(Arc::new(ScriptedClient::new()));
        assert_eq!(
            client.dashboard_url("dep-1"),
            "https://dash.test/acc/pages/view/proj/dep-1"
        );
    }
}
