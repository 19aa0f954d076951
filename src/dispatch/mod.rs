//! Submitting build jobs to the external CI workflow service.

use crate::artifact::{unix_nanos, Artifact};
use crate::config::CiConfig;
use flowrun::{FlowRun, FlowRunRequest, DONE_ON_ANY_OUTCOME};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod flowrun;
pub mod worker;

#[derive(Error, Debug)]
pub enum Error {
    #[error("build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Job descriptor handed to the CI executor as step arguments.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CiInfo {
    pub branch: String,
    pub code_type: String,
    /// Tag or commit to build.
    pub commit_id: String,
    pub git_url: String,
    /// Registry path the image is pushed under.
    pub output: String,
    pub project_path: String,
    pub project_file: String,
    /// Honored by the executor, not by this service.
    pub retry_count: u32,
    pub service_name: String,
}

impl CiInfo {
    pub fn new(artifact: &Artifact, retry_count: u32) -> Self {
        let spec = &artifact.spec;
        Self {
            branch: spec.branch.clone(),
            code_type: spec.language.clone(),
            commit_id: spec.tag.clone(),
            git_url: spec.git_url.clone(),
            output: spec.registry.clone(),
            project_path: spec.project_path.clone(),
            project_file: spec.project_file.clone(),
            retry_count,
            service_name: spec.app_name.clone(),
        }
    }

    /// Generic key/value form used as flow run step arguments.
    pub fn to_args(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(args) => Ok(args),
            _ => Err(<serde_json::Error as serde::ser::Error>::custom("descriptor is not an object")),
        }
    }
}

/// Client of the workflow endpoint. Only reports whether a submission was accepted.
#[derive(Debug, Clone)]
pub struct CiDispatcher {
    http: reqwest::Client,
    config: CiConfig,
    namespace: String,
}

impl CiDispatcher {
    pub fn new(config: CiConfig, namespace: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            http,
            config,
            namespace: namespace.into(),
        })
    }

    pub fn descriptor(&self, artifact: &Artifact) -> CiInfo {
        CiInfo::new(artifact, self.config.retry_count)
    }

    /// Submit a build of `artifact`. True when the workflow endpoint accepted it.
    pub async fn dispatch(&self, artifact: &Artifact) -> bool {
        match self.descriptor(artifact).to_args() {
            Ok(args) => self.submit(artifact.uuid(), args).await,
            Err(err) => {
                error!("dispatch {}: serialize descriptor: {err}", artifact.uuid());
                false
            }
        }
    }

    /// Submit a one step flow run named after `step_name`, the artifact uuid.
    pub async fn submit(&self, step_name: &str, args: Map<String, Value>) -> bool {
        if step_name.is_empty() {
            error!("refusing to dispatch a build without an artifact uuid");
            return false;
        }

        let mut flow_run = FlowRun::new(format!("{}_{}", self.namespace, unix_nanos()));
        flow_run.add_step(
            format!("{}_{step_name}", self.config.action),
            &DONE_ON_ANY_OUTCOME,
            &self.config.action,
            args,
        );
        let data = flow_run.generate();
        debug!("submitting flow run {}:\n{data}", flow_run.name);

        let resp = self
            .http
            .post(&self.config.endpoint)
            .json(&FlowRunRequest { data: &data })
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => {
                info!("flow run {} accepted for {step_name}", flow_run.name);
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                warn!("flow run {} rejected: {status}: {body}", flow_run.name);
                false
            }
            Err(err) => {
                warn!("flow run {} not submitted: {err}", flow_run.name);
                false
            }
        }
    }
}
