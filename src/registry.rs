use crate::config::RegistryConfig;
use crate::image::name::registry_project;
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("registry request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registry path {0:?} does not name a project")]
    MissingProject(String),

    #[error("failed to create registry project {project} on {host}: status {status}")]
    CreateProject {
        host: String,
        project: String,
        status: u16,
    },
}

/// What [`RegistryProvisioner::ensure_project`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Existing,
    Created,
}

#[derive(Serialize)]
struct CreateProjectRequest<'a> {
    project_name: &'a str,
    metadata: ProjectMetadata<'a>,
}

#[derive(Serialize)]
struct ProjectMetadata<'a> {
    public: &'a str,
}

/// Makes sure a project (namespace) exists in a Harbor compatible registry
/// before anything is pushed under it.
#[derive(Debug, Clone)]
pub struct RegistryProvisioner {
    http: reqwest::Client,
    config: RegistryConfig,
}

impl RegistryProvisioner {
    pub fn new(config: RegistryConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(Error::Client)?;
        Ok(Self { http, config })
    }

    fn projects_url(&self, host: &str) -> String {
        format!("{}://{}{}/projects", self.config.scheme, host, self.config.api_path)
    }

    /// Ensure the project of a `host/project` registry path exists.
    pub async fn ensure_registry_path(&self, registry: &str) -> Result<Provisioned, Error> {
        let (host, project) = registry_project(registry);
        if host.is_empty() || project.is_empty() {
            return Err(Error::MissingProject(registry.to_string()));
        }
        self.ensure_project(host, project).await
    }

    /// Probe for the project and create it when the probe does not find it.
    /// Calling this again for the same project never creates it twice.
    pub async fn ensure_project(&self, host: &str, project: &str) -> Result<Provisioned, Error> {
        if project.is_empty() {
            return Err(Error::MissingProject(format!("{host}/")));
        }
        if self.project_exists(host, project).await? {
            debug!("registry project {project} already exists on {host}");
            return Ok(Provisioned::Existing);
        }
        self.create_project(host, project).await?;
        Ok(Provisioned::Created)
    }

    pub async fn project_exists(&self, host: &str, project: &str) -> Result<bool, Error> {
        let resp = self
            .http
            .head(self.projects_url(host))
            .query(&[("project_name", project)])
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        debug!("probe registry project {project} on {host}: {}", resp.status());
        Ok(resp.status() == StatusCode::OK)
    }

    pub async fn create_project(&self, host: &str, project: &str) -> Result<(), Error> {
        let request = CreateProjectRequest {
            project_name: project,
            metadata: ProjectMetadata { public: "true" },
        };
        let resp = self
            .http
            .post(self.projects_url(host))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::CREATED {
            info!("created registry project {project} on {host}");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        warn!("create registry project {project} on {host}: {status}: {body}");
        Err(Error::CreateProject {
            host: host.to_string(),
            project: project.to_string(),
            status: status.as_u16(),
        })
    }
}
