use crate::artifact::{unix_nanos, Artifact, ArtifactSpec, ArtifactStatus, BuildOutcome, Metadata, RequestArtifact};
use crate::config::Config;
use crate::dispatch::worker::{self, DispatchQueue, DispatchWorker};
use crate::dispatch::CiDispatcher;
use crate::image::name::ImageLocation;
use crate::image::{contains_ideographic, tag};
use crate::registry::RegistryProvisioner;
use crate::git::GitBranchEnumerator;
use crate::store::{by_app_name, ArtifactWatch, Artifacts, DocumentStore};
use crate::version::VersionGenerator;
use crate::{dispatch, git, registry, store};
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("branch and tag must not contain ideographic characters")]
    Ideographic,

    #[error("registry: {0}")]
    Registry(#[from] registry::Error),

    #[error("dispatch: {0}")]
    Dispatch(#[from] dispatch::Error),

    #[error("store: {0}")]
    Store(#[from] store::Error),

    #[error("git: {0}")]
    Git(#[from] git::Error),

    #[error("artifact {uuid} is {from} and cannot become {to}")]
    Transition {
        uuid: String,
        from: ArtifactStatus,
        to: ArtifactStatus,
    },
}

/// Artifact lifecycle: validate, resolve, provision, persist, dispatch.
///
/// Holds no artifact state of its own, every read goes to the store.
pub struct ArtifactService {
    artifacts: Artifacts,
    versions: VersionGenerator,
    registry: RegistryProvisioner,
    git: GitBranchEnumerator,
    queue: DispatchQueue,
}

impl ArtifactService {
    pub fn new(artifacts: Artifacts, registry: RegistryProvisioner, git: GitBranchEnumerator, queue: DispatchQueue) -> Self {
        Self {
            versions: VersionGenerator::new(artifacts.clone()),
            artifacts,
            registry,
            git,
            queue,
        }
    }

    /// Wire every component from configuration and start the dispatch worker.
    /// Drop the service, then join the worker, to wait for pending dispatches.
    pub fn start(config: &Config, store: Arc<dyn DocumentStore>) -> Result<(Self, DispatchWorker), Error> {
        let artifacts = Artifacts::new(store, config.namespace.clone());
        let registry = RegistryProvisioner::new(config.registry.clone())?;
        let dispatcher = CiDispatcher::new(config.ci.clone(), config.namespace.clone())?;
        let git = GitBranchEnumerator::new(config.git.clone());
        let (queue, worker) = worker::spawn(dispatcher, artifacts.clone(), config.dispatch.clone());
        Ok((Self::new(artifacts, registry, git, queue), worker))
    }

    /// Create an artifact for a build request and queue its CI dispatch.
    ///
    /// The returned artifact is still `Initialized`; the dispatch outcome only
    /// shows up in the store later. Nothing is stored when the registry project
    /// cannot be provisioned.
    pub async fn create(&self, request: RequestArtifact) -> Result<Artifact, Error> {
        let requested_tag = request.tag.filter(|tag| !tag.is_empty());
        validate(&request.branch, requested_tag.as_deref().unwrap_or_default())?;

        let location = ImageLocation::resolve(&request.git_url, &request.registry);
        let mut artifact = Artifact {
            metadata: Metadata::named(format!("{}-{}", request.app_name, unix_nanos())),
            spec: ArtifactSpec {
                git_url: request.git_url,
                app_name: request.app_name,
                branch: request.branch,
                tag: requested_tag.unwrap_or_else(tag::generate),
                remarks: request.remarks,
                language: request.language,
                registry: location.registry,
                images: location.image,
                project_file: request.project_file,
                project_path: request.project_path,
                artifact_status: ArtifactStatus::Initialized,
            },
        };

        let provisioned = self.registry.ensure_registry_path(&artifact.spec.registry).await?;
        debug!("registry path {}: {provisioned:?}", artifact.spec.registry);

        artifact.metadata.generate_version();
        let artifact = self.artifacts.create(&artifact).await?;
        info!("created artifact {} ({})", artifact.metadata.name, artifact.uuid());

        if !self.queue.enqueue(artifact.uuid()) {
            warn!("dispatch worker is gone, artifact {} will stay {}", artifact.uuid(), artifact.status());
        }
        Ok(artifact)
    }

    /// Page `page` (1-based) of artifacts whose application name contains `name`,
    /// newest first, together with the total number of matches.
    /// A `page_size` of 0 returns every match.
    pub async fn list(&self, name: &str, page: u64, page_size: u64) -> Result<(Vec<Artifact>, u64), Error> {
        let filter = by_app_name(name);
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        let artifacts = self.artifacts.list(&filter, offset, page_size).await?;
        let count = self.artifacts.count(&filter).await?;
        Ok((artifacts, count))
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Artifact, Error> {
        Ok(self.artifacts.get(uuid).await?)
    }

    /// Replace the request fields of an existing artifact. Identity and status are kept.
    pub async fn update(&self, uuid: &str, request: RequestArtifact) -> Result<Artifact, Error> {
        let requested_tag = request.tag.filter(|tag| !tag.is_empty());
        validate(&request.branch, requested_tag.as_deref().unwrap_or_default())?;

        let mut artifact = self.artifacts.get(uuid).await?;
        let location = ImageLocation::resolve(&request.git_url, &request.registry);
        if location.registry != artifact.spec.registry {
            self.registry.ensure_registry_path(&location.registry).await?;
        }

        let spec = &mut artifact.spec;
        spec.git_url = request.git_url;
        spec.app_name = request.app_name;
        spec.branch = request.branch;
        if let Some(tag) = requested_tag {
            spec.tag = tag;
        }
        spec.remarks = request.remarks;
        spec.language = request.language;
        spec.registry = location.registry;
        spec.images = location.image;
        spec.project_file = request.project_file;
        spec.project_path = request.project_path;

        artifact.metadata.generate_version();
        Ok(self.artifacts.apply(&artifact).await?)
    }

    /// Deleting an unknown artifact succeeds.
    pub async fn delete(&self, uuid: &str) -> Result<(), Error> {
        Ok(self.artifacts.delete(uuid).await?)
    }

    /// Record the final build result reported by the CI service.
    pub async fn record_outcome(&self, uuid: &str, outcome: BuildOutcome) -> Result<Artifact, Error> {
        let mut artifact = self.artifacts.get(uuid).await?;
        let next = ArtifactStatus::from(outcome);
        if !artifact.status().can_transition_to(next) {
            return Err(Error::Transition {
                uuid: uuid.to_string(),
                from: artifact.status(),
                to: next,
            });
        }
        artifact.spec.artifact_status = next;
        artifact.metadata.generate_version();
        let artifact = self.artifacts.apply(&artifact).await?;
        info!("artifact {uuid} finished: {next}");
        Ok(artifact)
    }

    /// Remote branch names of a repository, e.g. `git.example.com/team/app.git`.
    pub async fn branches(&self, git_path: &str) -> Result<Vec<String>, Error> {
        Ok(self.git.list_branches(git_path).await?)
    }

    /// Highest sequence number among the stored builds of an application.
    pub async fn app_number(&self, app_name: &str) -> u64 {
        self.versions.highest_sequence(app_name).await
    }

    /// Artifacts written from now on with a version newer than `version`.
    pub fn watch(&self, version: u64) -> ArtifactWatch {
        self.artifacts.watch(version)
    }
}

fn validate(branch: &str, tag: &str) -> Result<(), Error> {
    if contains_ideographic(branch) || contains_ideographic(tag) {
        return Err(Error::Ideographic);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    /// Registry and CI endpoints point at a closed port: any network call fails.
    fn offline_service() -> (ArtifactService, Arc<MemoryStore>) {
        let mut config = Config::default();
        config.registry.scheme = "http".into();
        config.registry.timeout_secs = 2;
        config.ci.endpoint = "http://127.0.0.1:1/flowrun".into();
        config.ci.timeout_secs = 2;
        config.dispatch.max_attempts = 1;

        let memory = Arc::new(MemoryStore::new());
        let (service, _worker) = ArtifactService::start(&config, memory.clone()).unwrap();
        (service, memory)
    }

    fn request(branch: &str, tag: Option<&str>) -> RequestArtifact {
        RequestArtifact {
            git_url: "https://github.com/acme/payments.git".into(),
            registry: "127.0.0.1:1".into(),
            app_name: "payments".into(),
            branch: branch.into(),
            tag: tag.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ideographic_branch_or_tag_is_rejected_before_any_io() {
        let (service, memory) = offline_service();

        let err = service.create(request("发布", None)).await.unwrap_err();
        assert!(matches!(err, Error::Ideographic));
        let err = service.create(request("main", Some("版本1"))).await.unwrap_err();
        assert!(matches!(err, Error::Ideographic));

        assert_eq!(memory.count("devops", "artifact", &store::Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn provisioning_failure_persists_nothing() {
        let (service, memory) = offline_service();

        let err = service.create(request("main", None)).await.unwrap_err();
        assert!(matches!(err, Error::Registry(registry::Error::Request(_))));
        assert_eq!(memory.count("devops", "artifact", &store::Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outcome_requires_building() {
        let (service, _) = offline_service();
        let artifacts = service.artifacts.clone();

        let mut artifact = Artifact {
            metadata: Metadata::named("payments-1"),
            spec: ArtifactSpec {
                app_name: "payments".into(),
                ..Default::default()
            },
        };
        artifact.metadata.generate_version();
        let stored = artifacts.create(&artifact).await.unwrap();

        let err = service.record_outcome(stored.uuid(), BuildOutcome::Succeeded).await.unwrap_err();
        assert!(matches!(err, Error::Transition { from: ArtifactStatus::Initialized, .. }));

        let mut building = stored.clone();
        building.spec.artifact_status = ArtifactStatus::Building;
        building.metadata.generate_version();
        artifacts.apply(&building).await.unwrap();

        let finished = service.record_outcome(stored.uuid(), BuildOutcome::Failed).await.unwrap();
        assert_eq!(finished.status(), ArtifactStatus::Failed);
        assert!(finished.metadata.version > building.metadata.version);
    }

    #[tokio::test]
    async fn list_pages_and_delete() {
        let (service, _) = offline_service();
        for (index, app_name) in ["payments", "billing", "payments-worker", "PAYMENTS-ui"].iter().enumerate() {
            let mut artifact = Artifact {
                metadata: Metadata::named(format!("{app_name}-{index}")),
                spec: ArtifactSpec {
                    app_name: app_name.to_string(),
                    ..Default::default()
                },
            };
            artifact.metadata.generate_version();
            service.artifacts.create(&artifact).await.unwrap();
        }

        let (page, count) = service.list("payments", 1, 2).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].spec.app_name, "PAYMENTS-ui");

        let (page, _) = service.list("payments", 2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].spec.app_name, "payments");

        let (all, count) = service.list("", 1, 0).await.unwrap();
        assert_eq!((all.len(), count), (4, 4));

        let uuid = all[0].uuid().to_string();
        service.delete(&uuid).await.unwrap();
        service.delete(&uuid).await.unwrap();
        assert!(matches!(
            service.get_by_uuid(&uuid).await,
            Err(Error::Store(store::Error::NotFound { .. }))
        ));
        assert_eq!(service.app_number("payments").await, 2);
    }

    #[tokio::test]
    async fn list_far_past_the_end_is_empty() {
        let (service, _) = offline_service();
        let mut artifact = Artifact {
            metadata: Metadata::named("payments-1"),
            spec: ArtifactSpec {
                app_name: "payments".into(),
                ..Default::default()
            },
        };
        artifact.metadata.generate_version();
        service.artifacts.create(&artifact).await.unwrap();

        let (page, count) = service.list("", u64::MAX, 2).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn update_rejects_ideographic_branch_or_tag() {
        let (service, _) = offline_service();
        let mut artifact = Artifact {
            metadata: Metadata::named("payments-1"),
            spec: ArtifactSpec {
                app_name: "payments".into(),
                branch: "main".into(),
                ..Default::default()
            },
        };
        artifact.metadata.generate_version();
        let stored = service.artifacts.create(&artifact).await.unwrap();

        let err = service.update(stored.uuid(), request("发布", None)).await.unwrap_err();
        assert!(matches!(err, Error::Ideographic));
        let err = service.update(stored.uuid(), request("main", Some("版本1"))).await.unwrap_err();
        assert!(matches!(err, Error::Ideographic));

        assert_eq!(service.get_by_uuid(stored.uuid()).await.unwrap(), stored);
    }
}
