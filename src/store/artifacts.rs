use super::{DocumentStore, Error, Filter, Sort, Watch};
use crate::artifact::{Artifact, ArtifactStatus};
use log::warn;
use std::sync::Arc;

const COLLECTION: &str = "artifact";

/// Artifacts stored in a namespace of a document store.
#[derive(Clone)]
pub struct Artifacts {
    store: Arc<dyn DocumentStore>,
    namespace: String,
}

/// Case-insensitive substring match on the application name. Empty matches everything.
pub fn by_app_name(name: &str) -> Filter {
    if name.is_empty() {
        Filter::All
    } else {
        Filter::contains("/spec/app_name", name)
    }
}

impl Artifacts {
    pub fn new(store: Arc<dyn DocumentStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub async fn create(&self, artifact: &Artifact) -> Result<Artifact, Error> {
        let document = self
            .store
            .create(&self.namespace, COLLECTION, serde_json::to_value(artifact)?)
            .await?;
        Ok(serde_json::from_value(document)?)
    }

    /// Replace the stored artifact with this one, keyed by its uuid.
    pub async fn apply(&self, artifact: &Artifact) -> Result<Artifact, Error> {
        let (document, _) = self
            .store
            .apply(
                &self.namespace,
                COLLECTION,
                artifact.uuid(),
                serde_json::to_value(artifact)?,
                false,
            )
            .await?;
        Ok(serde_json::from_value(document)?)
    }

    /// Move the currently stored artifact to `status` and bump its version. Every other
    /// field is written back as stored. `None` when the artifact is gone or its current
    /// status does not allow the move.
    pub async fn transition(&self, uuid: &str, status: ArtifactStatus) -> Result<Option<Artifact>, Error> {
        let mut artifact = match self.get(uuid).await {
            Ok(artifact) => artifact,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !artifact.status().can_transition_to(status) {
            return Ok(None);
        }
        artifact.spec.artifact_status = status;
        artifact.metadata.generate_version();
        self.apply(&artifact).await.map(Some)
    }

    pub async fn get(&self, uuid: &str) -> Result<Artifact, Error> {
        let document = self.store.get_by_uuid(&self.namespace, COLLECTION, uuid).await?;
        Ok(serde_json::from_value(document)?)
    }

    /// Newest version first.
    pub async fn list(&self, filter: &Filter, offset: u64, limit: u64) -> Result<Vec<Artifact>, Error> {
        self.store
            .list(&self.namespace, COLLECTION, filter, Sort::VersionDesc, offset, limit)
            .await?
            .into_iter()
            .map(|document| serde_json::from_value(document).map_err(Error::from))
            .collect()
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64, Error> {
        self.store.count(&self.namespace, COLLECTION, filter).await
    }

    pub async fn delete(&self, uuid: &str) -> Result<(), Error> {
        self.store.delete(&self.namespace, COLLECTION, uuid).await
    }

    pub fn watch(&self, version: u64) -> ArtifactWatch {
        ArtifactWatch {
            inner: self.store.watch(&self.namespace, COLLECTION, version),
        }
    }
}

pub struct ArtifactWatch {
    inner: Watch,
}

impl ArtifactWatch {
    pub async fn next(&mut self) -> Option<Artifact> {
        while let Some(document) = self.inner.next().await {
            match serde_json::from_value(document) {
                Ok(artifact) => return Some(artifact),
                Err(err) => warn!("watch: ignoring malformed artifact: {err}"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactSpec, Metadata};
    use crate::store::MemoryStore;

    fn artifact(app_name: &str) -> Artifact {
        let mut metadata = Metadata::named(format!("{app_name}-1"));
        metadata.generate_version();
        Artifact {
            metadata,
            spec: ArtifactSpec {
                app_name: app_name.into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn typed_round_trip_through_store() {
        let artifacts = Artifacts::new(Arc::new(MemoryStore::new()), "devops");
        let created = artifacts.create(&artifact("payments")).await.unwrap();
        assert!(!created.uuid().is_empty());
        assert!(created.metadata.created_at.is_some());

        let mut changed = created.clone();
        changed.spec.remarks = "rebuilt".into();
        changed.metadata.generate_version();
        artifacts.apply(&changed).await.unwrap();

        let fetched = artifacts.get(created.uuid()).await.unwrap();
        assert_eq!(fetched.spec.remarks, "rebuilt");
        assert!(fetched.metadata.version > created.metadata.version);
        assert_eq!(fetched.metadata.created_at, created.metadata.created_at);
    }

    #[tokio::test]
    async fn transition_keeps_current_fields() {
        let artifacts = Artifacts::new(Arc::new(MemoryStore::new()), "devops");
        let created = artifacts.create(&artifact("payments")).await.unwrap();

        let mut edited = created.clone();
        edited.spec.remarks = "edited".into();
        edited.metadata.generate_version();
        artifacts.apply(&edited).await.unwrap();

        let moved = artifacts
            .transition(created.uuid(), ArtifactStatus::Building)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.status(), ArtifactStatus::Building);
        assert_eq!(moved.spec.remarks, "edited");
        assert!(moved.metadata.version > edited.metadata.version);

        // Building cannot go back to InitializeFail
        assert!(artifacts
            .transition(created.uuid(), ArtifactStatus::InitializeFail)
            .await
            .unwrap()
            .is_none());

        artifacts.delete(created.uuid()).await.unwrap();
        assert!(artifacts
            .transition(created.uuid(), ArtifactStatus::Succeeded)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(artifacts.get(created.uuid()).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_by_app_name() {
        let artifacts = Artifacts::new(Arc::new(MemoryStore::new()), "devops");
        for name in ["payments", "billing", "payments-worker"] {
            artifacts.create(&artifact(name)).await.unwrap();
        }
        let listed = artifacts.list(&by_app_name("Payments"), 0, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].metadata.version > listed[1].metadata.version);
        assert_eq!(artifacts.count(&by_app_name("")).await.unwrap(), 3);
    }
}
