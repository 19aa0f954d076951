use super::{event_channel, prepare_apply, prepare_create, select, Document, DocumentStore, Error, Filter, Sort, StoreEvent};
use async_trait::async_trait;
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, Mutex};

/// Store keeping one JSON file per document under `{root}/{namespace}/{collection}/{uuid}.json`.
///
/// Writes from this process are serialized; watchers only see writes made through this instance.
pub struct FileStore {
    root: PathBuf,
    writes: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!("file store opened at {}", root.display());
        Ok(Self {
            root,
            writes: Mutex::new(()),
            events: event_channel(),
        })
    }

    fn collection_dir(&self, namespace: &str, collection: &str) -> Result<PathBuf, Error> {
        Ok(self.root.join(safe_segment(namespace)?).join(safe_segment(collection)?))
    }

    fn document_path(&self, namespace: &str, collection: &str, uuid: &str) -> Result<PathBuf, Error> {
        Ok(self
            .collection_dir(namespace, collection)?
            .join(format!("{}.json", safe_segment(uuid)?)))
    }

    async fn write(&self, path: &Path, document: &Document) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(document)?).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    async fn read_all(&self, namespace: &str, collection: &str) -> Result<Vec<Document>, Error> {
        let dir = self.collection_dir(namespace, collection)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };

        let mut documents = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_document(&path).await {
                Ok(Some(document)) => documents.push(document),
                Ok(None) => {}
                // one unreadable file must not hide the rest of the collection
                Err(err) => warn!("skipping {}: {err}", path.display()),
            }
        }
        Ok(documents)
    }

    fn publish(&self, namespace: &str, collection: &str, document: &Document) {
        let _ = self.events.send(StoreEvent {
            namespace: namespace.to_string(),
            collection: collection.to_string(),
            document: document.clone(),
        });
    }
}

/// Reject names that would escape the store directory.
fn safe_segment(segment: &str) -> Result<&str, Error> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && segment != "."
        && segment != "..";
    if valid {
        Ok(segment)
    } else {
        Err(Error::InvalidUuid(segment.to_string()))
    }
}

async fn read_document(path: &Path) -> Result<Option<Document>, Error> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn create(&self, namespace: &str, collection: &str, document: Document) -> Result<Document, Error> {
        let (uuid, document) = prepare_create(document)?;
        let path = self.document_path(namespace, collection, &uuid)?;
        {
            let _guard = self.writes.lock().await;
            if tokio::fs::try_exists(&path).await? {
                return Err(Error::AlreadyExists {
                    collection: collection.to_string(),
                    uuid,
                });
            }
            self.write(&path, &document).await?;
        }
        self.publish(namespace, collection, &document);
        Ok(document)
    }

    async fn apply(
        &self,
        namespace: &str,
        collection: &str,
        uuid: &str,
        document: Document,
        merge: bool,
    ) -> Result<(Document, bool), Error> {
        let path = self.document_path(namespace, collection, uuid)?;
        let (document, inserted) = {
            let _guard = self.writes.lock().await;
            let existing = read_document(&path).await?;
            let (document, inserted) = prepare_apply(existing.as_ref(), uuid, document, merge)?;
            self.write(&path, &document).await?;
            (document, inserted)
        };
        self.publish(namespace, collection, &document);
        Ok((document, inserted))
    }

    async fn get_by_uuid(&self, namespace: &str, collection: &str, uuid: &str) -> Result<Document, Error> {
        let path = self.document_path(namespace, collection, uuid)?;
        read_document(&path).await?.ok_or_else(|| Error::NotFound {
            collection: collection.to_string(),
            uuid: uuid.to_string(),
        })
    }

    async fn list(
        &self,
        namespace: &str,
        collection: &str,
        filter: &Filter,
        sort: Sort,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Document>, Error> {
        let documents = self.read_all(namespace, collection).await?;
        Ok(select(documents, filter, sort, offset, limit))
    }

    async fn count(&self, namespace: &str, collection: &str, filter: &Filter) -> Result<u64, Error> {
        let documents = self.read_all(namespace, collection).await?;
        Ok(documents.iter().filter(|document| filter.matches(document)).count() as u64)
    }

    async fn delete(&self, namespace: &str, collection: &str, uuid: &str) -> Result<(), Error> {
        let path = self.document_path(namespace, collection, uuid)?;
        let _guard = self.writes.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{uuid_of, version_of};
    use serde_json::json;

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = {
            let store = FileStore::open(dir.path()).await.unwrap();
            let created = store
                .create("devops", "artifact", json!({"metadata": {"version": 7}, "spec": {"app_name": "svc"}}))
                .await
                .unwrap();
            uuid_of(&created).unwrap().to_string()
        };

        let store = FileStore::open(dir.path()).await.unwrap();
        let fetched = store.get_by_uuid("devops", "artifact", &uuid).await.unwrap();
        assert_eq!(version_of(&fetched), 7);
        assert!(dir
            .path()
            .join("devops")
            .join("artifact")
            .join(format!("{uuid}.json"))
            .is_file());
    }

    #[tokio::test]
    async fn list_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        for version in [1, 2] {
            store
                .create("devops", "artifact", json!({"metadata": {"version": version}}))
                .await
                .unwrap();
        }
        std::fs::write(dir.path().join("devops/artifact/broken.json"), b"{not json").unwrap();

        let listed = store
            .list("devops", "artifact", &Filter::All, Sort::VersionDesc, 0, 0)
            .await
            .unwrap();
        assert_eq!(listed.iter().map(version_of).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(store.count("devops", "artifact", &Filter::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn apply_delete_and_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let (_, inserted) = store
            .apply("devops", "artifact", "abc", json!({"spec": {"tag": "x"}}), false)
            .await
            .unwrap();
        assert!(inserted);
        store.delete("devops", "artifact", "abc").await.unwrap();
        store.delete("devops", "artifact", "abc").await.unwrap();
        assert!(matches!(
            store.get_by_uuid("devops", "artifact", "abc").await,
            Err(Error::NotFound { .. })
        ));

        assert!(matches!(
            store.get_by_uuid("devops", "artifact", "../../etc/passwd").await,
            Err(Error::InvalidUuid(_))
        ));
    }
}
