use super::{event_channel, prepare_apply, prepare_create, select, Document, DocumentStore, Error, Filter, Sort, StoreEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

type Collections = HashMap<(String, String), HashMap<String, Document>>;

/// Store kept entirely in process memory, lost on exit.
pub struct MemoryStore {
    collections: RwLock<Collections>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            events: event_channel(),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, namespace: &str, collection: &str, document: &Document) {
        // no receivers is fine
        let _ = self.events.send(StoreEvent {
            namespace: namespace.to_string(),
            collection: collection.to_string(),
            document: document.clone(),
        });
    }
}

fn key(namespace: &str, collection: &str) -> (String, String) {
    (namespace.to_string(), collection.to_string())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, namespace: &str, collection: &str, document: Document) -> Result<Document, Error> {
        let (uuid, document) = prepare_create(document)?;
        {
            let mut collections = self.collections.write().await;
            let documents = collections.entry(key(namespace, collection)).or_default();
            if documents.contains_key(&uuid) {
                return Err(Error::AlreadyExists {
                    collection: collection.to_string(),
                    uuid,
                });
            }
            documents.insert(uuid, document.clone());
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
        let (document, inserted) = {
            let mut collections = self.collections.write().await;
            let documents = collections.entry(key(namespace, collection)).or_default();
            let (document, inserted) = prepare_apply(documents.get(uuid), uuid, document, merge)?;
            documents.insert(uuid.to_string(), document.clone());
            (document, inserted)
        };
        self.publish(namespace, collection, &document);
        Ok((document, inserted))
    }

    async fn get_by_uuid(&self, namespace: &str, collection: &str, uuid: &str) -> Result<Document, Error> {
        self.collections
            .read()
            .await
            .get(&key(namespace, collection))
            .and_then(|documents| documents.get(uuid))
            .cloned()
            .ok_or_else(|| Error::NotFound {
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
        let collections = self.collections.read().await;
        let documents = collections
            .get(&key(namespace, collection))
            .map(|documents| documents.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(select(documents, filter, sort, offset, limit))
    }

    async fn count(&self, namespace: &str, collection: &str, filter: &Filter) -> Result<u64, Error> {
        Ok(self
            .collections
            .read()
            .await
            .get(&key(namespace, collection))
            .map(|documents| documents.values().filter(|document| filter.matches(document)).count())
            .unwrap_or_default() as u64)
    }

    async fn delete(&self, namespace: &str, collection: &str, uuid: &str) -> Result<(), Error> {
        if let Some(documents) = self.collections.write().await.get_mut(&key(namespace, collection)) {
            documents.remove(uuid);
        }
        Ok(())
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
    async fn create_get_and_delete() {
        let store = MemoryStore::new();
        let created = store
            .create("devops", "artifact", json!({"metadata": {"name": "svc-1"}}))
            .await
            .unwrap();
        let uuid = uuid_of(&created).unwrap().to_string();

        let fetched = store.get_by_uuid("devops", "artifact", &uuid).await.unwrap();
        assert_eq!(fetched, created);
        // other namespaces do not see it
        assert!(matches!(
            store.get_by_uuid("other", "artifact", &uuid).await,
            Err(Error::NotFound { .. })
        ));

        let duplicate = store.create("devops", "artifact", created.clone()).await;
        assert!(matches!(duplicate, Err(Error::AlreadyExists { .. })));

        store.delete("devops", "artifact", &uuid).await.unwrap();
        store.delete("devops", "artifact", &uuid).await.unwrap();
        store.delete("devops", "never-written", &uuid).await.unwrap();
        assert!(store.get_by_uuid("devops", "artifact", &uuid).await.is_err());
    }

    #[tokio::test]
    async fn apply_upserts() {
        let store = MemoryStore::new();
        let (_, inserted) = store
            .apply("devops", "artifact", "u1", json!({"spec": {"tag": "a"}}), false)
            .await
            .unwrap();
        assert!(inserted);

        let (document, inserted) = store
            .apply("devops", "artifact", "u1", json!({"spec": {"branch": "main"}}), true)
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(document["spec"], json!({"tag": "a", "branch": "main"}));
        assert_eq!(uuid_of(&document), Some("u1"));
    }

    #[tokio::test]
    async fn list_and_count_with_filter() {
        let store = MemoryStore::new();
        for (name, version) in [("payments", 1), ("billing", 2), ("Payments-v2", 3)] {
            store
                .create(
                    "devops",
                    "artifact",
                    json!({"metadata": {"version": version}, "spec": {"app_name": name}}),
                )
                .await
                .unwrap();
        }

        let filter = Filter::contains("/spec/app_name", "PAYMENTS");
        let listed = store
            .list("devops", "artifact", &filter, Sort::VersionDesc, 0, 0)
            .await
            .unwrap();
        let versions: Vec<u64> = listed.iter().map(version_of).collect();
        assert_eq!(versions, vec![3, 1]);
        assert_eq!(store.count("devops", "artifact", &filter).await.unwrap(), 2);
        assert_eq!(store.count("devops", "artifact", &Filter::All).await.unwrap(), 3);
        assert!(store
            .list("devops", "empty", &Filter::All, Sort::Unsorted, 0, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn watch_yields_newer_versions_only() {
        let store = MemoryStore::new();
        let mut watch = store.watch("devops", "artifact", 10);

        store
            .create("devops", "artifact", json!({"metadata": {"version": 5}}))
            .await
            .unwrap();
        store
            .create("devops", "other", json!({"metadata": {"version": 20}}))
            .await
            .unwrap();
        store
            .create("devops", "artifact", json!({"metadata": {"version": 11}}))
            .await
            .unwrap();

        let document = watch.next().await.unwrap();
        assert_eq!(version_of(&document), 11);
    }
}
