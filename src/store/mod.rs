//! Generic document store holding JSON documents addressed by namespace, collection and uuid.
//!
//! The artifact pipeline only relies on the semantics of [`DocumentStore`]; the backends in
//! this module are an in-process [`MemoryStore`] and a directory of JSON files ([`FileStore`]).

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

mod artifacts;
mod file;
mod memory;

pub use artifacts::{by_app_name, ArtifactWatch, Artifacts};
pub use file::FileStore;
pub use memory::MemoryStore;

pub type Document = Value;

const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{collection} {uuid} not found")]
    NotFound { collection: String, uuid: String },

    #[error("{collection} {uuid} already exists")]
    AlreadyExists { collection: String, uuid: String },

    #[error("invalid document id {0:?}")]
    InvalidUuid(String),

    #[error("document is not a JSON object")]
    NotAnObject,

    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which documents a listing should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    /// Case-insensitive substring match on the string found at a JSON pointer.
    Contains { pointer: String, needle: String },
}

impl Filter {
    pub fn contains(pointer: impl Into<String>, needle: &str) -> Self {
        Filter::Contains {
            pointer: pointer.into(),
            needle: needle.to_lowercase(),
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Contains { pointer, needle } => document
                .pointer(pointer)
                .and_then(Value::as_str)
                .map(|value| value.to_lowercase().contains(needle.as_str()))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sort {
    #[default]
    Unsorted,
    /// Newest `metadata.version` first.
    VersionDesc,
}

/// A write that happened in a store, delivered to watchers.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub namespace: String,
    pub collection: String,
    pub document: Document,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document. A uuid is assigned when `metadata.uuid` is empty.
    async fn create(&self, namespace: &str, collection: &str, document: Document) -> Result<Document, Error>;

    /// Upsert the document stored under `uuid`. With `merge` set, objects are merged
    /// into the existing document instead of replacing it.
    /// Returns the stored document and whether it was inserted.
    async fn apply(
        &self,
        namespace: &str,
        collection: &str,
        uuid: &str,
        document: Document,
        merge: bool,
    ) -> Result<(Document, bool), Error>;

    async fn get_by_uuid(&self, namespace: &str, collection: &str, uuid: &str) -> Result<Document, Error>;

    /// `limit` 0 means no limit.
    async fn list(
        &self,
        namespace: &str,
        collection: &str,
        filter: &Filter,
        sort: Sort,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Document>, Error>;

    async fn count(&self, namespace: &str, collection: &str, filter: &Filter) -> Result<u64, Error>;

    /// Deleting a missing document is not an error.
    async fn delete(&self, namespace: &str, collection: &str, uuid: &str) -> Result<(), Error>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Stream documents of a collection written with a version newer than `version`.
    fn watch(&self, namespace: &str, collection: &str, version: u64) -> Watch {
        Watch {
            events: self.subscribe(),
            namespace: namespace.to_string(),
            collection: collection.to_string(),
            version,
        }
    }
}

pub struct Watch {
    events: broadcast::Receiver<StoreEvent>,
    namespace: String,
    collection: String,
    version: u64,
}

impl Watch {
    /// Next matching document, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Document> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if event.namespace == self.namespace
                        && event.collection == self.collection
                        && version_of(&event.document) > self.version
                    {
                        return Some(event.document);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("watch on {}/{} skipped {skipped} events", self.namespace, self.collection);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

pub fn version_of(document: &Document) -> u64 {
    document
        .pointer("/metadata/version")
        .and_then(Value::as_u64)
        .unwrap_or_default()
}

pub fn uuid_of(document: &Document) -> Option<&str> {
    document
        .pointer("/metadata/uuid")
        .and_then(Value::as_str)
        .filter(|uuid| !uuid.is_empty())
}

fn event_channel() -> broadcast::Sender<StoreEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

fn metadata_mut(document: &mut Document) -> Result<&mut serde_json::Map<String, Value>, Error> {
    document
        .as_object_mut()
        .ok_or(Error::NotAnObject)?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .ok_or(Error::NotAnObject)
}

/// Assign identity to a document about to be created.
fn prepare_create(mut document: Document) -> Result<(String, Document), Error> {
    let metadata = metadata_mut(&mut document)?;
    let uuid = match metadata.get("uuid").and_then(Value::as_str) {
        Some(uuid) if !uuid.is_empty() => uuid.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    metadata.insert("uuid".into(), Value::String(uuid.clone()));
    if metadata.get("created_at").map_or(true, Value::is_null) {
        metadata.insert("created_at".into(), serde_json::to_value(Utc::now())?);
    }
    Ok((uuid, document))
}

/// Compute the document an `apply` call stores, given what is stored today.
fn prepare_apply(
    existing: Option<&Document>,
    uuid: &str,
    mut document: Document,
    merge: bool,
) -> Result<(Document, bool), Error> {
    metadata_mut(&mut document)?.insert("uuid".into(), Value::String(uuid.to_string()));

    match existing {
        Some(existing) if merge => {
            let mut merged = existing.clone();
            merge_json(&mut merged, document);
            Ok((merged, false))
        }
        Some(_) => Ok((document, false)),
        None => {
            let (_, document) = prepare_create(document)?;
            Ok((document, true))
        }
    }
}

fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Filter, sort and paginate an unordered set of documents.
fn select(documents: impl IntoIterator<Item = Document>, filter: &Filter, sort: Sort, offset: u64, limit: u64) -> Vec<Document> {
    let mut selected: Vec<Document> = documents.into_iter().filter(|document| filter.matches(document)).collect();
    if sort == Sort::VersionDesc {
        selected.sort_by_key(|document| std::cmp::Reverse(version_of(document)));
    }
    let selected = selected.into_iter().skip(usize::try_from(offset).unwrap_or(usize::MAX));
    if limit == 0 {
        selected.collect()
    } else {
        selected.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect()
    }
}
