//! Artifact build service: turns build requests into container image artifacts.
//!
//! A request is validated, its image location is derived from the git URL,
//! the registry project is provisioned, the artifact is stored and a build
//! job is handed to the CI workflow service in the background.

use crate::config::{Config, StoreBackend};
use crate::store::{DocumentStore, FileStore, MemoryStore};
use log::debug;
use std::sync::Arc;
use thiserror::Error;

pub mod artifact;
pub mod config;
pub mod dispatch;
pub mod git;
pub mod image;
pub mod registry;
pub mod service;
pub mod store;
pub mod version;

pub use service::ArtifactService;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    Config(#[from] config::Error),

    #[error("store: {0}")]
    Store(#[from] store::Error),

    #[error("{0}")]
    Service(#[from] service::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Open the document store selected by the `[store]` configuration section.
pub async fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>, Error> {
    Ok(match config.store.backend {
        StoreBackend::Memory => {
            debug!("using in-memory store, nothing will be persisted");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::File => Arc::new(FileStore::open(&config.store.directory).await?),
    })
}
