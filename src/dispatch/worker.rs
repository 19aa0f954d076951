//! Background dispatch of freshly created artifacts.
//!
//! Artifact creation only enqueues the artifact uuid; a dedicated worker task
//! submits the build and records the resulting status.

use super::CiDispatcher;
use crate::artifact::{Artifact, ArtifactStatus};
use crate::config::DispatchConfig;
use crate::store::Artifacts;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Sending half of the dispatch queue. Closing every clone stops the worker.
#[derive(Clone, Debug)]
pub struct DispatchQueue {
    uuids: mpsc::UnboundedSender<String>,
}

impl DispatchQueue {
    /// False when the worker is gone.
    pub fn enqueue(&self, uuid: &str) -> bool {
        self.uuids.send(uuid.to_string()).is_ok()
    }
}

pub struct DispatchWorker {
    handle: JoinHandle<()>,
}

impl DispatchWorker {
    /// Wait until every queued dispatch has settled. Only returns after all
    /// [`DispatchQueue`] clones are dropped.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!("dispatch worker stopped abnormally: {err}");
        }
    }
}

pub fn spawn(dispatcher: CiDispatcher, artifacts: Artifacts, config: DispatchConfig) -> (DispatchQueue, DispatchWorker) {
    let (uuids, queued) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(queued, dispatcher, artifacts, config));
    (DispatchQueue { uuids }, DispatchWorker { handle })
}

async fn run(
    mut queued: mpsc::UnboundedReceiver<String>,
    dispatcher: CiDispatcher,
    artifacts: Artifacts,
    config: DispatchConfig,
) {
    let mut in_flight = JoinSet::new();
    while let Some(uuid) = queued.recv().await {
        while in_flight.try_join_next().is_some() {}
        let (dispatcher, artifacts, config) = (dispatcher.clone(), artifacts.clone(), config.clone());
        in_flight.spawn(async move { dispatch_one(&dispatcher, &artifacts, &config, &uuid).await });
    }
    debug!("dispatch queue closed, waiting for {} dispatches", in_flight.len());
    while in_flight.join_next().await.is_some() {}
}

async fn dispatch_one(dispatcher: &CiDispatcher, artifacts: &Artifacts, config: &DispatchConfig, uuid: &str) {
    let artifact = match artifacts.get(uuid).await {
        Ok(artifact) => artifact,
        Err(err) => {
            error!("dispatch {uuid}: {err}");
            return;
        }
    };
    if artifact.status() != ArtifactStatus::Initialized {
        debug!("dispatch {uuid}: already {}, skipping", artifact.status());
        return;
    }

    let status = if dispatch_with_retries(dispatcher, config, &artifact).await {
        ArtifactStatus::Building
    } else {
        ArtifactStatus::InitializeFail
    };

    // the artifact may have been updated or deleted while the submission was in flight
    match artifacts.transition(uuid, status).await {
        Ok(Some(_)) => info!("artifact {uuid} is now {status}"),
        Ok(None) => info!("artifact {uuid} was deleted or moved on during dispatch, {status} not recorded"),
        // the stored status stays stale, nothing else to do here
        Err(err) => error!("dispatch {uuid}: save status {status}: {err}"),
    }
}

async fn dispatch_with_retries(dispatcher: &CiDispatcher, config: &DispatchConfig, artifact: &Artifact) -> bool {
    let attempts = config.max_attempts.max(1);
    for attempt in 1..=attempts {
        if dispatcher.dispatch(artifact).await {
            return true;
        }
        if attempt < attempts {
            let backoff = backoff_delay(config.backoff(), attempt);
            warn!(
                "dispatch {}: attempt {attempt}/{attempts} rejected, retrying in {backoff:?}",
                artifact.uuid()
            );
            tokio::time::sleep(backoff).await;
        }
    }
    false
}

/// Delay after the `attempt`-th rejection: doubles from `initial`, capped at [`MAX_BACKOFF`].
fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    initial
        .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactSpec, Metadata};
    use crate::config::CiConfig;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_up_to_a_cap() {
        let initial = Duration::from_millis(500);
        assert_eq!(backoff_delay(initial, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(initial, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(initial, 4), Duration::from_secs(4));
        assert_eq!(backoff_delay(initial, 40), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::from_millis(u64::MAX), 3), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn rejected_dispatch_marks_initialize_fail() {
        let artifacts = Artifacts::new(Arc::new(MemoryStore::new()), "devops");
        let dispatcher = CiDispatcher::new(
            CiConfig {
                endpoint: "http://127.0.0.1:1/flowrun".into(),
                action: "artifactory_ci".into(),
                retry_count: 15,
                timeout_secs: 2,
            },
            "devops",
        )
        .unwrap();
        let config = DispatchConfig {
            max_attempts: 2,
            backoff_ms: 1,
        };

        let created = artifacts
            .create(&Artifact {
                metadata: Metadata::named("payments-1"),
                spec: ArtifactSpec {
                    app_name: "payments".into(),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let (queue, worker) = spawn(dispatcher, artifacts.clone(), config);
        assert!(queue.enqueue(created.uuid()));
        // unknown artifacts are logged and skipped
        assert!(queue.enqueue("missing"));
        drop(queue);
        tokio::time::timeout(Duration::from_secs(10), worker.join()).await.unwrap();

        let stored = artifacts.get(created.uuid()).await.unwrap();
        assert_eq!(stored.status(), ArtifactStatus::InitializeFail);
        assert!(stored.metadata.version > created.metadata.version);
    }
}
