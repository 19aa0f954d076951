use crate::store::{by_app_name, Artifacts};
use log::{debug, warn};

/// Derives per-application sequence numbers from the names of stored artifacts.
///
/// This is a scan, not a counter: two concurrent builds of the same application
/// can observe the same highest number.
#[derive(Clone)]
pub struct VersionGenerator {
    artifacts: Artifacts,
}

impl VersionGenerator {
    pub fn new(artifacts: Artifacts) -> Self {
        Self { artifacts }
    }

    /// Highest trailing number among the names of artifacts whose application name
    /// contains `app_name`. Returns 0 when nothing matches or the store cannot be read.
    pub async fn highest_sequence(&self, app_name: &str) -> u64 {
        match self.artifacts.list(&by_app_name(app_name), 0, 0).await {
            Ok(artifacts) => {
                let highest = highest_sequence(artifacts.iter().map(|artifact| artifact.metadata.name.as_str()));
                debug!("highest sequence for {app_name} among {} artifacts: {highest}", artifacts.len());
                highest
            }
            Err(err) => {
                warn!("scan artifacts of {app_name}: {err}");
                0
            }
        }
    }
}

pub fn highest_sequence<'a>(names: impl IntoIterator<Item = &'a str>) -> u64 {
    names.into_iter().map(trailing_number).max().unwrap_or_default()
}

/// Number after the last `-` of a name; 0 when it is not a number.
pub fn trailing_number(name: &str) -> u64 {
    name.rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or_default()
}
