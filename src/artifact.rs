use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Identity and bookkeeping shared by every stored document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Assigned by the store on creation, never changed afterwards.
    #[serde(default)]
    pub uuid: String,

    /// `{app_name}-{unix_nanos}` for artifacts.
    pub name: String,

    /// Bumped on every persisted mutation.
    #[serde(default)]
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Stamp a new version: the current time in nanoseconds,
    /// or one past the previous version if the clock has not moved forward.
    pub fn generate_version(&mut self) -> u64 {
        let now = u64::try_from(unix_nanos()).unwrap_or_default();
        self.version = now.max(self.version.saturating_add(1));
        self.version
    }
}

/// Nanoseconds since the Unix epoch.
pub fn unix_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Where an artifact is in its build lifecycle.
///
/// ```text
/// Initialized -> Building -> Succeeded
///      |             \----> Failed
///      \-> InitializeFail
/// ```
///
/// `Succeeded` and `Failed` are only ever reported by the external CI service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactStatus {
    #[default]
    Initialized,
    Building,
    InitializeFail,
    Succeeded,
    Failed,
}

impl ArtifactStatus {
    pub fn can_transition_to(self, next: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        matches!(
            (self, next),
            (Initialized, Building)
                | (Initialized, InitializeFail)
                | (Building, Succeeded)
                | (Building, Failed)
        )
    }
}

impl Display for ArtifactStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArtifactStatus::Initialized => "Initialized",
            ArtifactStatus::Building => "Building",
            ArtifactStatus::InitializeFail => "InitializeFail",
            ArtifactStatus::Succeeded => "Succeeded",
            ArtifactStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Final result of a build, as reported back by the CI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    Failed,
}

impl From<BuildOutcome> for ArtifactStatus {
    fn from(outcome: BuildOutcome) -> Self {
        match outcome {
            BuildOutcome::Succeeded => ArtifactStatus::Succeeded,
            BuildOutcome::Failed => ArtifactStatus::Failed,
        }
    }
}

impl FromStr for BuildOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "succeeded" | "success" => Ok(BuildOutcome::Succeeded),
            "failed" | "fail" => Ok(BuildOutcome::Failed),
            other => Err(format!("unknown build outcome '{other}'")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ArtifactSpec {
    pub git_url: String,
    pub app_name: String,
    pub branch: String,
    pub tag: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub language: String,
    /// `registry-host/git-directory`
    pub registry: String,
    /// `registry-host/git-directory/git-repo-name`
    pub images: String,
    #[serde(default)]
    pub project_file: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub artifact_status: ArtifactStatus,
}

/// One requested build. A new build is always a new artifact.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Artifact {
    pub metadata: Metadata,
    pub spec: ArtifactSpec,
}

impl Artifact {
    pub fn uuid(&self) -> &str {
        &self.metadata.uuid
    }

    pub fn status(&self) -> ArtifactStatus {
        self.spec.artifact_status
    }
}

/// Inbound build request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RequestArtifact {
    pub git_url: String,
    pub registry: String,
    pub app_name: String,
    pub branch: String,
    /// Generated when omitted.
    pub tag: Option<String>,
    pub remarks: String,
    pub language: String,
    pub project_file: String,
    pub project_path: String,
}
