//! Builds: job executions and one-off executions.

use crate::ids::{BuildId, PipelineId, VersionId};
use crate::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Build status. Also used for the terminal status of individual plan steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored | BuildStatus::Aborted
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BuildStatus::Pending),
            "started" => Some(BuildStatus::Started),
            "succeeded" => Some(BuildStatus::Succeeded),
            "failed" => Some(BuildStatus::Failed),
            "errored" => Some(BuildStatus::Errored),
            "aborted" => Some(BuildStatus::Aborted),
            _ => None,
        }
    }

    /// Combine the results of concurrently executed siblings.
    ///
    /// Aborted outranks Errored, which outranks Failed.
    pub fn worst(self, other: BuildStatus) -> BuildStatus {
        fn rank(s: BuildStatus) -> u8 {
            match s {
                BuildStatus::Aborted => 4,
                BuildStatus::Errored => 3,
                BuildStatus::Failed => 2,
                BuildStatus::Succeeded => 1,
                BuildStatus::Started | BuildStatus::Pending => 0,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub team: String,
    /// `None` for one-off builds.
    pub pipeline_id: Option<PipelineId>,
    pub job: Option<String>,
    /// Per-job sequence number; one-off builds are not numbered.
    pub number: Option<u64>,
    pub status: BuildStatus,
    pub plan: Option<Plan>,
    pub manually_triggered: bool,
    pub abort_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_one_off(&self) -> bool {
        self.job.is_none()
    }
}

/// A resolved input version recorded against a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildInput {
    /// The get step name.
    pub name: String,
    pub resource: String,
    pub version_id: VersionId,
    /// Whether this version had never been used by the job for this input.
    pub first_occurrence: bool,
}

/// A version produced by a put step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildOutput {
    pub name: String,
    pub resource: String,
    pub version_id: VersionId,
}

/// Parameters for creating a build.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub team: String,
    pub pipeline_id: Option<PipelineId>,
    pub job: Option<String>,
    pub plan: Option<Plan>,
    pub inputs: Vec<BuildInput>,
    pub manually_triggered: bool,
}

impl NewBuild {
    pub fn for_job(
        team: impl Into<String>,
        pipeline_id: PipelineId,
        job: impl Into<String>,
        plan: Plan,
        inputs: Vec<BuildInput>,
    ) -> Self {
        Self {
            team: team.into(),
            pipeline_id: Some(pipeline_id),
            job: Some(job.into()),
            plan: Some(plan),
            inputs,
            manually_triggered: false,
        }
    }

    pub fn one_off(team: impl Into<String>, plan: Plan) -> Self {
        Self {
            team: team.into(),
            pipeline_id: None,
            job: None,
            plan: Some(plan),
            inputs: Vec::new(),
            manually_triggered: true,
        }
    }
}

/// Resource versions touched by one succeeded build, used by `passed`
/// constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildVersions {
    pub build_id: BuildId,
    /// (resource name, version) for every input and output.
    pub versions: Vec<(String, VersionId)>,
}

impl BuildVersions {
    pub fn versions_of<'a>(&'a self, resource: &'a str) -> impl Iterator<Item = VersionId> + 'a {
        self.versions
            .iter()
            .filter(move |(name, _)| name == resource)
            .map(|(_, v)| *v)
    }
}
