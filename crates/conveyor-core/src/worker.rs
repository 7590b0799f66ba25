//! Workers and the containers and volumes they own.

use crate::ids::{BuildId, ContainerId, PlanId, ScopeId, VersionId, VolumeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    /// Draining gracefully; no new placements.
    Landing,
    Landed,
    /// Draining before removal.
    Retiring,
    /// Missed heartbeats; containers presumed lost.
    Stalled,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Landing => "landing",
            WorkerState::Landed => "landed",
            WorkerState::Retiring => "retiring",
            WorkerState::Stalled => "stalled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(WorkerState::Running),
            "landing" => Some(WorkerState::Landing),
            "landed" => Some(WorkerState::Landed),
            "retiring" => Some(WorkerState::Retiring),
            "stalled" => Some(WorkerState::Stalled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub platform: String,
    pub tags: Vec<String>,
    /// Restricts the worker to one team; `None` is shared.
    pub team: Option<String>,
    /// Base resource types whose images the worker carries.
    pub resource_types: Vec<String>,
    pub state: WorkerState,
    pub version: Option<String>,
    pub active_containers: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    /// A freshly registered, running worker.
    pub fn from_registration(registration: WorkerRegistration) -> Self {
        Self {
            name: registration.name,
            platform: registration.platform,
            tags: registration.tags,
            team: registration.team,
            resource_types: registration.resource_types,
            state: WorkerState::Running,
            version: registration.version,
            active_containers: 0,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn supports(&self, resource_type: &str) -> bool {
        self.resource_types.iter().any(|t| t == resource_type)
    }
}

/// Registration and heartbeat payload sent by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

fn default_platform() -> String {
    "linux".to_string()
}

/// What a leaf step needs from a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRequirements {
    pub team: String,
    pub platform: Option<String>,
    pub tags: Vec<String>,
    pub resource_type: Option<String>,
    /// Prefer workers already holding this cached resource version.
    pub cached_version: Option<(ScopeId, VersionId)>,
    /// Prefer these workers, e.g. the ones holding the step's inputs.
    pub preferred_workers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Created,
    Destroying,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Created => "created",
            ContainerState::Destroying => "destroying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(ContainerState::Creating),
            "created" => Some(ContainerState::Created),
            "destroying" => Some(ContainerState::Destroying),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub worker: String,
    pub build_id: Option<BuildId>,
    pub plan_id: Option<PlanId>,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

/// What a volume holds, and the key it is cached under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum VolumeKind {
    /// Scratch space for one container.
    Container,
    /// Fetched bits of one resource version.
    ResourceCache {
        scope_id: ScopeId,
        version_id: VersionId,
    },
    /// Task cache directory reused across builds.
    TaskCache { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub worker: String,
    pub kind: VolumeKind,
    /// Owning container for container volumes.
    pub container_id: Option<ContainerId>,
    pub created_at: DateTime<Utc>,
}
