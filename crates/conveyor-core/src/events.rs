//! Build events.
//!
//! Every build has an append-only log of events numbered from 0 without gaps.
//! Events are never revised after append.

use crate::build::BuildStatus;
use crate::ids::{BuildId, PlanId};
use crate::version::{MetadataField, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a build's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub build_id: BuildId,
    /// Position in the build's log, starting at 0.
    pub id: u64,
    pub at: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    Status(StatusPayload),
    Initialize(InitializePayload),
    Start(StartPayload),
    Finish(FinishPayload),
    Log(LogPayload),
    Error(ErrorPayload),
    SelectedWorker(SelectedWorkerPayload),
    Attempt(AttemptPayload),
}

impl EventPayload {
    /// Event name as exposed over SSE.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Status(_) => "status",
            EventPayload::Initialize(_) => "initialize",
            EventPayload::Start(_) => "start",
            EventPayload::Finish(_) => "finish",
            EventPayload::Log(_) => "log",
            EventPayload::Error(_) => "error",
            EventPayload::SelectedWorker(_) => "selected-worker",
            EventPayload::Attempt(_) => "attempt",
        }
    }

    pub fn origin(&self) -> Option<&EventOrigin> {
        match self {
            EventPayload::Status(_) => None,
            EventPayload::Initialize(p) => Some(&p.origin),
            EventPayload::Start(p) => Some(&p.origin),
            EventPayload::Finish(p) => Some(&p.origin),
            EventPayload::Log(p) => Some(&p.origin),
            EventPayload::Error(p) => p.origin.as_ref(),
            EventPayload::SelectedWorker(p) => Some(&p.origin),
            EventPayload::Attempt(p) => Some(&p.origin),
        }
    }

    pub fn status(status: BuildStatus) -> Self {
        EventPayload::Status(StatusPayload {
            status,
            time: Utc::now(),
        })
    }

    pub fn error(origin: Option<EventOrigin>, message: impl Into<String>) -> Self {
        EventPayload::Error(ErrorPayload {
            origin,
            message: message.into(),
        })
    }
}

/// The plan node an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventOrigin {
    pub id: PlanId,
    #[serde(default)]
    pub name: Option<String>,
}

impl EventOrigin {
    pub fn new(id: PlanId, name: Option<String>) -> Self {
        Self { id, name }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: BuildStatus,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializePayload {
    pub origin: EventOrigin,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub origin: EventOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishPayload {
    pub origin: EventOrigin,
    pub status: BuildStatus,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub origin: EventOrigin,
    pub stream: LogStream,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub origin: Option<EventOrigin>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedWorkerPayload {
    pub origin: EventOrigin,
    pub worker: String,
}

/// Start of one retry attempt; `origin` is the attempt's subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptPayload {
    pub origin: EventOrigin,
    /// 1-based attempt number.
    pub attempt: u32,
}
