//! Asynchronous check requests.

use crate::ids::{CheckId, PipelineId};
use crate::pipeline::CheckableKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Started,
    Succeeded,
    Errored,
}

impl CheckStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, CheckStatus::Succeeded | CheckStatus::Errored)
    }
}

/// Handle returned for an out-of-cycle check, pollable for progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckHandle {
    pub id: CheckId,
    pub pipeline_id: PipelineId,
    pub kind: CheckableKind,
    pub name: String,
    pub status: CheckStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CheckHandle {
    pub fn new(pipeline_id: PipelineId, kind: CheckableKind, name: impl Into<String>) -> Self {
        Self {
            id: CheckId::new(),
            pipeline_id,
            kind,
            name: name.into(),
            status: CheckStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
