//! Identities of the short-lived exclusive sections.

use crate::ids::{BuildId, PipelineId, ScopeId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Something that at most one actor may work on at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LockId {
    /// Build creation for one job.
    JobScheduling { pipeline_id: PipelineId, job: String },
    /// Build creation for any job of one serial group.
    SerialGroup { pipeline_id: PipelineId, group: String },
    /// Version insertion for one scope.
    ScopeChecking { scope_id: ScopeId },
    /// Execution of one build.
    BuildTracking { build_id: BuildId },
}

impl LockId {
    pub fn job(pipeline_id: PipelineId, job: impl Into<String>) -> Self {
        LockId::JobScheduling {
            pipeline_id,
            job: job.into(),
        }
    }

    pub fn serial_group(pipeline_id: PipelineId, group: impl Into<String>) -> Self {
        LockId::SerialGroup {
            pipeline_id,
            group: group.into(),
        }
    }

    pub fn scope(scope_id: ScopeId) -> Self {
        LockId::ScopeChecking { scope_id }
    }

    pub fn build(build_id: BuildId) -> Self {
        LockId::BuildTracking { build_id }
    }

    /// 64-bit key suitable for database advisory locks.
    pub fn key(&self) -> i64 {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::JobScheduling { pipeline_id, job } => {
                write!(f, "job-scheduling:{pipeline_id}:{job}")
            }
            LockId::SerialGroup { pipeline_id, group } => {
                write!(f, "serial-group:{pipeline_id}:{group}")
            }
            LockId::ScopeChecking { scope_id } => write!(f, "scope-checking:{scope_id}"),
            LockId::BuildTracking { build_id } => write!(f, "build-tracking:{build_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_stable() {
        let pipeline = PipelineId::new();
        let a = LockId::job(pipeline, "unit");
        let b = LockId::job(pipeline, "unit");
        let c = LockId::job(pipeline, "deploy");
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_ne!(a.key(), LockId::serial_group(pipeline, "unit").key());
    }
}
