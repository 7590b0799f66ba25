//! Error types for Conveyor CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Invalid pipeline config: {0}")]
    InvalidConfig(String),

    #[error("Pipeline config version conflict: expected {expected}, found {found}")]
    ConfigConflict { expected: i64, found: i64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Manual triggering is disabled for job {0}")]
    ManualTriggerDisabled(String),

    // Version errors
    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Resource scope not found: {0}")]
    ScopeNotFound(String),

    // Build errors
    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Build has no plan: {0}")]
    BuildHasNoPlan(String),

    #[error("Plan compilation failed: {0}")]
    Compile(String),

    // Worker errors
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker lost: {0}")]
    WorkerLost(String),

    #[error("No worker fits step: {0}")]
    NoWorkerFits(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Worker {name} is {state}")]
    InvalidWorkerState { name: String, state: String },

    // Execution errors
    #[error("Check failed: {0}")]
    CheckFailed(String),

    #[error("Process failed to execute: {0}")]
    Execution(String),

    #[error("Timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Check not found: {0}")]
    CheckNotFound(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error refers to something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::PipelineNotFound(_)
                | Error::JobNotFound(_)
                | Error::ResourceNotFound(_)
                | Error::VersionNotFound(_)
                | Error::ScopeNotFound(_)
                | Error::BuildNotFound(_)
                | Error::WorkerNotFound(_)
                | Error::ContainerNotFound(_)
                | Error::CheckNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
