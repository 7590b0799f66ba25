//! Version discovery through resource type `check` scripts.

use crate::config::RuntimeConfig;
use crate::process::{execute, Invocation};
use async_trait::async_trait;
use conveyor_core::ports::{CheckCapability, CheckRequest, OutputChunk};
use conveyor_core::version::{Source, Version};
use conveyor_core::{Error, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stderr lines kept for the error message of a failed check.
const ERROR_TAIL_LINES: usize = 10;

#[derive(Debug, Serialize)]
struct CheckInput<'a> {
    source: &'a Source,
    version: Option<&'a Version>,
}

/// Runs `<scripts_dir>/<type>/check` with `{source, version}` on stdin and
/// reads a JSON array of versions, oldest first, from stdout.
#[derive(Debug, Clone)]
pub struct ScriptChecker {
    config: RuntimeConfig,
}

impl ScriptChecker {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CheckCapability for ScriptChecker {
    async fn check(&self, request: &CheckRequest) -> Result<Vec<Version>> {
        let script = self.config.script_path(
            &request.resource_type,
            request.image.base_type(),
            "check",
        );
        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let input = serde_json::to_vec(&CheckInput {
            source: &request.source,
            version: request.from.as_ref(),
        })?;
        let invocation = Invocation::new(&script, &self.config.work_dir)
            .stdin(input)
            .capture_stdout();

        let (tx, mut rx) = mpsc::channel::<OutputChunk>(64);
        let resource_type = request.resource_type.clone();
        let drain = tokio::spawn(async move {
            let mut tail = Vec::new();
            while let Some(chunk) = rx.recv().await {
                debug!(resource_type = %resource_type, line = %chunk.line, "check output");
                tail.push(chunk.line);
                if tail.len() > ERROR_TAIL_LINES {
                    tail.remove(0);
                }
            }
            tail
        });

        // Callers bound checks with a timeout; dropping this future kills the script.
        let finished = execute(invocation, &tx, &CancellationToken::new()).await;
        drop(tx);
        let tail = drain
            .await
            .map_err(|e| Error::Internal(format!("check output reader failed: {e}")))?;
        let finished = finished?;

        if finished.exit_status != 0 {
            return Err(Error::CheckFailed(format!(
                "check exited with status {}: {}",
                finished.exit_status,
                tail.join("\n")
            )));
        }

        serde_json::from_slice(&finished.stdout)
            .map_err(|e| Error::CheckFailed(format!("invalid check response: {e}")))
    }
}
