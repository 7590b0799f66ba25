//! Scripted stand-ins for the check capability and the container runtime.

use async_trait::async_trait;
use conveyor_core::events::LogStream;
use conveyor_core::ids::{ContainerId, VolumeId};
use conveyor_core::ports::{
    CheckCapability, CheckRequest, ContainerRuntime, OutputChunk, ProcessAction, ProcessOutcome,
    ProcessSpec,
};
use conveyor_core::version::Version;
use conveyor_core::worker::{Volume, Worker};
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Build a `{"ref": r}` version.
pub fn version(r: &str) -> Version {
    Version::from([("ref".to_string(), r.to_string())])
}

/// Answers checks per resource type. Each check returns the configured
/// versions, or nothing for unknown types.
#[derive(Default)]
pub struct FakeCapability {
    responses: Mutex<HashMap<String, std::result::Result<Vec<Version>, String>>>,
    requests: Mutex<Vec<CheckRequest>>,
}

impl FakeCapability {
    pub fn respond(&self, resource_type: &str, refs: &[&str]) {
        self.responses.lock().unwrap().insert(
            resource_type.to_string(),
            Ok(refs.iter().map(|r| version(r)).collect()),
        );
    }

    pub fn fail(&self, resource_type: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(resource_type.to_string(), Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<CheckRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckCapability for FakeCapability {
    async fn check(&self, request: &CheckRequest) -> Result<Vec<Version>> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().get(&request.resource_type) {
            Some(Ok(versions)) => Ok(versions.clone()),
            Some(Err(message)) => Err(Error::CheckFailed(message.clone())),
            None => Ok(Vec::new()),
        }
    }
}

/// Runs processes in memory.
///
/// Gets echo the requested version and puts produce `params.ref`. Tasks
/// behave by run path: `false` exits 1, `sleep` blocks until cancelled and
/// anything else exits 0.
#[derive(Default)]
pub struct FakeRuntime {
    specs: Mutex<Vec<ProcessSpec>>,
}

impl FakeRuntime {
    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// Versions fetched by get steps, in order.
    pub fn fetched(&self) -> Vec<Version> {
        self.specs()
            .into_iter()
            .filter_map(|s| match s.action {
                ProcessAction::Get { version, .. } => Some(version),
                _ => None,
            })
            .collect()
    }

    /// Run paths of tasks, in order.
    pub fn tasks(&self) -> Vec<String> {
        self.specs()
            .into_iter()
            .filter_map(|s| match s.action {
                ProcessAction::Task { run } => Some(run.path),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_volume(&self, _worker: &Worker, _volume: &Volume) -> Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        _worker: &Worker,
        spec: ProcessSpec,
        output: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome> {
        self.specs.lock().unwrap().push(spec.clone());
        match spec.action {
            ProcessAction::Get { version, .. } => Ok(ProcessOutcome {
                exit_status: 0,
                version: Some(version),
                metadata: vec![],
            }),
            ProcessAction::Put { params, .. } => Ok(ProcessOutcome {
                exit_status: 0,
                version: params.get("ref").and_then(|r| r.as_str()).map(version),
                metadata: vec![],
            }),
            ProcessAction::Task { run } => {
                let _ = output
                    .send(OutputChunk {
                        stream: LogStream::Stdout,
                        line: format!("running {}", run.path),
                    })
                    .await;
                match run.path.as_str() {
                    "false" => Ok(ProcessOutcome {
                        exit_status: 1,
                        ..Default::default()
                    }),
                    "sleep" => {
                        cancel.cancelled().await;
                        Err(Error::Execution("interrupted".to_string()))
                    }
                    _ => Ok(ProcessOutcome::default()),
                }
            }
        }
    }

    async fn destroy_container(&self, _worker: &Worker, _id: ContainerId) -> Result<()> {
        Ok(())
    }

    async fn destroy_volume(&self, _worker: &Worker, _id: VolumeId) -> Result<()> {
        Ok(())
    }
}
