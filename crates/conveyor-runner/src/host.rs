//! Runtime that executes steps as plain host processes.

use crate::config::RuntimeConfig;
use crate::process::{execute, Invocation};
use async_trait::async_trait;
use conveyor_core::ids::{ContainerId, VolumeId};
use conveyor_core::ports::{
    ContainerRuntime, MountRole, OutputChunk, ProcessAction, ProcessOutcome, ProcessSpec,
};
use conveyor_core::version::{MetadataField, Params, Source, Version};
use conveyor_core::worker::{Volume, Worker};
use conveyor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Input to a resource type's `in` script.
#[derive(Debug, Serialize)]
struct InRequest<'a> {
    source: &'a Source,
    version: &'a Version,
    params: &'a Params,
}

/// Input to a resource type's `out` script.
#[derive(Debug, Serialize)]
struct OutRequest<'a> {
    source: &'a Source,
    params: &'a Params,
}

/// Response of `in` and `out` scripts.
#[derive(Debug, Deserialize)]
struct ScriptResponse {
    version: Version,
    #[serde(default)]
    metadata: Vec<MetadataField>,
}

/// Runs processes directly on the host.
///
/// Volumes are directories under `<work_dir>/volumes`. Each container gets a
/// directory under `<work_dir>/containers` with its mounts linked in at their
/// paths, and processes run there.
#[derive(Debug, Clone)]
pub struct HostRuntime {
    config: RuntimeConfig,
}

impl HostRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn volume_path(&self, id: VolumeId) -> PathBuf {
        self.config.volumes_dir().join(id.to_string())
    }

    pub fn container_path(&self, id: ContainerId) -> PathBuf {
        self.config.containers_dir().join(id.to_string())
    }

    async fn prepare_container(&self, spec: &ProcessSpec) -> Result<PathBuf> {
        let dir = self.container_path(spec.container_id);
        tokio::fs::create_dir_all(&dir).await?;

        for mount in &spec.mounts {
            if mount.role == MountRole::Fetched {
                continue;
            }
            let link = dir.join(&mount.path);
            if let Some(parent) = link.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            remove_path(&link).await?;
            let target = self.volume_path(mount.volume);
            tokio::fs::create_dir_all(&target).await?;
            tokio::fs::symlink(&target, &link).await?;
        }
        Ok(dir)
    }

    fn fetched_volume(&self, spec: &ProcessSpec) -> Result<PathBuf> {
        spec.mounts
            .iter()
            .find(|m| m.role == MountRole::Fetched)
            .map(|m| self.volume_path(m.volume))
            .ok_or_else(|| Error::Execution("get has no destination volume".to_string()))
    }

    async fn run_script(
        &self,
        invocation: Invocation,
        output: &mpsc::Sender<OutputChunk>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        let program = invocation.program.display().to_string();
        let finished = execute(invocation.capture_stdout(), output, cancel).await?;
        if finished.exit_status != 0 {
            return Ok(ProcessOutcome {
                exit_status: finished.exit_status,
                ..Default::default()
            });
        }

        let response: ScriptResponse = serde_json::from_slice(&finished.stdout)
            .map_err(|e| Error::Execution(format!("invalid response from {program}: {e}")))?;
        Ok(ProcessOutcome {
            exit_status: 0,
            version: Some(response.version),
            metadata: response.metadata,
        })
    }
}

#[async_trait]
impl ContainerRuntime for HostRuntime {
    async fn create_volume(&self, worker: &Worker, volume: &Volume) -> Result<()> {
        debug!(worker = %worker.name, volume_id = %volume.id, "Creating volume");
        tokio::fs::create_dir_all(self.volume_path(volume.id)).await?;
        Ok(())
    }

    async fn run(
        &self,
        worker: &Worker,
        spec: ProcessSpec,
        output: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome> {
        let dir = self.prepare_container(&spec).await?;
        info!(worker = %worker.name, container_id = %spec.container_id, "Running process");

        match &spec.action {
            ProcessAction::Task { run } => {
                let program = if run.path.contains('/') && !Path::new(&run.path).is_absolute() {
                    dir.join(&run.path)
                } else {
                    PathBuf::from(&run.path)
                };
                let cwd = match &run.dir {
                    Some(sub) => dir.join(sub),
                    None => dir.clone(),
                };
                let invocation = Invocation::new(program, cwd)
                    .args(run.args.iter().cloned())
                    .env(spec.env.clone());
                let finished = execute(invocation, &output, &cancel).await?;
                Ok(ProcessOutcome {
                    exit_status: finished.exit_status,
                    ..Default::default()
                })
            }
            ProcessAction::Get {
                resource_type,
                source,
                version,
                params,
            } => {
                let dest = self.fetched_volume(&spec)?;
                tokio::fs::create_dir_all(&dest).await?;
                let script = self
                    .config
                    .script_path(resource_type, spec.image.base_type(), "in");
                let request = serde_json::to_vec(&InRequest {
                    source,
                    version,
                    params,
                })?;
                let invocation = Invocation::new(script, &dir)
                    .args([dest.display().to_string()])
                    .env(spec.env.clone())
                    .stdin(request);
                self.run_script(invocation, &output, &cancel).await
            }
            ProcessAction::Put {
                resource_type,
                source,
                params,
            } => {
                let script = self
                    .config
                    .script_path(resource_type, spec.image.base_type(), "out");
                let request = serde_json::to_vec(&OutRequest { source, params })?;
                let invocation = Invocation::new(script, &dir)
                    .args([dir.display().to_string()])
                    .env(spec.env.clone())
                    .stdin(request);
                self.run_script(invocation, &output, &cancel).await
            }
        }
    }

    async fn destroy_container(&self, worker: &Worker, id: ContainerId) -> Result<()> {
        debug!(worker = %worker.name, container_id = %id, "Destroying container");
        remove_path(&self.container_path(id)).await
    }

    async fn destroy_volume(&self, worker: &Worker, id: VolumeId) -> Result<()> {
        debug!(worker = %worker.name, volume_id = %id, "Destroying volume");
        remove_path(&self.volume_path(id)).await
    }
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
async fn remove_path(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conveyor_core::events::LogStream;
    use conveyor_core::pipeline::TaskRun;
    use conveyor_core::plan::ImageSpec;
    use conveyor_core::ports::Mount;
    use conveyor_core::worker::{VolumeKind, WorkerRegistration};
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn setup() -> (TempDir, HostRuntime, Worker) {
        let tmp = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            work_dir: tmp.path().join("work"),
            scripts_dir: tmp.path().join("scripts"),
            ..Default::default()
        };
        let worker = Worker::from_registration(WorkerRegistration {
            name: "local".to_string(),
            platform: "linux".to_string(),
            tags: vec![],
            team: None,
            resource_types: vec!["mock".to_string()],
            version: None,
        });
        (tmp, HostRuntime::new(config), worker)
    }

    fn write_script(runtime: &HostRuntime, resource_type: &str, name: &str, body: &str) {
        let dir = runtime.config().scripts_dir.join(resource_type);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn volume(worker: &Worker) -> Volume {
        Volume {
            id: VolumeId::new(),
            worker: worker.name.clone(),
            kind: VolumeKind::Container,
            container_id: None,
            created_at: Utc::now(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<OutputChunk>) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_task_reads_input_mount() {
        let (_tmp, runtime, worker) = setup();
        let input = volume(&worker);
        runtime.create_volume(&worker, &input).await.unwrap();
        std::fs::write(runtime.volume_path(input.id).join("greeting"), "hello").unwrap();

        let spec = ProcessSpec {
            container_id: ContainerId::new(),
            image: ImageSpec::Rootfs { uri: None },
            action: ProcessAction::Task {
                run: TaskRun::new("sh", vec!["-c".into(), "cat repo/greeting; echo; echo $GREETING".into()]),
            },
            mounts: vec![Mount {
                name: "repo".to_string(),
                volume: input.id,
                path: "repo".to_string(),
                role: MountRole::Input,
            }],
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
        };

        let (tx, rx) = mpsc::channel(100);
        let outcome = runtime
            .run(&worker, spec, tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.succeeded());
        let lines: Vec<String> = collect(rx).await.into_iter().map(|c| c.line).collect();
        assert_eq!(lines, vec!["hello".to_string(), "hi".to_string()]);
    }

    #[tokio::test]
    async fn test_task_failure_is_exit_status() {
        let (_tmp, runtime, worker) = setup();
        let spec = ProcessSpec {
            container_id: ContainerId::new(),
            image: ImageSpec::Rootfs { uri: None },
            action: ProcessAction::Task {
                run: TaskRun::new("sh", vec!["-c".into(), "echo boom >&2; exit 1".into()]),
            },
            mounts: vec![],
            env: BTreeMap::new(),
        };

        let (tx, rx) = mpsc::channel(100);
        let outcome = runtime
            .run(&worker, spec, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.exit_status, 1);
        let chunks = collect(rx).await;
        assert_eq!(chunks[0].stream, LogStream::Stderr);
    }

    #[tokio::test]
    async fn test_get_runs_in_script() {
        let (_tmp, runtime, worker) = setup();
        write_script(
            &runtime,
            "mock",
            "in",
            r#"cat > "$1/request.json"
echo fetching >&2
echo '{"version":{"ref":"abc"},"metadata":[{"name":"author","value":"me"}]}'"#,
        );
        let dest = volume(&worker);

        let mut version = Version::new();
        version.insert("ref".to_string(), "abc".to_string());
        let spec = ProcessSpec {
            container_id: ContainerId::new(),
            image: ImageSpec::BaseType {
                resource_type: "mock".to_string(),
            },
            action: ProcessAction::Get {
                resource_type: "mock".to_string(),
                source: Source::new(),
                version: version.clone(),
                params: Params::new(),
            },
            mounts: vec![Mount {
                name: "repo".to_string(),
                volume: dest.id,
                path: "repo".to_string(),
                role: MountRole::Fetched,
            }],
            env: BTreeMap::new(),
        };

        let (tx, rx) = mpsc::channel(100);
        let outcome = runtime
            .run(&worker, spec, tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.version, Some(version));
        assert_eq!(outcome.metadata[0].name, "author");
        assert!(runtime.volume_path(dest.id).join("request.json").exists());
        let lines: Vec<String> = collect(rx).await.into_iter().map(|c| c.line).collect();
        assert_eq!(lines, vec!["fetching".to_string()]);
    }

    #[tokio::test]
    async fn test_put_with_invalid_response_errors() {
        let (_tmp, runtime, worker) = setup();
        write_script(&runtime, "mock", "out", "echo not-json");

        let spec = ProcessSpec {
            container_id: ContainerId::new(),
            image: ImageSpec::BaseType {
                resource_type: "mock".to_string(),
            },
            action: ProcessAction::Put {
                resource_type: "mock".to_string(),
                source: Source::new(),
                params: Params::new(),
            },
            mounts: vec![],
            env: BTreeMap::new(),
        };

        let (tx, _rx) = mpsc::channel(100);
        let result = runtime.run(&worker, spec, tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Execution(_))));
    }

    #[tokio::test]
    async fn test_destroy_removes_directories() {
        let (_tmp, runtime, worker) = setup();
        let vol = volume(&worker);
        runtime.create_volume(&worker, &vol).await.unwrap();
        assert!(runtime.volume_path(vol.id).exists());

        runtime.destroy_volume(&worker, vol.id).await.unwrap();
        assert!(!runtime.volume_path(vol.id).exists());

        // Destroying twice is harmless.
        runtime.destroy_volume(&worker, vol.id).await.unwrap();
        runtime
            .destroy_container(&worker, ContainerId::new())
            .await
            .unwrap();
    }
}
