//! Scope resolution and version discovery.

use crate::config::CheckerConfig;
use chrono::Utc;
use conveyor_core::check::{CheckHandle, CheckStatus};
use conveyor_core::ids::{CheckId, PipelineId};
use conveyor_core::pipeline::{Checkable, CheckableKind, Pipeline};
use conveyor_core::plan::ImageSpec;
use conveyor_core::ports::{CheckCapability, CheckRequest, PipelineRepository, VersionStore};
use conveyor_core::version::{ResourceScope, Version};
use conveyor_core::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Finished check handles are kept this long for polling.
const HANDLE_RETENTION_SECS: i64 = 3600;

/// Result of one attempt to check a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Checked recently enough, possibly through another checkable.
    Throttled,
    Checked { discovered: usize },
    /// The check capability failed; the error is recorded on the scope.
    Failed(String),
}

/// Discovers versions through the check capability, one scope at a time.
pub struct Checker {
    pipelines: Arc<dyn PipelineRepository>,
    versions: Arc<dyn VersionStore>,
    capability: Arc<dyn CheckCapability>,
    limiter: Arc<Semaphore>,
    config: CheckerConfig,
    handles: DashMap<CheckId, CheckHandle>,
}

impl Checker {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        versions: Arc<dyn VersionStore>,
        capability: Arc<dyn CheckCapability>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            pipelines,
            versions,
            capability,
            limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            handles: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn pipelines(&self) -> &Arc<dyn PipelineRepository> {
        &self.pipelines
    }

    pub fn interval_for(&self, checkable: &Checkable) -> Duration {
        checkable
            .check_every_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_interval)
    }

    /// Latest enabled version of each custom resource type of a pipeline.
    pub async fn type_versions(&self, pipeline: &Pipeline) -> Result<BTreeMap<String, Version>> {
        let mut versions = BTreeMap::new();
        for state in self.pipelines.resource_states(pipeline.id).await? {
            if state.kind != CheckableKind::ResourceType {
                continue;
            }
            let Some(scope_id) = &state.scope_id else {
                continue;
            };
            if let Some(latest) = self.versions.latest_enabled(scope_id).await? {
                versions.insert(state.name, latest.version);
            }
        }
        Ok(versions)
    }

    /// Point a checkable at the scope for its current configuration.
    ///
    /// Returns `None` when its custom type has no version yet; the reason is
    /// recorded on the checkable.
    pub async fn resolve_scope(
        &self,
        pipeline: &Pipeline,
        checkable: &Checkable,
        type_versions: &BTreeMap<String, Version>,
    ) -> Result<Option<(ResourceScope, ImageSpec)>> {
        let state = self
            .pipelines
            .resource_state(pipeline.id, checkable.kind, &checkable.name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound(checkable.name.clone()))?;

        let Some(image) = pipeline
            .config
            .image_for(&checkable.resource_type, type_versions)
        else {
            let reason = format!("parent type {} has no version", checkable.resource_type);
            debug!(
                pipeline = %pipeline.name,
                checkable = %checkable.name,
                reason = %reason,
                "Checkable not ready"
            );
            if state.check_error.as_deref() != Some(reason.as_str()) {
                self.pipelines
                    .set_resource_check_error(pipeline.id, checkable.kind, &checkable.name, Some(&reason))
                    .await?;
            }
            return Ok(None);
        };

        let scope = self
            .versions
            .find_or_create_scope(&checkable.scope_spec(&image))
            .await?;
        if state.scope_id.as_ref() != Some(&scope.id) {
            debug!(
                pipeline = %pipeline.name,
                checkable = %checkable.name,
                scope_id = %scope.id,
                "Checkable moved to scope"
            );
            self.pipelines
                .set_resource_scope(pipeline.id, checkable.kind, &checkable.name, Some(&scope.id))
                .await?;
        }
        if state.check_error.is_some() {
            self.pipelines
                .set_resource_check_error(pipeline.id, checkable.kind, &checkable.name, None)
                .await?;
        }
        Ok(Some((scope, image)))
    }

    /// Check a scope if its interval has elapsed, or unconditionally when
    /// `immediate` is set.
    pub async fn check_scope(
        &self,
        scope: &ResourceScope,
        image: ImageSpec,
        interval: Duration,
        immediate: bool,
    ) -> Result<CheckOutcome> {
        if !self
            .versions
            .try_claim_check(&scope.id, interval, immediate)
            .await?
        {
            return Ok(CheckOutcome::Throttled);
        }

        let _permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("check limiter closed: {e}")))?;

        let from = self
            .versions
            .latest_version(&scope.id)
            .await?
            .map(|v| v.version);
        let request = CheckRequest {
            resource_type: scope.spec.resource_type.clone(),
            source: scope.spec.source.clone(),
            from,
            image,
        };

        debug!(scope_id = %scope.id, resource_type = %request.resource_type, "Checking scope");
        let result = match tokio::time::timeout(self.config.timeout, self.capability.check(&request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                secs: self.config.timeout.as_secs(),
            }),
        };

        match result {
            Ok(found) => {
                let discovered = self.versions.save_versions(&scope.id, &found).await?;
                self.versions.record_check_result(&scope.id, None).await?;
                if discovered > 0 {
                    info!(scope_id = %scope.id, discovered, "Discovered new versions");
                }
                Ok(CheckOutcome::Checked { discovered })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(scope_id = %scope.id, error = %message, "Check failed");
                self.versions
                    .record_check_result(&scope.id, Some(&message))
                    .await?;
                Ok(CheckOutcome::Failed(message))
            }
        }
    }

    /// Start an out-of-cycle check and return a handle to poll.
    pub async fn request_check(
        self: &Arc<Self>,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
    ) -> Result<CheckHandle> {
        let pipeline = self
            .pipelines
            .get(pipeline_id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(pipeline_id.to_string()))?;
        let checkable = pipeline
            .config
            .checkable(kind, name)
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))?;

        self.prune_handles();
        let handle = CheckHandle::new(pipeline_id, kind, name);
        self.handles.insert(handle.id, handle.clone());

        let checker = Arc::clone(self);
        let id = handle.id;
        tokio::spawn(async move {
            checker.update_handle(id, |h| {
                h.status = CheckStatus::Started;
                h.started_at = Some(Utc::now());
            });
            let error = match checker.run_requested(&pipeline, &checkable).await {
                Ok(None) => None,
                Ok(Some(message)) => Some(message),
                Err(e) => Some(e.to_string()),
            };
            info!(
                pipeline = %pipeline.name,
                checkable = %checkable.name,
                error = ?error,
                "Requested check finished"
            );
            checker.update_handle(id, |h| {
                h.status = if error.is_some() {
                    CheckStatus::Errored
                } else {
                    CheckStatus::Succeeded
                };
                h.error = error;
                h.finished_at = Some(Utc::now());
            });
        });

        Ok(handle)
    }

    pub fn check_status(&self, id: CheckId) -> Result<CheckHandle> {
        self.handles
            .get(&id)
            .map(|h| h.clone())
            .ok_or_else(|| Error::CheckNotFound(id.to_string()))
    }

    /// Returns the check error message, if any.
    async fn run_requested(&self, pipeline: &Pipeline, checkable: &Checkable) -> Result<Option<String>> {
        let type_versions = self.type_versions(pipeline).await?;
        let Some((scope, image)) = self.resolve_scope(pipeline, checkable, &type_versions).await? else {
            return Ok(Some(format!(
                "parent type {} has no version",
                checkable.resource_type
            )));
        };
        match self
            .check_scope(&scope, image, self.interval_for(checkable), true)
            .await?
        {
            CheckOutcome::Failed(message) => Ok(Some(message)),
            CheckOutcome::Checked { .. } | CheckOutcome::Throttled => Ok(None),
        }
    }

    fn update_handle(&self, id: CheckId, f: impl FnOnce(&mut CheckHandle)) {
        if let Some(mut handle) = self.handles.get_mut(&id) {
            f(&mut handle);
        }
    }

    fn prune_handles(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(HANDLE_RETENTION_SECS);
        self.handles
            .retain(|_, h| h.finished_at.is_none_or(|at| at > cutoff));
    }
}
