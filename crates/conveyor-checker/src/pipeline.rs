//! Per-pipeline check loop.

use crate::checker::{CheckOutcome, Checker};
use conveyor_core::ids::{PipelineId, ScopeId};
use conveyor_core::pipeline::{Checkable, CheckableKind, Pipeline};
use conveyor_core::{Error, Result};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub throttled: usize,
    pub failed: usize,
    /// Checkables waiting on a custom type version.
    pub blocked: usize,
    pub discovered: usize,
}

/// Checks every resource and resource type of one pipeline.
pub struct PipelineChecker {
    pipeline_id: PipelineId,
    checker: Arc<Checker>,
}

impl PipelineChecker {
    pub fn new(pipeline_id: PipelineId, checker: Arc<Checker>) -> Self {
        Self {
            pipeline_id,
            checker,
        }
    }

    /// Check whatever is due. Resource types go first, parents before
    /// children, so resources see their type's newest version.
    pub async fn tick(&self) -> Result<TickSummary> {
        let pipeline = self
            .checker
            .pipelines()
            .get(self.pipeline_id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(self.pipeline_id.to_string()))?;

        let mut summary = TickSummary::default();
        if !pipeline.is_active() {
            return Ok(summary);
        }

        let mut seen = HashSet::new();
        for batch in batches(&pipeline) {
            self.check_batch(&pipeline, &batch, &mut seen, &mut summary)
                .await?;
        }
        Ok(summary)
    }

    /// Tick until `shutdown` fires. Errors are logged and the loop goes on.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        info!(pipeline_id = %self.pipeline_id, "Starting pipeline checker");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) => debug!(pipeline_id = %self.pipeline_id, ?summary, "Check tick"),
                        Err(e) => error!(pipeline_id = %self.pipeline_id, error = %e, "Check tick failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(pipeline_id = %self.pipeline_id, "Pipeline checker stopped");
                    break;
                }
            }
        }
    }

    async fn check_batch(
        &self,
        pipeline: &Pipeline,
        batch: &[Checkable],
        seen: &mut HashSet<ScopeId>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let type_versions = self.checker.type_versions(pipeline).await?;

        let mut due = Vec::new();
        for checkable in batch {
            match self
                .checker
                .resolve_scope(pipeline, checkable, &type_versions)
                .await?
            {
                // Checkables sharing a scope share its check.
                Some((scope, image)) => {
                    if seen.insert(scope.id.clone()) {
                        due.push((scope, image, self.checker.interval_for(checkable)));
                    }
                }
                None => summary.blocked += 1,
            }
        }

        let outcomes = join_all(due.into_iter().map(|(scope, image, interval)| async move {
            self.checker.check_scope(&scope, image, interval, false).await
        }))
        .await;

        for outcome in outcomes {
            match outcome? {
                CheckOutcome::Throttled => summary.throttled += 1,
                CheckOutcome::Checked { discovered } => {
                    summary.checked += 1;
                    summary.discovered += discovered;
                }
                CheckOutcome::Failed(_) => summary.failed += 1,
            }
        }
        Ok(())
    }
}

/// Checkables grouped so each group only depends on earlier ones.
fn batches(pipeline: &Pipeline) -> Vec<Vec<Checkable>> {
    let config = &pipeline.config;
    let mut batches: Vec<Vec<Checkable>> = Vec::new();
    let mut last_depth = None;
    let mut resources = Vec::new();

    for checkable in config.checkables() {
        if checkable.kind == CheckableKind::Resource {
            resources.push(checkable);
            continue;
        }
        let depth = config.type_depth(&checkable.resource_type);
        match batches.last_mut() {
            Some(batch) if last_depth == Some(depth) => batch.push(checkable),
            _ => batches.push(vec![checkable]),
        }
        last_depth = Some(depth);
    }
    if !resources.is_empty() {
        batches.push(resources);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckerConfig;
    use crate::testing::{FakeCapability, version};
    use conveyor_core::pipeline::{PipelineConfig, ResourceConfig, ResourceTypeConfig};
    use conveyor_core::plan::ImageSpec;
    use conveyor_core::ports::{PipelineRepository, VersionStore};
    use conveyor_core::version::Source;
    use conveyor_db::MemoryStore;
    use pretty_assertions::assert_eq;

    fn resource(name: &str, resource_type: &str, uri: &str) -> ResourceConfig {
        let mut source = Source::new();
        source.insert("uri".to_string(), serde_json::json!(uri));
        ResourceConfig {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            source,
            check_every_secs: None,
            version: None,
            tags: vec![],
        }
    }

    async fn setup(config: PipelineConfig) -> (MemoryStore, Arc<FakeCapability>, PipelineChecker, Pipeline) {
        let store = MemoryStore::new();
        let capability = Arc::new(FakeCapability::default());
        let checker = Arc::new(Checker::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            capability.clone(),
            CheckerConfig::default(),
        ));
        let pipeline = store.save("main", "ci", &config, None).await.unwrap();
        let pipeline_checker = PipelineChecker::new(pipeline.id, checker);
        (store, capability, pipeline_checker, pipeline)
    }

    async fn scope_of(store: &MemoryStore, pipeline: &Pipeline, kind: CheckableKind, name: &str) -> Option<ScopeId> {
        store
            .resource_state(pipeline.id, kind, name)
            .await
            .unwrap()
            .unwrap()
            .scope_id
    }

    #[tokio::test]
    async fn test_identical_resources_share_scope_and_check() {
        let config = PipelineConfig {
            resources: vec![
                resource("repo", "git", "https://example.com/repo.git"),
                resource("repo-copy", "git", "https://example.com/repo.git"),
            ],
            ..Default::default()
        };
        let (store, capability, checker, pipeline) = setup(config).await;
        capability.respond("git", vec![version("a"), version("b")]);

        let summary = checker.tick().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.discovered, 2);
        assert_eq!(capability.calls(), 1);

        let first = scope_of(&store, &pipeline, CheckableKind::Resource, "repo").await;
        let second = scope_of(&store, &pipeline, CheckableKind::Resource, "repo-copy").await;
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_history_keeps_discovery_order() {
        let config = PipelineConfig {
            resources: vec![resource("repo", "git", "uri")],
            ..Default::default()
        };
        let (store, capability, checker, pipeline) = setup(config).await;
        let scope_id = {
            capability.respond("git", vec![version("v1"), version("v2")]);
            checker.tick().await.unwrap();
            scope_of(&store, &pipeline, CheckableKind::Resource, "repo").await.unwrap()
        };

        capability.respond("git", vec![version("v2"), version("v3")]);
        checker
            .checker
            .check_scope(
                &store.get_scope(&scope_id).await.unwrap().unwrap(),
                ImageSpec::BaseType {
                    resource_type: "git".to_string(),
                },
                Duration::from_secs(60),
                true,
            )
            .await
            .unwrap();

        let history: Vec<String> = store
            .versions(&scope_id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version["ref"].clone())
            .collect();
        assert_eq!(history, vec!["v3", "v2", "v1"]);

        // The second check was asked for versions from the latest known one.
        assert_eq!(capability.last_request().unwrap().from, Some(version("v2")));
    }

    #[tokio::test]
    async fn test_interval_throttles_checks() {
        let config = PipelineConfig {
            resources: vec![resource("repo", "git", "uri")],
            ..Default::default()
        };
        let (_store, capability, checker, _pipeline) = setup(config).await;
        capability.respond("git", vec![version("v1")]);

        checker.tick().await.unwrap();
        let summary = checker.tick().await.unwrap();

        assert_eq!(summary.throttled, 1);
        assert_eq!(capability.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_recorded_and_history_kept() {
        let config = PipelineConfig {
            resources: vec![resource("repo", "git", "uri")],
            ..Default::default()
        };
        let (store, capability, checker, pipeline) = setup(config).await;
        capability.respond("git", vec![version("v1")]);
        checker.tick().await.unwrap();
        let scope_id = scope_of(&store, &pipeline, CheckableKind::Resource, "repo").await.unwrap();

        capability.fail("git", "connection refused");
        let scope = store.get_scope(&scope_id).await.unwrap().unwrap();
        let outcome = checker
            .checker
            .check_scope(
                &scope,
                ImageSpec::BaseType {
                    resource_type: "git".to_string(),
                },
                Duration::from_secs(60),
                true,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, CheckOutcome::Failed(ref m) if m.contains("connection refused")));
        let scope = store.get_scope(&scope_id).await.unwrap().unwrap();
        assert!(scope.check_error.unwrap().contains("connection refused"));
        assert_eq!(store.versions(&scope_id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_type_gates_resource() {
        let config = PipelineConfig {
            resources: vec![resource("notify", "slack", "hooks")],
            resource_types: vec![ResourceTypeConfig {
                name: "slack".to_string(),
                resource_type: "registry-image".to_string(),
                source: Source::new(),
                check_every_secs: None,
                tags: vec![],
            }],
            ..Default::default()
        };
        let (store, capability, checker, pipeline) = setup(config).await;

        // The type has no versions, so the resource cannot be checked.
        let summary = checker.tick().await.unwrap();
        assert_eq!(summary.blocked, 1);
        let state = store
            .resource_state(pipeline.id, CheckableKind::Resource, "notify")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.check_error.as_deref(), Some("parent type slack has no version"));

        // Once the type has a version, its resource is checked through it.
        capability.respond("registry-image", vec![version("img1")]);
        capability.respond("slack", vec![version("msg1")]);
        let type_scope_id = scope_of(&store, &pipeline, CheckableKind::ResourceType, "slack")
            .await
            .unwrap();
        let type_scope = store.get_scope(&type_scope_id).await.unwrap().unwrap();
        checker
            .checker
            .check_scope(
                &type_scope,
                ImageSpec::BaseType {
                    resource_type: "registry-image".to_string(),
                },
                Duration::from_secs(60),
                true,
            )
            .await
            .unwrap();
        let summary = checker.tick().await.unwrap();
        assert_eq!(summary.blocked, 0);
        assert_eq!(summary.checked, 1);

        let state = store
            .resource_state(pipeline.id, CheckableKind::Resource, "notify")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.check_error, None);
        let scope = store.get_scope(&state.scope_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(scope.spec.type_version, Some(version("img1")));
        assert_eq!(capability.last_request().unwrap().resource_type, "slack");
    }

    #[tokio::test]
    async fn test_paused_pipeline_is_skipped() {
        let config = PipelineConfig {
            resources: vec![resource("repo", "git", "uri")],
            ..Default::default()
        };
        let (store, capability, checker, pipeline) = setup(config).await;
        store.set_paused(pipeline.id, true).await.unwrap();

        assert_eq!(checker.tick().await.unwrap(), TickSummary::default());
        assert_eq!(capability.calls(), 0);
    }
}
