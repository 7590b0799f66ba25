//! Keeps one scheduler context per active pipeline.

use crate::context::{SchedulerContext, SchedulerDeps};
use conveyor_core::Result;
use conveyor_core::ids::PipelineId;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct SchedulerRunner {
    deps: SchedulerDeps,
    tick_interval: Duration,
    sync_interval: Duration,
    contexts: Mutex<HashMap<PipelineId, CancellationToken>>,
}

impl SchedulerRunner {
    pub fn new(deps: SchedulerDeps, tick_interval: Duration, sync_interval: Duration) -> Self {
        Self {
            deps,
            tick_interval,
            sync_interval,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// A context for one-shot use, e.g. serving a manual trigger.
    pub fn context(&self, pipeline_id: PipelineId) -> SchedulerContext {
        SchedulerContext::new(pipeline_id, self.deps.clone())
    }

    pub async fn running(&self) -> Vec<PipelineId> {
        let mut ids: Vec<_> = self.contexts.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Start contexts for active pipelines and stop the rest.
    pub async fn sync(&self, shutdown: &CancellationToken) -> Result<()> {
        let active: HashSet<PipelineId> = self
            .deps
            .pipelines
            .list()
            .await?
            .into_iter()
            .filter(|p| p.is_active())
            .map(|p| p.id)
            .collect();

        let mut contexts = self.contexts.lock().await;
        contexts.retain(|id, token| {
            if active.contains(id) {
                return true;
            }
            token.cancel();
            info!(pipeline_id = %id, "Stopping pipeline scheduler");
            false
        });

        for id in active {
            if contexts.contains_key(&id) {
                continue;
            }
            let token = shutdown.child_token();
            let context = self.context(id);
            let interval = self.tick_interval;
            let stop = token.clone();
            tokio::spawn(async move { context.run(interval, stop).await });
            contexts.insert(id, token);
        }
        Ok(())
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        info!("Starting scheduler runner");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync(&shutdown).await {
                        error!(error = %e, "Failed to sync pipeline schedulers");
                    }
                }
                _ = shutdown.cancelled() => {
                    for (_, token) in self.contexts.lock().await.drain() {
                        token.cancel();
                    }
                    info!("Scheduler runner shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingDispatcher, discover};
    use conveyor_core::pipeline::{GetStep, JobConfig, PipelineConfig, ResourceConfig, StepConfig};
    use conveyor_core::ports::PipelineRepository;
    use conveyor_core::version::Source;
    use conveyor_db::{MemoryLockFactory, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_running_contexts_schedule_builds() {
        let store = MemoryStore::new();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let deps = SchedulerDeps {
            pipelines: Arc::new(store.clone()),
            versions: Arc::new(store.clone()),
            builds: Arc::new(store.clone()),
            locks: Arc::new(MemoryLockFactory::new()),
            dispatcher: dispatcher.clone(),
        };
        let runner = SchedulerRunner::new(deps, Duration::from_millis(10), Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let mut get = GetStep::new("repo");
        get.trigger = true;
        let config = PipelineConfig {
            jobs: vec![JobConfig::new("unit", vec![StepConfig::Get(get)])],
            resources: vec![ResourceConfig {
                name: "repo".to_string(),
                resource_type: "git".to_string(),
                source: Source::new(),
                check_every_secs: None,
                version: None,
                tags: vec![],
            }],
            resource_types: vec![],
        };
        let pipeline = store.save("main", "ci", &config, None).await.unwrap();
        let paused = store.save("main", "other", &PipelineConfig::default(), None).await.unwrap();
        store.set_paused(paused.id, true).await.unwrap();

        runner.sync(&shutdown).await.unwrap();
        assert_eq!(runner.running().await, vec![pipeline.id]);

        discover(&store, &pipeline, "repo", &["a"]).await;
        for _ in 0..100 {
            if !dispatcher.dispatched().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.dispatched().len(), 1);

        store.set_paused(pipeline.id, true).await.unwrap();
        runner.sync(&shutdown).await.unwrap();
        assert!(runner.running().await.is_empty());
        shutdown.cancel();
    }
}
