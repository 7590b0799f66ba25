//! Starts and stops per-pipeline checkers as pipelines come and go.

use crate::checker::Checker;
use crate::pipeline::PipelineChecker;
use conveyor_core::Result;
use conveyor_core::ids::PipelineId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct CheckerRunner {
    checker: Arc<Checker>,
    sync_interval: Duration,
    contexts: Mutex<HashMap<PipelineId, CancellationToken>>,
}

impl CheckerRunner {
    pub fn new(checker: Arc<Checker>, sync_interval: Duration) -> Self {
        Self {
            checker,
            sync_interval,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn checker(&self) -> &Arc<Checker> {
        &self.checker
    }

    /// Pipelines with a running checker.
    pub async fn running(&self) -> Vec<PipelineId> {
        let mut ids: Vec<_> = self.contexts.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Start checkers for active pipelines and stop the rest.
    pub async fn sync(&self, shutdown: &CancellationToken) -> Result<()> {
        let active: HashSet<PipelineId> = self
            .checker
            .pipelines()
            .list()
            .await?
            .into_iter()
            .filter(|p| p.is_active())
            .map(|p| p.id)
            .collect();

        let mut contexts = self.contexts.lock().await;
        contexts.retain(|id, token| {
            let keep = active.contains(id);
            if !keep {
                token.cancel();
                info!(pipeline_id = %id, "Stopping pipeline checker");
            }
            keep
        });

        for id in active {
            if contexts.contains_key(&id) {
                continue;
            }
            let token = shutdown.child_token();
            let context = PipelineChecker::new(id, self.checker.clone());
            let interval = self.checker.config().tick_interval;
            let stop = token.clone();
            tokio::spawn(async move { context.run(interval, stop).await });
            contexts.insert(id, token);
        }
        Ok(())
    }

    /// Keep contexts in line with pipelines until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        info!("Starting checker runner");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync(&shutdown).await {
                        error!(error = %e, "Failed to sync pipeline checkers");
                    }
                }
                _ = shutdown.cancelled() => {
                    for (_, token) in self.contexts.lock().await.drain() {
                        token.cancel();
                    }
                    info!("Checker runner shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckerConfig;
    use crate::testing::FakeCapability;
    use conveyor_core::pipeline::PipelineConfig;
    use conveyor_core::ports::PipelineRepository;
    use conveyor_db::MemoryStore;

    #[tokio::test]
    async fn test_contexts_follow_pipeline_state() {
        let store = MemoryStore::new();
        let checker = Arc::new(Checker::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(FakeCapability::default()),
            CheckerConfig::default(),
        ));
        let runner = CheckerRunner::new(checker, Duration::from_secs(1));
        let shutdown = CancellationToken::new();

        let a = store.save("main", "a", &PipelineConfig::default(), None).await.unwrap();
        let b = store.save("main", "b", &PipelineConfig::default(), None).await.unwrap();
        runner.sync(&shutdown).await.unwrap();
        assert_eq!(runner.running().await.len(), 2);

        store.set_paused(a.id, true).await.unwrap();
        store.archive(b.id).await.unwrap();
        runner.sync(&shutdown).await.unwrap();
        assert!(runner.running().await.is_empty());

        store.set_paused(a.id, false).await.unwrap();
        runner.sync(&shutdown).await.unwrap();
        assert_eq!(runner.running().await, vec![a.id]);
        shutdown.cancel();
    }
}
