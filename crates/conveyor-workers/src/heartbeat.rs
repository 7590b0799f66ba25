//! Heartbeat loop for a worker hosted by this process.

use crate::pool::WorkerPool;
use conveyor_core::Error;
use conveyor_core::worker::WorkerRegistration;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Keeps an in-process worker registered and heartbeating.
pub struct HeartbeatService {
    pool: Arc<WorkerPool>,
    registration: WorkerRegistration,
    interval_secs: u64,
}

impl HeartbeatService {
    pub fn new(pool: Arc<WorkerPool>, registration: WorkerRegistration, interval_secs: u64) -> Self {
        Self {
            pool,
            registration,
            interval_secs,
        }
    }

    /// Run the heartbeat loop until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        info!(
            worker = %self.registration.name,
            interval_secs = self.interval_secs,
            "Starting heartbeat service"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_heartbeat().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Heartbeat service shutting down");
                    break;
                }
            }
        }
    }

    async fn send_heartbeat(&self) {
        let name = &self.registration.name;
        match self.pool.heartbeat(name).await {
            Ok(_) => debug!(worker = %name, "Heartbeat sent"),
            Err(Error::WorkerNotFound(_)) => {
                // Pruned or never registered; come back as a fresh worker.
                if let Err(e) = self.pool.register(self.registration.clone()).await {
                    error!(worker = %name, error = %e, "Failed to re-register worker");
                }
            }
            Err(e) => error!(worker = %name, error = %e, "Failed to send heartbeat"),
        }
    }
}
