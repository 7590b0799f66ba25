//! Build event streaming.
//!
//! Events are appended to an [`EventStore`] and readers follow the log from
//! any position with a cursor. Writers never wait on readers: a subscriber
//! that falls behind simply reads a larger batch on its next poll.

use async_stream::try_stream;
use conveyor_core::events::{BuildEvent, EventPayload};
use conveyor_core::ids::BuildId;
use conveyor_core::ports::{EventStore, EventStream};
use conveyor_core::Result;
use dashmap::DashMap;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

const DEFAULT_BATCH_SIZE: usize = 256;

/// Event log front-end shared by the engine (writer) and API (readers).
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    /// Per-build append counters used to wake followers in this process.
    wakers: Arc<DashMap<BuildId, Arc<watch::Sender<u64>>>>,
    poll_interval: Duration,
    batch_size: usize,
}

impl EventLog {
    /// `poll_interval` bounds how long a follower waits before re-reading the
    /// store, which picks up events written by other processes.
    pub fn new(store: Arc<dyn EventStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            wakers: Arc::new(DashMap::new()),
            poll_interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    fn waker(&self, build_id: BuildId) -> Arc<watch::Sender<u64>> {
        self.wakers
            .entry(build_id)
            .or_insert_with(|| Arc::new(watch::channel(0).0))
            .clone()
    }

    fn wake(&self, build_id: BuildId) {
        if let Some(waker) = self.wakers.get(&build_id) {
            waker.send_modify(|n| *n += 1);
        }
    }

    /// Durably append an event, then wake followers.
    pub async fn append(&self, build_id: BuildId, payload: EventPayload) -> Result<BuildEvent> {
        let event = self.store.append(build_id, payload).await?;
        self.wake(build_id);
        Ok(event)
    }

    /// Close the log. Followers drain what is left and then end.
    pub async fn finish(&self, build_id: BuildId) -> Result<()> {
        self.store.mark_completed(build_id).await?;
        self.wake(build_id);
        self.wakers.remove(&build_id);
        debug!(build_id = %build_id, "event log closed");
        Ok(())
    }

    pub async fn read(&self, build_id: BuildId, from: u64, limit: usize) -> Result<Vec<BuildEvent>> {
        self.store.read(build_id, from, limit).await
    }

    /// Follow a build's log starting at event `from`.
    ///
    /// The stream yields every event with id >= `from` in order and ends once
    /// the log is closed and fully read.
    pub fn subscribe(&self, build_id: BuildId, from: u64) -> EventStream {
        let waker = WakerGuard {
            wakers: self.wakers.clone(),
            build_id,
            waker: self.waker(build_id),
        };
        Box::pin(follow(
            self.store.clone(),
            waker,
            build_id,
            from,
            self.poll_interval,
            self.batch_size,
        ))
    }
}

/// A follower's handle on its build's waker. The last follower to go drops
/// the entry so finished or abandoned logs leave nothing behind.
struct WakerGuard {
    wakers: Arc<DashMap<BuildId, Arc<watch::Sender<u64>>>>,
    build_id: BuildId,
    waker: Arc<watch::Sender<u64>>,
}

impl Drop for WakerGuard {
    fn drop(&mut self) {
        // One reference is held by the map and one by this guard.
        self.wakers.remove_if(&self.build_id, |_, w| {
            Arc::ptr_eq(w, &self.waker) && Arc::strong_count(w) == 2
        });
    }
}

fn follow(
    store: Arc<dyn EventStore>,
    waker: WakerGuard,
    build_id: BuildId,
    from: u64,
    poll_interval: Duration,
    batch_size: usize,
) -> impl Stream<Item = Result<BuildEvent>> + Send {
    try_stream! {
        let mut rx = waker.waker.subscribe();
        let mut cursor = from;
        loop {
            rx.borrow_and_update();
            let events = store.read(build_id, cursor, batch_size).await?;
            if !events.is_empty() {
                for event in events {
                    cursor = event.id + 1;
                    yield event;
                }
                continue;
            }

            if store.is_completed(build_id).await? {
                // Events appended between the read and the completion check.
                let tail = store.read(build_id, cursor, batch_size).await?;
                if tail.is_empty() {
                    break;
                }
                for event in tail {
                    cursor = event.id + 1;
                    yield event;
                }
                continue;
            }

            let _ = tokio::time::timeout(poll_interval, rx.changed()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::build::BuildStatus;
    use conveyor_core::events::EventPayload;
    use conveyor_db::MemoryStore;
    use futures::StreamExt;

    fn log() -> EventLog {
        EventLog::new(Arc::new(MemoryStore::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_ends() {
        let log = log();
        let build = BuildId::new();
        for _ in 0..3 {
            log.append(build, EventPayload::status(BuildStatus::Started))
                .await
                .unwrap();
        }
        log.finish(build).await.unwrap();

        let ids: Vec<u64> = log
            .subscribe(build, 1)
            .map(|e| e.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_live_followers_see_same_order() {
        let log = log();
        let build = BuildId::new();
        log.append(build, EventPayload::status(BuildStatus::Pending))
            .await
            .unwrap();

        let first = log.subscribe(build, 0);
        let second = log.subscribe(build, 0);
        let readers = tokio::spawn(async move {
            let a: Vec<u64> = first.map(|e| e.unwrap().id).collect().await;
            let b: Vec<u64> = second.map(|e| e.unwrap().id).collect().await;
            (a, b)
        });

        let writer = log.clone();
        for i in 0..20 {
            writer
                .append(build, EventPayload::error(None, format!("line {i}")))
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
        writer.finish(build).await.unwrap();

        let (a, b) = readers.await.unwrap();
        let expected: Vec<u64> = (0..21).collect();
        assert_eq!(a, expected);
        assert_eq!(b, expected);
        assert!(log.wakers.is_empty());
    }

    #[tokio::test]
    async fn test_followers_leave_no_wakers_behind() {
        let log = log();
        for _ in 0..10 {
            let build = BuildId::new();
            log.append(build, EventPayload::status(BuildStatus::Succeeded))
                .await
                .unwrap();
            log.finish(build).await.unwrap();
            let replayed = log.subscribe(build, 0).count().await;
            assert_eq!(replayed, 1);
        }
        assert!(log.wakers.is_empty());

        // A live follower that goes away early releases its waker too.
        let build = BuildId::new();
        let first = log.subscribe(build, 0);
        let second = log.subscribe(build, 0);
        drop(first);
        assert_eq!(log.wakers.len(), 1);
        drop(second);
        assert!(log.wakers.is_empty());
    }
}
