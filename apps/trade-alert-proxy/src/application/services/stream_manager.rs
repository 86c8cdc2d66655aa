//! Stream Manager
//!
//! Owns the registry of feed workers: at most one live worker per feed,
//! regardless of how many subscribers watch it.
//!
//! Creation and destruction for a feed run under that feed's async lock, so
//! concurrent `ensure_present` calls resolve and spawn exactly once while
//! operations on other feeds proceed in parallel. A worker that ends on its
//! own deregisters itself; registry entries carry a generation so a late exit
//! never removes a newer worker for the same feed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::application::ports::{
    FeedResolver, FeedStreamer, FeedSubscription, ResolveError, StoreError, SubscriberDirectory,
    SubscriptionStore,
};
use crate::domain::streaming::{WorkerSnapshot, WorkerState, WorkerStatus};
use crate::domain::subscription::FeedId;
use crate::infrastructure::metrics::{self, ExitReason};

/// Errors surfaced by the stream manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// The feed name could not be resolved; nothing was started.
    #[error("could not resolve feed {feed_id}: {source}")]
    Resolution {
        /// Feed requested.
        feed_id: FeedId,
        /// Resolver failure.
        source: ResolveError,
    },

    /// Loading subscriptions failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The manager has been drained.
    #[error("stream manager is shutting down")]
    ShuttingDown,
}

/// Outcome of [`StreamManager::resync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Subscriptions loaded into the directory.
    pub subscriptions: usize,
    /// Feeds with a running worker after resync.
    pub started: Vec<FeedId>,
    /// Feeds that could not be started, with the reason.
    pub failed: Vec<(FeedId, String)>,
}

struct WorkerEntry {
    generation: u64,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    status: Arc<WorkerStatus>,
}

impl WorkerEntry {
    fn is_live(&self) -> bool {
        !self.status.state().is_terminating()
            && self
                .handle
                .lock()
                .as_ref()
                .is_none_or(|handle| !handle.is_finished())
    }
}

type Registry = DashMap<FeedId, Arc<WorkerEntry>>;

/// Registry of feed workers.
pub struct StreamManager {
    resolver: Arc<dyn FeedResolver>,
    streamer: Arc<dyn FeedStreamer>,
    directory: Arc<dyn SubscriberDirectory>,
    store: Arc<dyn SubscriptionStore>,
    workers: Arc<Registry>,
    feed_locks: DashMap<FeedId, Arc<tokio::sync::Mutex<()>>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
    ready: AtomicBool,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("workers", &self.workers.len())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl StreamManager {
    /// Create a manager. Workers run under child tokens of `shutdown`.
    #[must_use]
    pub fn new(
        resolver: Arc<dyn FeedResolver>,
        streamer: Arc<dyn FeedStreamer>,
        directory: Arc<dyn SubscriberDirectory>,
        store: Arc<dyn SubscriptionStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            streamer,
            directory,
            store,
            workers: Arc::new(DashMap::new()),
            feed_locks: DashMap::new(),
            next_generation: AtomicU64::new(1),
            shutdown,
            ready: AtomicBool::new(false),
        }
    }

    /// Make sure a live worker streams `feed_id`.
    ///
    /// No-op when one already exists. Otherwise the feed is resolved and a
    /// single worker is started.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Resolution`] when the feed cannot be resolved (no state
    /// change), [`ManagerError::ShuttingDown`] after [`drain`](Self::drain).
    pub async fn ensure_present(&self, feed_id: &str) -> Result<(), ManagerError> {
        let lock = self.feed_lock(feed_id);
        let result = {
            let _guard = lock.lock().await;
            self.ensure_present_locked(feed_id).await
        };
        drop(lock);
        self.release_feed_lock(feed_id);
        result
    }

    async fn ensure_present_locked(&self, feed_id: &str) -> Result<(), ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }

        if let Some(entry) = self.entry(feed_id) {
            if entry.is_live() {
                return Ok(());
            }
            // Exited but not yet deregistered.
            self.stop_entry(feed_id, &entry).await;
        }

        let metadata = self.resolver.resolve(feed_id).await.map_err(|source| {
            tracing::warn!(feed_id, error = %source, "Feed resolution failed");
            ManagerError::Resolution {
                feed_id: feed_id.to_string(),
                source,
            }
        })?;

        self.spawn_worker(FeedSubscription {
            feed_id: feed_id.to_string(),
            metadata,
        });
        Ok(())
    }

    /// Stop the worker for `feed_id` if nobody is subscribed to it anymore.
    ///
    /// Returns `true` when a worker was stopped. When this returns, the
    /// worker's connection has been released.
    pub async fn ensure_absent(&self, feed_id: &str) -> bool {
        let lock = self.feed_lock(feed_id);
        let stopped = {
            let _guard = lock.lock().await;

            if self.directory.count(feed_id) > 0 {
                false
            } else if let Some(entry) = self.entry(feed_id) {
                self.stop_entry(feed_id, &entry).await;
                tracing::info!(feed_id, "Feed worker stopped, no subscribers left");
                true
            } else {
                false
            }
        };
        drop(lock);
        self.release_feed_lock(feed_id);
        stopped
    }

    /// Rebuild the directory and workers from persisted subscriptions.
    ///
    /// Feeds that fail to start are logged and reported; they do not abort
    /// the resync.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if subscriptions cannot be loaded.
    pub async fn resync(&self) -> Result<ResyncReport, ManagerError> {
        let subscriptions = self.store.list_all().await?;

        let mut feeds = BTreeSet::new();
        for sub in &subscriptions {
            self.directory
                .put(&sub.feed_id, sub.subscriber_id, sub.threshold_usd);
            feeds.insert(sub.feed_id.clone());
        }
        metrics::set_directory_entries(self.directory.total());

        let outcomes = futures_util::future::join_all(feeds.into_iter().map(|feed_id| async move {
            let result = self.ensure_present(&feed_id).await;
            (feed_id, result)
        }))
        .await;

        let mut report = ResyncReport {
            subscriptions: subscriptions.len(),
            ..ResyncReport::default()
        };
        for (feed_id, result) in outcomes {
            match result {
                Ok(()) => report.started.push(feed_id),
                Err(e) => {
                    tracing::error!(feed_id = %feed_id, error = %e, "Feed could not be restored");
                    report.failed.push((feed_id, e.to_string()));
                }
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(
            subscriptions = report.subscriptions,
            started = report.started.len(),
            failed = report.failed.len(),
            "Resync complete"
        );
        Ok(report)
    }

    /// Stop every worker and clear the registry. The store is not touched.
    pub async fn drain(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let entries: Vec<(FeedId, Arc<WorkerEntry>)> = self
            .workers
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();

        futures_util::future::join_all(
            entries
                .iter()
                .map(|(feed_id, entry)| self.stop_entry(feed_id, entry)),
        )
        .await;

        self.workers.clear();
        metrics::set_active_workers(0);
        tracing::info!(stopped = entries.len(), "Stream manager drained");
    }

    /// Whether `feed_id` has a live worker.
    #[must_use]
    pub fn has_worker(&self, feed_id: &str) -> bool {
        self.entry(feed_id).is_some_and(|entry| entry.is_live())
    }

    /// Feeds with a live worker, sorted.
    #[must_use]
    pub fn active_feeds(&self) -> Vec<FeedId> {
        let mut feeds: Vec<FeedId> = self
            .workers
            .iter()
            .filter(|item| item.value().is_live())
            .map(|item| item.key().clone())
            .collect();
        feeds.sort();
        feeds
    }

    /// Status of every registered worker, sorted by feed.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|item| item.value().status.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.feed_id.cmp(&b.feed_id));
        snapshots
    }

    /// Whether startup resync has completed and the manager is not drained.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn entry(&self, feed_id: &str) -> Option<Arc<WorkerEntry>> {
        self.workers.get(feed_id).map(|item| Arc::clone(item.value()))
    }

    fn feed_lock(&self, feed_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.feed_locks
                .entry(feed_id.to_string())
                .or_default()
                .value(),
        )
    }

    fn release_feed_lock(&self, feed_id: &str) {
        self.feed_locks
            .remove_if(feed_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn spawn_worker(&self, feed: FeedSubscription) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let status = Arc::new(WorkerStatus::new(feed.feed_id.clone()));
        let entry = Arc::new(WorkerEntry {
            generation,
            cancel: cancel.clone(),
            handle: Mutex::new(None),
            status: Arc::clone(&status),
        });

        // Registered before the task starts so its exit always finds the entry.
        self.workers.insert(feed.feed_id.clone(), Arc::clone(&entry));

        let span = tracing::info_span!("feed_worker", feed_id = %feed.feed_id, generation);
        let handle = tokio::spawn(
            run_worker(
                Arc::clone(&self.streamer),
                feed,
                cancel,
                status,
                Arc::clone(&self.workers),
                generation,
            )
            .instrument(span),
        );
        *entry.handle.lock() = Some(handle);

        metrics::set_active_workers(self.workers.len());
    }

    async fn stop_entry(&self, feed_id: &str, entry: &WorkerEntry) {
        entry.cancel.cancel();

        let handle = entry.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(feed_id, error = %e, "Feed worker panicked");
        }

        entry.status.set_state(WorkerState::Closed);
        self.workers
            .remove_if(feed_id, |_, current| current.generation == entry.generation);
        metrics::set_active_workers(self.workers.len());
    }
}

async fn run_worker(
    streamer: Arc<dyn FeedStreamer>,
    feed: FeedSubscription,
    cancel: CancellationToken,
    status: Arc<WorkerStatus>,
    workers: Arc<Registry>,
    generation: u64,
) {
    let feed_id = feed.feed_id.clone();
    tracing::info!("Feed worker started");
    metrics::record_worker_started();

    match streamer.run(feed, cancel, Arc::clone(&status)).await {
        Ok(()) => {
            tracing::info!("Feed worker stopped");
            metrics::record_worker_exit(ExitReason::Cancelled);
        }
        Err(fault) => {
            tracing::warn!(error = %fault, "Feed worker ended");
            metrics::record_worker_exit(ExitReason::Fault);
        }
    }

    status.set_state(WorkerState::Closed);
    workers.remove_if(&feed_id, |_, current| current.generation == generation);
    metrics::set_active_workers(workers.len());
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{MockFeedResolver, StreamFault};
    use crate::domain::streaming::FeedMetadata;
    use crate::domain::subscription::{FeedDirectory, Subscription};
    use crate::infrastructure::persistence::InMemorySubscriptionStore;

    /// Streams until cancelled, or faults right away when `fail` is set.
    #[derive(Default)]
    struct FakeStreamer {
        fail: AtomicBool,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        cancelled: AtomicUsize,
    }

    #[async_trait]
    impl FeedStreamer for FakeStreamer {
        async fn run(
            &self,
            _feed: FeedSubscription,
            cancel: CancellationToken,
            status: Arc<WorkerStatus>,
        ) -> Result<(), StreamFault> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StreamFault::Closed);
            }

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            status.set_state(WorkerState::Streaming);

            cancel.cancelled().await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn resolver_ok(times: usize) -> MockFeedResolver {
        let mut resolver = MockFeedResolver::new();
        resolver.expect_resolve().times(times).returning(|feed| {
            Ok(FeedMetadata {
                asset_ids: vec![format!("{feed}-yes")],
                question: feed.to_string(),
                outcomes: Vec::new(),
            })
        });
        resolver
    }

    struct Harness {
        manager: Arc<StreamManager>,
        streamer: Arc<FakeStreamer>,
        directory: Arc<FeedDirectory>,
        store: Arc<InMemorySubscriptionStore>,
    }

    fn harness(resolver: MockFeedResolver, store: InMemorySubscriptionStore) -> Harness {
        let streamer = Arc::new(FakeStreamer::default());
        let directory = Arc::new(FeedDirectory::new());
        let store = Arc::new(store);
        let manager = Arc::new(StreamManager::new(
            Arc::new(resolver),
            Arc::clone(&streamer) as Arc<dyn FeedStreamer>,
            Arc::clone(&directory) as Arc<dyn SubscriberDirectory>,
            Arc::clone(&store) as Arc<dyn SubscriptionStore>,
            CancellationToken::new(),
        ));
        Harness {
            manager,
            streamer,
            directory,
            store,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn ensure_present_is_idempotent() {
        let h = harness(resolver_ok(1), InMemorySubscriptionStore::new());

        h.manager.ensure_present("A").await.unwrap();
        h.manager.ensure_present("A").await.unwrap();

        assert_eq!(h.manager.active_feeds(), vec!["A"]);
        eventually(|| h.streamer.runs.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn concurrent_ensure_present_starts_one_worker() {
        let h = harness(resolver_ok(1), InMemorySubscriptionStore::new());

        let calls = (0..16).map(|_| {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.ensure_present("A").await })
        });
        for result in futures_util::future::join_all(calls).await {
            result.unwrap().unwrap();
        }

        eventually(|| h.streamer.runs.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.streamer.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolution_failure_changes_nothing() {
        let mut resolver = MockFeedResolver::new();
        resolver
            .expect_resolve()
            .returning(|feed| Err(ResolveError::NotFound(feed.to_string())));
        let h = harness(resolver, InMemorySubscriptionStore::new());

        let err = h.manager.ensure_present("missing").await.unwrap_err();

        assert!(matches!(err, ManagerError::Resolution { .. }));
        assert!(h.manager.active_feeds().is_empty());
        assert_eq!(h.streamer.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ensure_absent_respects_remaining_subscribers() {
        let h = harness(resolver_ok(1), InMemorySubscriptionStore::new());
        h.directory.put("A", 2, Decimal::from(100));
        h.manager.ensure_present("A").await.unwrap();

        assert!(!h.manager.ensure_absent("A").await);
        assert!(h.manager.has_worker("A"));

        h.directory.remove("A", 2);
        assert!(h.manager.ensure_absent("A").await);

        assert!(!h.manager.has_worker("A"));
        assert_eq!(h.streamer.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ensure_absent_without_worker_is_a_no_op() {
        let h = harness(resolver_ok(0), InMemorySubscriptionStore::new());
        assert!(!h.manager.ensure_absent("A").await);
    }

    #[tokio::test]
    async fn faulted_worker_deregisters_and_can_be_replaced() {
        let h = harness(resolver_ok(2), InMemorySubscriptionStore::new());
        h.streamer.fail.store(true, Ordering::SeqCst);

        h.manager.ensure_present("A").await.unwrap();
        eventually(|| h.manager.snapshot().is_empty()).await;

        h.streamer.fail.store(false, Ordering::SeqCst);
        h.manager.ensure_present("A").await.unwrap();

        assert!(h.manager.has_worker("A"));
        eventually(|| h.streamer.runs.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn resync_restores_directory_and_workers() {
        let store = InMemorySubscriptionStore::with_subscriptions([
            Subscription::new(3, "B", Decimal::from(50)).unwrap(),
            Subscription::new(1, "A", Decimal::from(500)).unwrap(),
            Subscription::new(2, "A", Decimal::from(100)).unwrap(),
        ]);
        let h = harness(resolver_ok(2), store);

        let report = h.manager.resync().await.unwrap();

        assert_eq!(report.subscriptions, 3);
        assert_eq!(report.started, vec!["A", "B"]);
        assert!(report.failed.is_empty());
        assert_eq!(h.manager.active_feeds(), vec!["A", "B"]);
        assert_eq!(h.directory.count("A"), 2);
        assert!(h.manager.is_ready());
    }

    #[tokio::test]
    async fn resync_reports_feeds_that_fail_to_resolve() {
        let store = InMemorySubscriptionStore::with_subscriptions([
            Subscription::new(1, "good", Decimal::ONE).unwrap(),
            Subscription::new(1, "gone", Decimal::ONE).unwrap(),
        ]);
        let mut resolver = MockFeedResolver::new();
        resolver.expect_resolve().returning(|feed| {
            if feed == "gone" {
                Err(ResolveError::NotFound(feed.to_string()))
            } else {
                Ok(FeedMetadata::default())
            }
        });
        let h = harness(resolver, store);

        let report = h.manager.resync().await.unwrap();

        assert_eq!(report.started, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "gone");
    }

    #[tokio::test]
    async fn drain_stops_everything_and_keeps_the_store() {
        let store = InMemorySubscriptionStore::with_subscriptions([
            Subscription::new(1, "A", Decimal::ONE).unwrap(),
            Subscription::new(1, "B", Decimal::ONE).unwrap(),
        ]);
        let h = harness(resolver_ok(2), store);
        h.manager.resync().await.unwrap();

        h.manager.drain().await;

        assert!(h.manager.snapshot().is_empty());
        assert_eq!(h.streamer.cancelled.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.len(), 2);
        assert!(!h.manager.is_ready());
        assert_eq!(
            h.manager.ensure_present("A").await,
            Err(ManagerError::ShuttingDown)
        );
    }
}
