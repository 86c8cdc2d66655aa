//! Watch Service
//!
//! Composes the store, the directory and the stream manager into the two
//! operations exposed to subscribers.
//!
//! Watch writes in the order store, directory, worker. If starting the worker
//! fails, the store and directory are put back the way they were so no feed
//! is referenced without a durable subscription behind it.

use std::sync::Arc;

use rust_decimal::Decimal;

use super::stream_manager::{ManagerError, StreamManager};
use crate::application::ports::{ResolveError, StoreError, SubscriberDirectory, SubscriptionStore};
use crate::domain::subscription::{FeedId, InvalidThreshold, SubscriberId, Subscription};
use crate::infrastructure::metrics;

/// Errors returned by watch operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// Threshold was negative.
    #[error(transparent)]
    InvalidThreshold(#[from] InvalidThreshold),

    /// The store rejected the write; nothing else was changed.
    #[error(transparent)]
    Store(StoreError),

    /// The feed could not be resolved; the subscription was rolled back.
    #[error("could not resolve feed {feed_id}: {source}")]
    Resolution {
        /// Feed requested.
        feed_id: FeedId,
        /// Resolver failure.
        source: ResolveError,
    },

    /// The service is shutting down.
    #[error("service is shutting down")]
    ShuttingDown,
}

impl From<ManagerError> for WatchError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Resolution { feed_id, source } => Self::Resolution { feed_id, source },
            ManagerError::Store(e) => Self::Store(e),
            ManagerError::ShuttingDown => Self::ShuttingDown,
        }
    }
}

/// Result of an unwatch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwatchOutcome {
    /// The subscription was removed.
    Stopped {
        /// Whether the feed's worker was stopped as a result.
        worker_stopped: bool,
    },
    /// No such subscription existed.
    NotFound,
}

/// Subscriber-facing operations.
pub struct WatchService {
    store: Arc<dyn SubscriptionStore>,
    directory: Arc<dyn SubscriberDirectory>,
    manager: Arc<StreamManager>,
    default_threshold: Decimal,
}

impl std::fmt::Debug for WatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchService")
            .field("default_threshold", &self.default_threshold)
            .finish_non_exhaustive()
    }
}

impl WatchService {
    /// Create a watch service. `default_threshold` applies when a watch
    /// request carries no threshold.
    #[must_use]
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        directory: Arc<dyn SubscriberDirectory>,
        manager: Arc<StreamManager>,
        default_threshold: Decimal,
    ) -> Self {
        Self {
            store,
            directory,
            manager,
            default_threshold,
        }
    }

    /// Threshold used when a watch request omits one.
    #[must_use]
    pub const fn default_threshold(&self) -> Decimal {
        self.default_threshold
    }

    /// Subscribe `subscriber_id` to `feed_id`, creating or updating the
    /// threshold and making sure the feed is streamed.
    ///
    /// # Errors
    ///
    /// See [`WatchError`]. On any error after the store write, the previous
    /// subscription state is restored.
    pub async fn watch(
        &self,
        subscriber_id: SubscriberId,
        feed_id: &str,
        threshold: Option<Decimal>,
    ) -> Result<Subscription, WatchError> {
        let subscription = Subscription::new(
            subscriber_id,
            feed_id,
            threshold.unwrap_or(self.default_threshold),
        )?;

        let previous = self
            .store
            .upsert(&subscription)
            .await
            .map_err(WatchError::Store)?;
        self.directory
            .put(feed_id, subscriber_id, subscription.threshold_usd);

        if let Err(e) = self.manager.ensure_present(feed_id).await {
            self.rollback(&subscription, previous).await;
            return Err(e.into());
        }

        metrics::set_directory_entries(self.directory.total());
        tracing::info!(
            subscriber_id,
            feed_id,
            threshold = %subscription.threshold_usd,
            "Watch started"
        );
        Ok(subscription)
    }

    /// Remove `subscriber_id` from `feed_id`, stopping the worker if it was
    /// the last subscriber.
    ///
    /// A missing subscription is reported as [`UnwatchOutcome::NotFound`]; the
    /// directory and worker are still reconciled.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Store`] if the store cannot be reached.
    pub async fn unwatch(
        &self,
        subscriber_id: SubscriberId,
        feed_id: &str,
    ) -> Result<UnwatchOutcome, WatchError> {
        let found = match self.store.delete(subscriber_id, feed_id).await {
            Ok(_) => true,
            Err(StoreError::NotFound { .. }) => false,
            Err(e) => return Err(WatchError::Store(e)),
        };

        self.directory.remove(feed_id, subscriber_id);
        let worker_stopped = self.manager.ensure_absent(feed_id).await;
        metrics::set_directory_entries(self.directory.total());

        if found {
            tracing::info!(subscriber_id, feed_id, worker_stopped, "Watch stopped");
            Ok(UnwatchOutcome::Stopped { worker_stopped })
        } else {
            tracing::debug!(subscriber_id, feed_id, "Unwatch for unknown subscription");
            Ok(UnwatchOutcome::NotFound)
        }
    }

    /// Remove every subscription held by `subscriber_id`.
    ///
    /// Returns the feeds that were unwatched, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Store`] if the store cannot be reached.
    pub async fn remove_subscriber(
        &self,
        subscriber_id: SubscriberId,
    ) -> Result<Vec<FeedId>, WatchError> {
        let removed = self
            .store
            .delete_subscriber(subscriber_id)
            .await
            .map_err(WatchError::Store)?;

        let mut feeds: Vec<FeedId> = removed.into_iter().map(|sub| sub.feed_id).collect();
        feeds.sort();

        for feed_id in &feeds {
            self.directory.remove(feed_id, subscriber_id);
            self.manager.ensure_absent(feed_id).await;
        }
        metrics::set_directory_entries(self.directory.total());

        tracing::info!(subscriber_id, feeds = feeds.len(), "Subscriber removed");
        Ok(feeds)
    }

    async fn rollback(&self, attempted: &Subscription, previous: Option<Subscription>) {
        let subscriber_id = attempted.subscriber_id;
        let feed_id = attempted.feed_id.as_str();

        match previous {
            Some(previous) => {
                self.directory
                    .put(feed_id, subscriber_id, previous.threshold_usd);
                if let Err(e) = self.store.upsert(&previous).await {
                    tracing::error!(subscriber_id, feed_id, error = %e, "Rollback of subscription update failed");
                }
            }
            None => {
                self.directory.remove(feed_id, subscriber_id);
                if let Err(e) = self.store.delete(subscriber_id, feed_id).await {
                    tracing::error!(subscriber_id, feed_id, error = %e, "Rollback of new subscription failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::application::ports::{
        FeedStreamer, FeedSubscription, MockFeedResolver, MockSubscriptionStore, StreamFault,
    };
    use crate::domain::streaming::{FeedMetadata, WorkerStatus};
    use crate::domain::subscription::FeedDirectory;
    use crate::infrastructure::persistence::InMemorySubscriptionStore;

    #[derive(Default)]
    struct IdleStreamer {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl FeedStreamer for IdleStreamer {
        async fn run(
            &self,
            _feed: FeedSubscription,
            cancel: CancellationToken,
            _status: Arc<WorkerStatus>,
        ) -> Result<(), StreamFault> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn resolver(known: &'static [&'static str]) -> MockFeedResolver {
        let mut resolver = MockFeedResolver::new();
        resolver.expect_resolve().returning(move |feed| {
            if known.iter().any(|k| *k == feed) {
                Ok(FeedMetadata::default())
            } else {
                Err(ResolveError::NotFound(feed.to_string()))
            }
        });
        resolver
    }

    struct Harness {
        service: WatchService,
        manager: Arc<StreamManager>,
        directory: Arc<FeedDirectory>,
        streamer: Arc<IdleStreamer>,
    }

    fn harness(store: Arc<dyn SubscriptionStore>, resolver: MockFeedResolver) -> Harness {
        let directory = Arc::new(FeedDirectory::new());
        let streamer = Arc::new(IdleStreamer::default());
        let manager = Arc::new(StreamManager::new(
            Arc::new(resolver),
            Arc::clone(&streamer) as Arc<dyn FeedStreamer>,
            Arc::clone(&directory) as Arc<dyn SubscriberDirectory>,
            Arc::clone(&store),
            CancellationToken::new(),
        ));
        let service = WatchService::new(
            store,
            Arc::clone(&directory) as Arc<dyn SubscriberDirectory>,
            Arc::clone(&manager),
            Decimal::from(10_000),
        );
        Harness {
            service,
            manager,
            directory,
            streamer,
        }
    }

    #[tokio::test]
    async fn watch_twice_keeps_one_record_and_one_worker() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let h = harness(Arc::clone(&store) as Arc<dyn SubscriptionStore>, resolver(&["A"]));

        h.service.watch(1, "A", Some(Decimal::from(500))).await.unwrap();
        h.service.watch(1, "A", Some(Decimal::from(500))).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(h.directory.count("A"), 1);
        assert_eq!(h.manager.active_feeds(), vec!["A"]);
    }

    #[tokio::test]
    async fn missing_threshold_uses_default() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let h = harness(store, resolver(&["A"]));

        let sub = h.service.watch(1, "A", None).await.unwrap();

        assert_eq!(sub.threshold_usd, Decimal::from(10_000));
        assert_eq!(h.directory.list("A")[&1], Decimal::from(10_000));
    }

    #[tokio::test]
    async fn negative_threshold_is_rejected_before_any_write() {
        let mut store = MockSubscriptionStore::new();
        store.expect_upsert().never();
        let h = harness(Arc::new(store), resolver(&["A"]));

        let err = h.service.watch(1, "A", Some(Decimal::from(-1))).await.unwrap_err();

        assert!(matches!(err, WatchError::InvalidThreshold(_)));
        assert_eq!(h.directory.total(), 0);
    }

    #[tokio::test]
    async fn store_failure_skips_directory_and_worker() {
        let mut store = MockSubscriptionStore::new();
        store
            .expect_upsert()
            .returning(|_| Err(StoreError::Persistence("disk full".into())));
        let h = harness(Arc::new(store), resolver(&["A"]));

        let err = h.service.watch(1, "A", Some(Decimal::ONE)).await.unwrap_err();

        assert_eq!(err, WatchError::Store(StoreError::Persistence("disk full".into())));
        assert_eq!(h.directory.total(), 0);
        assert!(h.manager.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn resolution_failure_rolls_back_new_subscription() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let h = harness(Arc::clone(&store) as Arc<dyn SubscriptionStore>, resolver(&[]));

        let err = h.service.watch(1, "ghost", Some(Decimal::ONE)).await.unwrap_err();

        assert!(matches!(err, WatchError::Resolution { .. }));
        assert!(store.is_empty());
        assert_eq!(h.directory.count("ghost"), 0);
        assert_eq!(h.streamer.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolution_failure_restores_previous_threshold() {
        let previous = Subscription::new(1, "A", Decimal::from(500)).unwrap();
        let store = Arc::new(InMemorySubscriptionStore::with_subscriptions([previous.clone()]));
        let h = harness(Arc::clone(&store) as Arc<dyn SubscriptionStore>, resolver(&[]));
        h.directory.put("A", 1, Decimal::from(500));

        let err = h.service.watch(1, "A", Some(Decimal::from(900))).await;

        assert!(err.is_err());
        assert_eq!(store.list_all().await.unwrap(), vec![previous]);
        assert_eq!(h.directory.list("A")[&1], Decimal::from(500));
    }

    #[tokio::test]
    async fn worker_stops_only_after_last_unwatch() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let h = harness(store, resolver(&["A"]));
        h.service.watch(1, "A", Some(Decimal::from(500))).await.unwrap();
        h.service.watch(2, "A", Some(Decimal::from(100))).await.unwrap();

        let first = h.service.unwatch(1, "A").await.unwrap();
        assert_eq!(first, UnwatchOutcome::Stopped { worker_stopped: false });
        assert!(h.manager.has_worker("A"));

        let second = h.service.unwatch(2, "A").await.unwrap();
        assert_eq!(second, UnwatchOutcome::Stopped { worker_stopped: true });
        assert!(!h.manager.has_worker("A"));
    }

    #[tokio::test]
    async fn unwatch_unknown_is_not_found() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let h = harness(store, resolver(&["A"]));

        assert_eq!(h.service.unwatch(9, "A").await.unwrap(), UnwatchOutcome::NotFound);
    }

    #[tokio::test]
    async fn remove_subscriber_unwatches_every_feed() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let h = harness(Arc::clone(&store) as Arc<dyn SubscriptionStore>, resolver(&["A", "B"]));
        h.service.watch(1, "A", Some(Decimal::ONE)).await.unwrap();
        h.service.watch(1, "B", Some(Decimal::ONE)).await.unwrap();
        h.service.watch(2, "B", Some(Decimal::ONE)).await.unwrap();

        let feeds = h.service.remove_subscriber(1).await.unwrap();

        assert_eq!(feeds, vec!["A", "B"]);
        assert_eq!(h.manager.active_feeds(), vec!["B"]);
        assert_eq!(store.len(), 1);
    }
}
