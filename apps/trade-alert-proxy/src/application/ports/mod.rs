//! Port Interfaces
//!
//! Contracts between the application services and the adapters in the
//! infrastructure layer.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`SubscriptionStore`]: durable subscription records
//! - [`SubscriberDirectory`]: hot-path thresholds per feed
//! - [`FeedResolver`]: feed name to upstream identifiers
//! - [`FeedStreamer`]: one upstream connection for one feed
//! - [`NotificationGateway`]: alert delivery to a subscriber

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{FeedMetadata, WorkerStatus};
use crate::domain::subscription::{
    FeedDirectory, FeedId, SubscriberId, SubscriberThresholds, Subscription,
};

// =============================================================================
// Subscription Store
// =============================================================================

/// Errors raised by a [`SubscriptionStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No subscription exists for the pair.
    #[error("no subscription for subscriber {subscriber_id} on feed {feed_id}")]
    NotFound {
        /// Subscriber looked up.
        subscriber_id: SubscriberId,
        /// Feed looked up.
        feed_id: FeedId,
    },

    /// The store could not be reached or the write failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Durable record of `(subscriber, feed, threshold)` triples.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Create or update a subscription. Returns the previous record, if any.
    async fn upsert(&self, subscription: &Subscription)
    -> Result<Option<Subscription>, StoreError>;

    /// Delete one subscription, failing with [`StoreError::NotFound`] when absent.
    async fn delete(
        &self,
        subscriber_id: SubscriberId,
        feed_id: &str,
    ) -> Result<Subscription, StoreError>;

    /// Delete every subscription of a subscriber, returning what was removed.
    async fn delete_subscriber(
        &self,
        subscriber_id: SubscriberId,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Every persisted subscription, in no particular order.
    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError>;
}

// =============================================================================
// Subscriber Directory
// =============================================================================

/// Fast shared lookup of current thresholds per feed.
pub trait SubscriberDirectory: Send + Sync {
    /// Insert or replace a threshold.
    fn put(&self, feed_id: &str, subscriber_id: SubscriberId, threshold: Decimal);
    /// Remove one entry; missing entries are ignored.
    fn remove(&self, feed_id: &str, subscriber_id: SubscriberId);
    /// Current thresholds for a feed.
    fn list(&self, feed_id: &str) -> SubscriberThresholds;
    /// Number of subscribers on a feed.
    fn count(&self, feed_id: &str) -> usize;
    /// Total entries across all feeds.
    fn total(&self) -> usize;
}

impl SubscriberDirectory for FeedDirectory {
    fn put(&self, feed_id: &str, subscriber_id: SubscriberId, threshold: Decimal) {
        Self::put(self, feed_id, subscriber_id, threshold);
    }

    fn remove(&self, feed_id: &str, subscriber_id: SubscriberId) {
        Self::remove(self, feed_id, subscriber_id);
    }

    fn list(&self, feed_id: &str) -> SubscriberThresholds {
        Self::list(self, feed_id)
    }

    fn count(&self, feed_id: &str) -> usize {
        Self::count(self, feed_id)
    }

    fn total(&self) -> usize {
        Self::total(self)
    }
}

// =============================================================================
// Feed Resolver
// =============================================================================

/// Errors raised while resolving a feed name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The directory service has no such feed.
    #[error("feed not found: {0}")]
    NotFound(String),

    /// The directory service could not be reached.
    #[error("resolver request failed: {0}")]
    Http(String),

    /// The directory service answered with something unusable.
    #[error("invalid resolver response: {0}")]
    InvalidResponse(String),
}

/// Maps a feed name to the identifiers the upstream connection subscribes with.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedResolver: Send + Sync {
    /// Resolve a feed name.
    async fn resolve(&self, feed_name: &str) -> Result<FeedMetadata, ResolveError>;
}

// =============================================================================
// Feed Streamer
// =============================================================================

/// Reasons a feed worker's stream ended without being asked to stop.
#[derive(Debug, thiserror::Error)]
pub enum StreamFault {
    /// Could not open the upstream connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Transport error on an open connection.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Upstream closed the connection.
    #[error("upstream closed the connection")]
    Closed,

    /// No upstream traffic within the liveness grace period.
    #[error("upstream stalled for {0:?}")]
    Stalled(std::time::Duration),

    /// Could not encode a control frame.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// A resolved feed ready to be streamed.
#[derive(Debug, Clone)]
pub struct FeedSubscription {
    /// Feed identity.
    pub feed_id: FeedId,
    /// Upstream identifiers and display data.
    pub metadata: FeedMetadata,
}

/// Owns one upstream connection for one feed.
///
/// `run` returns `Ok(())` when `cancel` fires and `Err` when the stream ends
/// on its own. Cancellation must unblock any pending read promptly.
#[async_trait]
pub trait FeedStreamer: Send + Sync {
    /// Stream the feed until cancelled or faulted.
    async fn run(
        &self,
        feed: FeedSubscription,
        cancel: CancellationToken,
        status: Arc<WorkerStatus>,
    ) -> Result<(), StreamFault>;
}

// =============================================================================
// Notification Gateway
// =============================================================================

/// Delivery failure reported by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The channel could not be reached.
    #[error("delivery request failed: {0}")]
    Transport(String),

    /// The channel refused the message.
    #[error("delivery rejected with status {status}: {body}")]
    Rejected {
        /// Status code returned.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// Delivers alert text to a subscriber.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Deliver one alert.
    async fn deliver(&self, subscriber_id: SubscriberId, text: &str) -> Result<(), GatewayError>;
}
