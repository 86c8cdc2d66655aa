//! Subscription Types
//!
//! Domain types for tracking which subscribers watch which feeds, and at
//! what trade value they want to be alerted.
//!
//! # Design
//!
//! A [`Subscription`] is keyed by `(subscriber_id, feed_id)`; subscribing
//! again for the same pair replaces the threshold rather than adding a
//! second record.
//!
//! [`FeedDirectory`] is the hot-path projection used by feed workers:
//! `feed_id → {subscriber_id → threshold}`. It is sharded per feed so
//! that a write on one feed never blocks readers of another, and a read
//! of one feed always observes every write to that feed that completed
//! before it.

use std::collections::HashMap;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscriber (a chat id on the delivery channel).
pub type SubscriberId = i64;

/// Stable name of a watched feed (a market slug).
pub type FeedId = String;

/// Current thresholds for a single feed, keyed by subscriber.
pub type SubscriberThresholds = HashMap<SubscriberId, Decimal>;

/// A durable request to be alerted about large trades on one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Who receives the alerts.
    pub subscriber_id: SubscriberId,
    /// Which feed is watched.
    pub feed_id: FeedId,
    /// Minimum trade value in USD that triggers an alert.
    pub threshold_usd: Decimal,
}

impl Subscription {
    /// Create a subscription, rejecting negative thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidThreshold`] when `threshold_usd` is below zero.
    pub fn new(
        subscriber_id: SubscriberId,
        feed_id: impl Into<FeedId>,
        threshold_usd: Decimal,
    ) -> Result<Self, InvalidThreshold> {
        if threshold_usd.is_sign_negative() && !threshold_usd.is_zero() {
            return Err(InvalidThreshold(threshold_usd));
        }

        Ok(Self {
            subscriber_id,
            feed_id: feed_id.into(),
            threshold_usd,
        })
    }
}

/// A threshold below zero was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("threshold must be non-negative, got {0}")]
pub struct InvalidThreshold(pub Decimal);

// =============================================================================
// Feed Directory
// =============================================================================

/// In-process subscriber directory, sharded by feed.
///
/// # Example
///
/// ```rust
/// use rust_decimal::Decimal;
/// use trade_alert_proxy::domain::subscription::FeedDirectory;
///
/// let directory = FeedDirectory::new();
///
/// directory.put("btc-100k", 1, Decimal::from(500));
/// directory.put("btc-100k", 2, Decimal::from(100));
/// assert_eq!(directory.count("btc-100k"), 2);
///
/// // Same pair again replaces the threshold
/// directory.put("btc-100k", 1, Decimal::from(50));
/// assert_eq!(directory.count("btc-100k"), 2);
/// assert_eq!(directory.list("btc-100k")[&1], Decimal::from(50));
///
/// directory.remove("btc-100k", 1);
/// directory.remove("btc-100k", 2);
/// assert_eq!(directory.count("btc-100k"), 0);
/// ```
#[derive(Debug, Default)]
pub struct FeedDirectory {
    feeds: DashMap<FeedId, SubscriberThresholds>,
}

impl FeedDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            feeds: DashMap::new(),
        }
    }

    /// Insert or replace the threshold for `(feed_id, subscriber_id)`.
    pub fn put(&self, feed_id: &str, subscriber_id: SubscriberId, threshold: Decimal) {
        self.feeds
            .entry(feed_id.to_string())
            .or_default()
            .insert(subscriber_id, threshold);
    }

    /// Remove one subscriber from a feed. Missing entries are ignored.
    pub fn remove(&self, feed_id: &str, subscriber_id: SubscriberId) {
        // Drop the feed entry once its last subscriber leaves
        self.feeds.remove_if_mut(feed_id, |_, subscribers| {
            subscribers.remove(&subscriber_id);
            subscribers.is_empty()
        });
    }

    /// Snapshot of the current thresholds for a feed.
    #[must_use]
    pub fn list(&self, feed_id: &str) -> SubscriberThresholds {
        self.feeds
            .get(feed_id)
            .map(|subscribers| subscribers.clone())
            .unwrap_or_default()
    }

    /// Number of subscribers currently watching a feed.
    #[must_use]
    pub fn count(&self, feed_id: &str) -> usize {
        self.feeds.get(feed_id).map_or(0, |subscribers| subscribers.len())
    }

    /// Feeds with at least one subscriber.
    #[must_use]
    pub fn feeds(&self) -> Vec<FeedId> {
        self.feeds.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Total number of `(feed, subscriber)` entries.
    #[must_use]
    pub fn total(&self) -> usize {
        self.feeds.iter().map(|entry| entry.value().len()).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
