//! Streaming Types
//!
//! Trade events decoded from upstream feeds, the market metadata used to
//! render alerts, and the lifecycle state published by each feed worker.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::subscription::{FeedId, SubscriberId, SubscriberThresholds};

// =============================================================================
// Trade Events
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy side.
    Buy,
    /// Sell side.
    Sell,
}

impl Side {
    /// Wire name of the side.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// A single trade observed on a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    /// Feed the trade was observed on.
    pub feed_id: FeedId,
    /// Upstream identifier (asset) that traded.
    pub asset_id: String,
    /// Aggressor side.
    pub side: Side,
    /// Execution price.
    pub price: Decimal,
    /// Executed size.
    pub size: Decimal,
}

impl TradeEvent {
    /// Notional value of the trade in USD, or `None` when `price * size`
    /// does not fit in a `Decimal`.
    #[must_use]
    pub fn usd_value(&self) -> Option<Decimal> {
        self.price.checked_mul(self.size)
    }

    /// Subscribers whose threshold is met by this trade.
    ///
    /// A subscriber qualifies when `threshold <= usd_value`. A trade whose
    /// value overflows qualifies nobody.
    #[must_use]
    pub fn qualifying_subscribers(&self, subscribers: &SubscriberThresholds) -> Vec<SubscriberId> {
        let Some(value) = self.usd_value() else {
            return Vec::new();
        };
        subscribers
            .iter()
            .filter(|(_, threshold)| **threshold <= value)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Render the alert text for this trade, given its `usd_value`.
    #[must_use]
    pub fn alert_text(&self, usd_value: Decimal, metadata: &FeedMetadata) -> String {
        format!(
            "{} @ {} ({:.2}$), {} {}",
            self.side.as_str(),
            self.price,
            usd_value,
            metadata.question,
            metadata.outcome_for(&self.asset_id),
        )
    }
}

// =============================================================================
// Feed Metadata
// =============================================================================

/// What a feed name resolves to: upstream identifiers plus display data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedMetadata {
    /// Identifiers sent in the upstream subscribe frame.
    pub asset_ids: Vec<String>,
    /// Human readable market question.
    pub question: String,
    /// Outcome label per asset id.
    pub outcomes: Vec<(String, String)>,
}

impl FeedMetadata {
    /// Outcome label for an asset, or `"N/A"` when unknown.
    #[must_use]
    pub fn outcome_for(&self, asset_id: &str) -> &str {
        self.outcomes
            .iter()
            .find(|(id, _)| id == asset_id)
            .map_or("N/A", |(_, outcome)| outcome.as_str())
    }
}

// =============================================================================
// Worker State
// =============================================================================

/// Lifecycle of a feed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Opening the upstream connection.
    Connecting,
    /// Subscribe frame sent.
    Subscribed,
    /// Decoding inbound frames.
    Streaming,
    /// Releasing the connection.
    Closing,
    /// Connection released; the worker is gone.
    Closed,
}

impl WorkerState {
    /// Whether the worker has started shutting down.
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Counters and state shared between a running worker and observers.
#[derive(Debug)]
pub struct WorkerStatus {
    feed_id: FeedId,
    state: RwLock<WorkerState>,
    started_at: DateTime<Utc>,
    last_traffic_at: RwLock<Option<DateTime<Utc>>>,
    frames_received: AtomicU64,
    trades_seen: AtomicU64,
    alerts_dispatched: AtomicU64,
    reconnects: AtomicU64,
}

impl WorkerStatus {
    /// Create status for a worker that is about to connect.
    #[must_use]
    pub fn new(feed_id: impl Into<FeedId>) -> Self {
        Self {
            feed_id: feed_id.into(),
            state: RwLock::new(WorkerState::Connecting),
            started_at: Utc::now(),
            last_traffic_at: RwLock::new(None),
            frames_received: AtomicU64::new(0),
            trades_seen: AtomicU64::new(0),
            alerts_dispatched: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Feed this worker serves.
    #[must_use]
    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    /// Move to a new state.
    pub fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Record an inbound frame.
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        *self.last_traffic_at.write() = Some(Utc::now());
    }

    /// Record a decoded trade and the alerts it produced.
    pub fn record_trade(&self, alerts: u64) {
        self.trades_seen.fetch_add(1, Ordering::Relaxed);
        self.alerts_dispatched.fetch_add(alerts, Ordering::Relaxed);
    }

    /// Record a reconnect attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for reporting.
    #[must_use]
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            feed_id: self.feed_id.clone(),
            state: self.state(),
            started_at: self.started_at,
            last_traffic_at: *self.last_traffic_at.read(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            trades_seen: self.trades_seen.load(Ordering::Relaxed),
            alerts_dispatched: self.alerts_dispatched.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Feed served.
    pub feed_id: FeedId,
    /// Lifecycle state.
    pub state: WorkerState,
    /// When the worker was created.
    pub started_at: DateTime<Utc>,
    /// Last inbound upstream traffic.
    pub last_traffic_at: Option<DateTime<Utc>>,
    /// Inbound frames.
    pub frames_received: u64,
    /// Decoded trades.
    pub trades_seen: u64,
    /// Alerts handed to the dispatcher.
    pub alerts_dispatched: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn trade(price: i64, size: i64) -> TradeEvent {
        TradeEvent {
            feed_id: "A".to_string(),
            asset_id: "asset-yes".to_string(),
            side: Side::Buy,
            price: Decimal::from(price),
            size: Decimal::from(size),
        }
    }

    #[test]
    fn usd_value_is_price_times_size() {
        assert_eq!(trade(6, 100).usd_value(), Some(Decimal::from(600)));
    }

    #[test]
    fn overflowing_value_is_none_and_qualifies_nobody() {
        let event = TradeEvent {
            price: Decimal::MAX,
            size: Decimal::from(2),
            ..trade(0, 0)
        };
        let subscribers = SubscriberThresholds::from([(1, Decimal::ZERO)]);

        assert_eq!(event.usd_value(), None);
        assert!(event.qualifying_subscribers(&subscribers).is_empty());
    }

    #[test]
    fn threshold_equal_to_value_qualifies() {
        let subscribers = SubscriberThresholds::from([(1, Decimal::from(600))]);
        assert_eq!(trade(6, 100).qualifying_subscribers(&subscribers), vec![1]);
    }

    #[test]
    fn only_met_thresholds_qualify() {
        let subscribers =
            SubscriberThresholds::from([(1, Decimal::from(500)), (2, Decimal::from(100))]);

        assert_eq!(trade(2, 100).qualifying_subscribers(&subscribers), vec![2]);

        let mut both = trade(6, 100).qualifying_subscribers(&subscribers);
        both.sort_unstable();
        assert_eq!(both, vec![1, 2]);
    }

    #[test]
    fn alert_text_includes_market_details() {
        let metadata = FeedMetadata {
            asset_ids: vec!["asset-yes".to_string()],
            question: "Will it rain?".to_string(),
            outcomes: vec![("asset-yes".to_string(), "Yes".to_string())],
        };
        let event = TradeEvent {
            price: "0.55".parse().unwrap(),
            size: Decimal::from(2000),
            ..trade(0, 0)
        };

        assert_eq!(
            event.alert_text(Decimal::from(1100), &metadata),
            "BUY @ 0.55 (1100.00$), Will it rain? Yes"
        );
    }

    #[test]
    fn unknown_asset_outcome_is_na() {
        let metadata = FeedMetadata::default();
        assert_eq!(metadata.outcome_for("nope"), "N/A");
    }

    #[test]
    fn worker_status_counters() {
        let status = WorkerStatus::new("A");
        assert_eq!(status.state(), WorkerState::Connecting);

        status.record_frame();
        status.record_trade(3);
        status.set_state(WorkerState::Streaming);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.trades_seen, 1);
        assert_eq!(snapshot.alerts_dispatched, 3);
        assert_eq!(snapshot.state, WorkerState::Streaming);
        assert!(snapshot.last_traffic_at.is_some());
    }

    #[test]
    fn terminating_states() {
        assert!(WorkerState::Closing.is_terminating());
        assert!(WorkerState::Closed.is_terminating());
        assert!(!WorkerState::Streaming.is_terminating());
    }

    fn decimal() -> impl Strategy<Value = Decimal> {
        (0i64..10_000_000, 0u32..=6).prop_map(|(mantissa, scale)| Decimal::new(mantissa, scale))
    }

    proptest! {
        #[test]
        fn qualifies_exactly_when_threshold_is_met(
            price in decimal(),
            size in decimal(),
            thresholds in prop::collection::hash_map(0i64..1_000, decimal(), 0..16),
        ) {
            let event = TradeEvent { price, size, ..trade(0, 0) };
            let value = event.usd_value().unwrap();

            let mut subscribers = thresholds;
            // Threshold equal to the trade value always qualifies.
            subscribers.insert(-1, value);

            let mut expected: Vec<SubscriberId> = subscribers
                .iter()
                .filter(|(_, threshold)| **threshold <= value)
                .map(|(id, _)| *id)
                .collect();
            expected.sort_unstable();

            let mut actual = event.qualifying_subscribers(&subscribers);
            actual.sort_unstable();

            prop_assert!(actual.contains(&-1));
            prop_assert_eq!(actual, expected);
        }
    }
}
