//! Polymarket Market Channel Messages
//!
//! Wire types for the CLOB market WebSocket channel.
//!
//! # Outbound
//!
//! ```json
//! {"assets_ids": ["1186...", "7147..."], "type": "market"}
//! ```
//!
//! The keep-alive is the bare text frame `PING`; the server answers `PONG`.
//!
//! # Inbound
//!
//! Frames carry either one event object or an array of them. Only
//! `last_trade_price` events matter here:
//!
//! ```json
//! {"event_type": "last_trade_price", "market": "0x5f65...", "asset_id": "1186...",
//!  "price": "0.456", "size": "219.217767", "side": "BUY"}
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{Side, TradeEvent};

/// Channel name sent in the subscribe frame.
pub const MARKET_CHANNEL: &str = "market";

/// Text keep-alive frame.
pub const PING: &str = "PING";

/// Text keep-alive reply.
pub const PONG: &str = "PONG";

/// Event type carried by trade frames.
pub const LAST_TRADE_PRICE: &str = "last_trade_price";

// =============================================================================
// Outbound
// =============================================================================

/// Initial subscribe frame sent once after the connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Asset identifiers to stream.
    pub assets_ids: Vec<String>,
    /// Channel type, always `market`.
    #[serde(rename = "type")]
    pub channel: String,
}

impl SubscribeRequest {
    /// Subscribe to the market channel for the given assets.
    #[must_use]
    pub fn market(assets_ids: Vec<String>) -> Self {
        Self {
            assets_ids,
            channel: MARKET_CHANNEL.to_string(),
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// A `last_trade_price` event.
///
/// Price and size arrive as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastTradePriceMessage {
    /// Market condition identifier.
    #[serde(default)]
    pub market: String,
    /// Asset (outcome token) identifier.
    pub asset_id: String,
    /// Trade price.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Trade size in shares.
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Aggressor side.
    pub side: Side,
}

impl LastTradePriceMessage {
    /// Convert into a domain trade event for `feed_id`.
    #[must_use]
    pub fn into_trade(self, feed_id: &str) -> TradeEvent {
        TradeEvent {
            feed_id: feed_id.to_string(),
            asset_id: self.asset_id,
            side: self.side,
            price: self.price,
            size: self.size,
        }
    }
}
