//! Polymarket Adapters
//!
//! - **Market channel**: one WebSocket connection per feed (JSON codec)
//! - **Gamma API**: market slug to outcome token identifiers

pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod resolver;
pub mod worker;

pub use codec::{CodecError, MarketCodec};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, LivenessState};
pub use messages::{LastTradePriceMessage, SubscribeRequest};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use resolver::{DEFAULT_GAMMA_BASE_URL, GammaFeedResolver, GammaMarket};
pub use worker::{DEFAULT_MARKET_WS_URL, PolymarketStreamer, StreamerConfig};
