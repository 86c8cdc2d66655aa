//! Market Channel Streamer
//!
//! Owns one upstream WebSocket connection per feed. After connecting it sends
//! a single subscribe frame for the feed's asset identifiers, keeps the
//! connection alive with text `PING` frames, and turns every decoded trade
//! into alerts for the subscribers whose threshold it meets.
//!
//! Thresholds are read from the subscriber directory for every trade, so
//! changes made by watch and unwatch apply without touching the connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::MarketCodec;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, LivenessState};
use super::messages::{PING, SubscribeRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FeedStreamer, FeedSubscription, StreamFault, SubscriberDirectory};
use crate::domain::streaming::{WorkerState, WorkerStatus};
use crate::infrastructure::metrics;
use crate::infrastructure::notify::AlertDispatcher;

/// Default market channel URL.
pub const DEFAULT_MARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Bound on the close handshake when a worker is stopped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for market channel connections.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// WebSocket URL.
    pub url: String,
    /// Keep-alive configuration.
    pub heartbeat: HeartbeatConfig,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MARKET_WS_URL)
    }
}

impl StreamerConfig {
    /// Create a configuration for `url` with default keep-alive and no reconnect.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// [`FeedStreamer`] for the Polymarket market channel.
pub struct PolymarketStreamer {
    config: StreamerConfig,
    codec: MarketCodec,
    directory: Arc<dyn SubscriberDirectory>,
    dispatcher: AlertDispatcher,
}

impl std::fmt::Debug for PolymarketStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymarketStreamer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolymarketStreamer {
    /// Create a new streamer.
    #[must_use]
    pub fn new(
        config: StreamerConfig,
        directory: Arc<dyn SubscriberDirectory>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self {
            config,
            codec: MarketCodec::new(),
            directory,
            dispatcher,
        }
    }

    /// Connect, subscribe and stream until cancelled or faulted.
    ///
    /// `Ok(())` means `cancel` fired.
    async fn connect_and_run(
        &self,
        feed: &FeedSubscription,
        cancel: &CancellationToken,
        status: &WorkerStatus,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), StreamFault> {
        status.set_state(WorkerState::Connecting);
        tracing::info!(feed_id = %feed.feed_id, url = %self.config.url, "Connecting to market channel");

        let (ws_stream, _response) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(&self.config.url) => {
                result.map_err(|e| StreamFault::Connect(e.to_string()))?
            }
        };

        let (mut write, mut read) = ws_stream.split();

        let request = SubscribeRequest::market(feed.metadata.asset_ids.clone())
            .to_json()
            .map_err(|e| StreamFault::Encode(e.to_string()))?;
        write
            .send(Message::Text(request.into()))
            .await
            .map_err(|e| StreamFault::WebSocket(e.to_string()))?;

        status.set_state(WorkerState::Subscribed);
        policy.reset();
        tracing::info!(
            feed_id = %feed.feed_id,
            assets = feed.metadata.asset_ids.len(),
            "Subscribed to market channel"
        );

        let liveness = Arc::new(LivenessState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                Arc::clone(&liveness),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    status.set_state(WorkerState::Closing);
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await;
                    return Ok(());
                }
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => {
                            write
                                .send(Message::Text(PING.to_string().into()))
                                .await
                                .map_err(|e| StreamFault::WebSocket(e.to_string()))?;
                        }
                        Some(HeartbeatEvent::Stalled(silence)) => {
                            return Err(StreamFault::Stalled(silence));
                        }
                        None => {
                            return Err(StreamFault::WebSocket("keep-alive stopped".to_string()));
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            record_traffic(&liveness, status);
                            self.handle_text_message(feed, &text, status);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            record_traffic(&liveness, status);
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| StreamFault::WebSocket(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(feed_id = %feed.feed_id, ?frame, "Server sent close frame");
                            return Err(StreamFault::Closed);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            record_traffic(&liveness, status);
                            match std::str::from_utf8(&data) {
                                Ok(text) => self.handle_text_message(feed, text, status),
                                Err(e) => {
                                    tracing::debug!(feed_id = %feed.feed_id, error = %e, "Ignoring non-UTF-8 binary frame");
                                    metrics::record_malformed_frame();
                                }
                            }
                        }
                        Some(Ok(_)) => {
                            record_traffic(&liveness, status);
                        }
                        Some(Err(e)) => {
                            return Err(StreamFault::WebSocket(e.to_string()));
                        }
                        None => {
                            return Err(StreamFault::Closed);
                        }
                    }
                }
            }
        }
    }

    fn handle_text_message(&self, feed: &FeedSubscription, text: &str, status: &WorkerStatus) {
        let started = Instant::now();
        let trades = match self.codec.decode(text) {
            Ok(trades) => trades,
            Err(e) => {
                tracing::debug!(feed_id = %feed.feed_id, error = %e, "Ignoring undecodable frame");
                metrics::record_malformed_frame();
                return;
            }
        };

        for msg in trades {
            let trade = msg.into_trade(&feed.feed_id);
            metrics::record_trade();

            let Some(usd_value) = trade.usd_value() else {
                tracing::warn!(
                    feed_id = %feed.feed_id,
                    price = %trade.price,
                    size = %trade.size,
                    "Trade value out of range, skipping"
                );
                metrics::record_malformed_frame();
                status.record_trade(0);
                continue;
            };

            let recipients = trade.qualifying_subscribers(&self.directory.list(&feed.feed_id));
            if recipients.is_empty() {
                status.record_trade(0);
                continue;
            }

            let text = trade.alert_text(usd_value, &feed.metadata);
            let queued = recipients
                .iter()
                .filter(|id| self.dispatcher.dispatch(**id, text.clone()))
                .count();
            let queued = u64::try_from(queued).unwrap_or(u64::MAX);

            tracing::debug!(
                feed_id = %feed.feed_id,
                usd_value = %usd_value,
                recipients = recipients.len(),
                queued,
                "Trade matched subscribers"
            );
            status.record_trade(queued);
            metrics::record_alerts_queued(queued);
        }

        metrics::record_frame_processing(started.elapsed());
    }
}

fn record_traffic(liveness: &LivenessState, status: &WorkerStatus) {
    liveness.record_traffic();
    status.record_frame();
    metrics::record_frame_received();
    if status.state() == WorkerState::Subscribed {
        status.set_state(WorkerState::Streaming);
    }
}

#[async_trait]
impl FeedStreamer for PolymarketStreamer {
    async fn run(
        &self,
        feed: FeedSubscription,
        cancel: CancellationToken,
        status: Arc<WorkerStatus>,
    ) -> Result<(), StreamFault> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let fault = match self.connect_and_run(&feed, &cancel, &status, &mut policy).await {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            status.set_state(WorkerState::Closing);

            if cancel.is_cancelled() {
                return Ok(());
            }

            tracing::warn!(feed_id = %feed.feed_id, error = %fault, "Market channel connection lost");

            if self.directory.count(&feed.feed_id) == 0 {
                return Err(fault);
            }
            let Some(delay) = policy.next_delay() else {
                return Err(fault);
            };

            status.record_reconnect();
            status.set_state(WorkerState::Connecting);
            metrics::record_reconnect();
            tracing::info!(
                feed_id = %feed.feed_id,
                attempt = policy.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to market channel"
            );

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }

            if self.directory.count(&feed.feed_id) == 0 {
                return Err(fault);
            }
        }
    }
}
