//! Keep-Alive Manager
//!
//! Requests a text `PING` on a fixed interval and watches for upstream
//! silence. Any inbound frame counts as traffic; when nothing arrives within
//! one interval plus the stall grace, the connection is declared stalled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for keep-alive behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between keep-alive frames.
    pub ping_interval: Duration,
    /// Extra silence tolerated on top of one interval before a stall.
    pub stall_grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            stall_grace: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, stall_grace: Duration) -> Self {
        Self {
            ping_interval,
            stall_grace,
        }
    }

    /// Silence after which the connection is considered stalled.
    #[must_use]
    pub fn stall_after(&self) -> Duration {
        self.ping_interval + self.stall_grace
    }
}

/// Events emitted by the keep-alive manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a keep-alive frame now.
    SendPing,
    /// No traffic for the contained duration.
    Stalled(Duration),
}

/// Traffic timestamp shared between the manager and the read loop.
#[derive(Debug)]
pub struct LivenessState {
    last_traffic: RwLock<Instant>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessState {
    /// Create state with traffic recorded now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_traffic: RwLock::new(Instant::now()),
        }
    }

    /// Record that a frame arrived.
    pub fn record_traffic(&self) {
        *self.last_traffic.write() = Instant::now();
    }

    /// Time since the last frame.
    #[must_use]
    pub fn time_since_traffic(&self) -> Duration {
        self.last_traffic.read().elapsed()
    }
}

/// Keep-alive manager for one connection.
///
/// # Example
///
/// ```rust,no_run
/// use trade_alert_proxy::infrastructure::polymarket::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, LivenessState,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(LivenessState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(10);
///     let cancel = CancellationToken::new();
///
///     let manager =
///         HeartbeatManager::new(HeartbeatConfig::default(), state.clone(), event_tx, cancel);
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => { /* write "PING" */ }
///             HeartbeatEvent::Stalled(_) => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<LivenessState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new keep-alive manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<LivenessState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver is dropped, or a stall is detected.
    ///
    /// The first tick fires immediately, so a ping goes out right after the
    /// subscribe frame.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Keep-alive manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check_and_ping().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `Err(())` when the loop should exit.
    async fn check_and_ping(&self) -> Result<(), ()> {
        let silence = self.state.time_since_traffic();
        if silence > self.config.stall_after() {
            tracing::warn!(
                silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                limit_ms = u64::try_from(self.config.stall_after().as_millis()).unwrap_or(u64::MAX),
                "Upstream stalled"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Stalled(silence)).await;
            return Err(());
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Event channel closed, stopping keep-alive");
            return Err(());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.stall_after(), Duration::from_secs(10));
    }

    #[test]
    fn record_traffic_resets_silence() {
        let state = LivenessState::new();
        *state.last_traffic.write() = Instant::now()
            .checked_sub(Duration::from_secs(3))
            .unwrap();
        assert!(state.time_since_traffic() >= Duration::from_secs(3));

        state.record_traffic();
        assert!(state.time_since_traffic() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn first_ping_is_immediate() {
        let config = HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(30));
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let manager =
            HeartbeatManager::new(config, Arc::new(LivenessState::new()), event_tx, cancel.clone());

        let handle = tokio::spawn(manager.run());

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should not close");
        assert_eq!(event, HeartbeatEvent::SendPing);

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test]
    async fn silence_past_grace_reports_stall() {
        let config = HeartbeatConfig::new(Duration::from_millis(50), Duration::from_millis(50));
        let state = Arc::new(LivenessState::new());
        *state.last_traffic.write() = Instant::now()
            .checked_sub(Duration::from_millis(500))
            .unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let manager = HeartbeatManager::new(config, state, event_tx, CancellationToken::new());

        let handle = tokio::spawn(manager.run());

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, HeartbeatEvent::Stalled(d) if d >= Duration::from_millis(500)));

        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("manager should exit after a stall")
            .unwrap();
    }

    #[tokio::test]
    async fn manager_cancellation() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(10));
        let (event_tx, _event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let manager =
            HeartbeatManager::new(config, Arc::new(LivenessState::new()), event_tx, cancel.clone());

        let handle = tokio::spawn(manager.run());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
