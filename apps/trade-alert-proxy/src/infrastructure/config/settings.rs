//! Proxy Configuration Settings
//!
//! Configuration types for the trade alert proxy, loaded from environment
//! variables. Every setting has a default except the bot token, whose absence
//! switches delivery to the logging gateway.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::infrastructure::polymarket::{DEFAULT_GAMMA_BASE_URL, DEFAULT_MARKET_WS_URL};

/// Telegram bot token.
#[derive(Clone)]
pub struct BotToken(String);

impl BotToken {
    /// Wrap a raw token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the raw token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for BotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BotToken([REDACTED])")
    }
}

/// Upstream market data settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Gamma markets API base URL.
    pub api_base: String,
    /// Market channel WebSocket URL.
    pub ws_url: String,
    /// Timeout for market lookups.
    pub resolver_timeout: Duration,
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// Silence tolerated beyond one ping interval before a connection is dead.
    pub stall_grace: Duration,
    /// Reconnection attempts after a fault (0 = close instead of reconnecting).
    pub reconnect_attempts: u32,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GAMMA_BASE_URL.to_string(),
            ws_url: DEFAULT_MARKET_WS_URL.to_string(),
            resolver_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(5),
            stall_grace: Duration::from_secs(5),
            reconnect_attempts: 0,
        }
    }
}

/// Alert delivery settings.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Concurrent delivery tasks.
    pub workers: usize,
    /// Alerts buffered before new ones are dropped.
    pub queue_capacity: usize,
    /// Bound on a single gateway call.
    pub timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// HTTP port for commands, health checks and metrics.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 5000 }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct AlertProxyConfig {
    /// Telegram bot token; `None` logs alerts instead of sending them.
    pub bot_token: Option<BotToken>,
    /// Subscription database file.
    pub database_path: PathBuf,
    /// Threshold applied when a watch request does not name one.
    pub default_threshold: Decimal,
    /// Upstream settings.
    pub upstream: UpstreamSettings,
    /// Delivery settings.
    pub delivery: DeliverySettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl Default for AlertProxyConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            default_threshold: Decimal::from(DEFAULT_THRESHOLD_USD),
            upstream: UpstreamSettings::default(),
            delivery: DeliverySettings::default(),
            server: ServerSettings::default(),
        }
    }
}

const DEFAULT_DATABASE_PATH: &str = "trade-alerts.db";
const DEFAULT_THRESHOLD_USD: u32 = 10_000;

impl AlertProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bot_token = lookup("BOT_TOKEN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(BotToken::new);

        let database_path = match lookup("DATABASE_PATH") {
            Some(v) if v.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("DATABASE_PATH".to_string()));
            }
            Some(v) => PathBuf::from(v),
            None => defaults.database_path,
        };

        let default_threshold = match lookup("WHALE_THRESHOLD") {
            Some(raw) => parse_threshold(&raw)
                .ok_or_else(|| ConfigError::InvalidValue("WHALE_THRESHOLD".to_string(), raw))?,
            None => defaults.default_threshold,
        };

        let upstream = UpstreamSettings {
            api_base: lookup("POLY_API_BASE").unwrap_or(defaults.upstream.api_base),
            ws_url: lookup("POLY_WS_URL").unwrap_or(defaults.upstream.ws_url),
            resolver_timeout: parse_duration_secs(
                lookup("ALERT_PROXY_RESOLVER_TIMEOUT_SECS"),
                defaults.upstream.resolver_timeout,
            ),
            ping_interval: parse_duration_secs(
                lookup("ALERT_PROXY_PING_INTERVAL_SECS"),
                defaults.upstream.ping_interval,
            ),
            stall_grace: parse_duration_secs(
                lookup("ALERT_PROXY_STALL_GRACE_SECS"),
                defaults.upstream.stall_grace,
            ),
            reconnect_attempts: parse_or(
                lookup("ALERT_PROXY_RECONNECT_ATTEMPTS"),
                defaults.upstream.reconnect_attempts,
            ),
        };

        let delivery = DeliverySettings {
            workers: parse_or(
                lookup("ALERT_PROXY_DELIVERY_WORKERS"),
                defaults.delivery.workers,
            )
            .max(1),
            queue_capacity: parse_or(
                lookup("ALERT_PROXY_DELIVERY_QUEUE"),
                defaults.delivery.queue_capacity,
            )
            .max(1),
            timeout: defaults.delivery.timeout,
        };

        let server = ServerSettings {
            http_port: parse_or(lookup("ALERT_PROXY_HTTP_PORT"), defaults.server.http_port),
        };

        Ok(Self {
            bot_token,
            database_path,
            default_threshold,
            upstream,
            delivery,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {0} has invalid value {1:?}")]
    InvalidValue(String, String),
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_duration_secs(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_threshold(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw.trim())
        .ok()
        .filter(|v| !v.is_sign_negative())
}
