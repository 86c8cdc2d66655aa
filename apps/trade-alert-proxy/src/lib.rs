#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Trade Alert Proxy - Market Stream Multiplexer
//!
//! Keeps at most one upstream WebSocket connection per watched market, no
//! matter how many subscribers watch it, and turns every trade whose value
//! meets a subscriber's threshold into an alert for that subscriber.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `subscription`: Subscriptions, thresholds and the subscriber directory
//!   - `streaming`: Trade events, feed metadata and worker status
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Store, directory, resolver, streamer and gateway interfaces
//!   - `services`: Stream manager and watch/unwatch
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `polymarket`: Market channel streamer and Gamma market lookup
//!   - `persistence`: Turso and in-memory subscription stores
//!   - `notify`: Alert dispatcher, Telegram and logging gateways
//!   - `http`: Commands, health checks and metrics
//!   - `config`: Configuration from the environment
//!
//! # Data Flow
//!
//! ```text
//!                      ┌──────────────┐
//! market A ── WS ─────►│ Feed worker  │──┐
//!                      └──────────────┘  │   ┌────────────┐    ┌─────────┐
//!                      ┌──────────────┐  ├──►│ Dispatcher │───►│ Gateway │──► subscribers
//! market B ── WS ─────►│ Feed worker  │──┘   └────────────┘    └─────────┘
//!                      └──────────────┘
//!                         ▲ thresholds
//!                         │
//!                    Subscriber directory ◄── watch / unwatch ──► store
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{FeedMetadata, Side, TradeEvent, WorkerSnapshot, WorkerState};
pub use domain::subscription::{FeedDirectory, FeedId, SubscriberId, Subscription};

// Services
pub use application::services::{
    ManagerError, ResyncReport, StreamManager, UnwatchOutcome, WatchError, WatchService,
};

// Infrastructure config
pub use infrastructure::config::{AlertProxyConfig, ConfigError};

// HTTP server
pub use infrastructure::http::{AppState, HttpServer, HttpServerError, router};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
