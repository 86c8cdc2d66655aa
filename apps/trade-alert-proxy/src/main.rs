//! Trade Alert Proxy Binary
//!
//! Starts the trade alert proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trade-alert-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `BOT_TOKEN`: Telegram bot token (alerts are only logged without it)
//! - `DATABASE_PATH`: Subscription database file (default: trade-alerts.db)
//! - `POLY_API_BASE`: Gamma markets API (default: <https://gamma-api.polymarket.com>)
//! - `POLY_WS_URL`: Market channel WebSocket URL
//! - `WHALE_THRESHOLD`: Default alert threshold in USD (default: 10000)
//! - `ALERT_PROXY_HTTP_PORT`: HTTP port (default: 5000)
//! - `ALERT_PROXY_PING_INTERVAL_SECS`: Keep-alive interval (default: 5)
//! - `ALERT_PROXY_STALL_GRACE_SECS`: Extra silence before a stall (default: 5)
//! - `ALERT_PROXY_RECONNECT_ATTEMPTS`: Reconnects after a fault (default: 0)
//! - `ALERT_PROXY_DELIVERY_WORKERS`: Concurrent deliveries (default: 4)
//! - `ALERT_PROXY_DELIVERY_QUEUE`: Alert queue capacity (default: 1024)
//! - `ALERT_PROXY_RESOLVER_TIMEOUT_SECS`: Market lookup timeout (default: 10)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: trade-alert-proxy)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use trade_alert_proxy::application::ports::{
    FeedResolver, FeedStreamer, NotificationGateway, SubscriberDirectory, SubscriptionStore,
};
use trade_alert_proxy::infrastructure::http::{AppState, HttpServer};
use trade_alert_proxy::infrastructure::notify::{
    AlertDispatcher, DispatcherConfig, LoggingGateway, TelegramGateway,
};
use trade_alert_proxy::infrastructure::persistence::TursoSubscriptionStore;
use trade_alert_proxy::infrastructure::polymarket::{
    GammaFeedResolver, HeartbeatConfig, PolymarketStreamer, ReconnectConfig, StreamerConfig,
};
use trade_alert_proxy::infrastructure::telemetry;
use trade_alert_proxy::{
    AlertProxyConfig, FeedDirectory, StreamManager, WatchService, init_metrics,
};

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Trade Alert Proxy");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Metrics recorder not installed");
    }

    let config = AlertProxyConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let delivery_token = CancellationToken::new();

    // Subscriptions and the in-memory directory
    let store: Arc<dyn SubscriptionStore> = Arc::new(
        TursoSubscriptionStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    let directory = Arc::new(FeedDirectory::new());
    let directory_port: Arc<dyn SubscriberDirectory> = Arc::clone(&directory) as _;

    // Alert delivery
    let gateway: Arc<dyn NotificationGateway> = match &config.bot_token {
        Some(token) => Arc::new(
            TelegramGateway::new(token.expose(), config.delivery.timeout)
                .context("building Telegram client")?,
        ),
        None => {
            tracing::warn!("BOT_TOKEN not set, alerts will only be logged");
            Arc::new(LoggingGateway)
        }
    };
    let (dispatcher, dispatcher_handle) = AlertDispatcher::spawn(
        gateway,
        DispatcherConfig {
            workers: config.delivery.workers,
            queue_capacity: config.delivery.queue_capacity,
            delivery_timeout: config.delivery.timeout,
        },
        delivery_token.clone(),
    );

    // Upstream adapters
    let resolver: Arc<dyn FeedResolver> = Arc::new(
        GammaFeedResolver::new(
            config.upstream.api_base.clone(),
            config.upstream.resolver_timeout,
        )
        .context("building market lookup client")?,
    );
    let streamer: Arc<dyn FeedStreamer> = Arc::new(PolymarketStreamer::new(
        StreamerConfig {
            url: config.upstream.ws_url.clone(),
            heartbeat: HeartbeatConfig::new(
                config.upstream.ping_interval,
                config.upstream.stall_grace,
            ),
            reconnect: ReconnectConfig::with_max_attempts(config.upstream.reconnect_attempts),
        },
        Arc::clone(&directory_port),
        dispatcher,
    ));

    // Stream manager and subscriber operations
    let manager = Arc::new(StreamManager::new(
        resolver,
        streamer,
        Arc::clone(&directory_port),
        Arc::clone(&store),
        shutdown_token.child_token(),
    ));
    let watch = Arc::new(WatchService::new(
        store,
        Arc::clone(&directory_port),
        Arc::clone(&manager),
        config.default_threshold,
    ));

    // HTTP server comes up before resync so probes can see readiness change
    let app_state = Arc::new(AppState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        watch,
        Arc::clone(&manager),
        directory_port,
    ));
    let http_server = HttpServer::new(config.server.http_port, app_state, shutdown_token.clone());
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // The manager logs the resync summary and each feed that failed
    if let Err(e) = manager.resync().await {
        tracing::error!(error = %e, "Resync failed");
        shutdown_token.cancel();
    }

    await_shutdown(shutdown_token.clone()).await;

    let shutdown = async {
        manager.drain().await;
        delivery_token.cancel();
        dispatcher_handle.join().await;
        let _ = http_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!(directory_entries = directory.total(), "Trade Alert Proxy stopped");
    Ok(())
}

fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &AlertProxyConfig) {
    tracing::info!(
        http_port = config.server.http_port,
        database_path = %config.database_path.display(),
        default_threshold = %config.default_threshold,
        telegram = config.bot_token.is_some(),
        "Configuration loaded"
    );
    tracing::debug!(
        api_base = %config.upstream.api_base,
        ws_url = %config.upstream.ws_url,
        reconnect_attempts = config.upstream.reconnect_attempts,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT), or for an earlier cancel.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {}
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
