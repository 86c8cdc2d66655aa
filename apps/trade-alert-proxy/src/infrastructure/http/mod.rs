//! Command, Health and Metrics Endpoint
//!
//! HTTP surface for subscribers and operators.
//!
//! # Endpoints
//!
//! - `GET /get-live-trades/{slug}?chat_id=` - Watch with the default threshold
//! - `GET /get-live-trades/{slug}/{limit}?chat_id=` - Watch with a threshold
//! - `GET /untrack/{slug}?chat_id=` - Unwatch
//! - `DELETE /subscribers/{chat_id}` - Remove every subscription of a subscriber
//! - `GET /health` - JSON health status with per-feed worker state
//! - `GET /healthz` - Liveness probe
//! - `GET /readyz` - Readiness probe (resync finished)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ResolveError, SubscriberDirectory};
use crate::application::services::{StreamManager, UnwatchOutcome, WatchError, WatchService};
use crate::domain::streaming::{WorkerSnapshot, WorkerState};
use crate::domain::subscription::{FeedId, SubscriberId};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Whether startup resync has completed.
    pub ready: bool,
    /// (feed, subscriber) entries in the directory.
    pub subscriptions: usize,
    /// One entry per live feed worker.
    pub workers: Vec<WorkerSnapshot>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Ready and every worker has an open subscription.
    Healthy,
    /// Ready, but some workers are connecting or closing.
    Degraded,
    /// Not ready yet.
    Unhealthy,
}

/// Reply to a successful watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    /// Subscriber.
    pub subscriber_id: SubscriberId,
    /// Feed watched.
    pub feed_id: FeedId,
    /// Threshold in effect.
    #[serde(with = "rust_decimal::serde::str")]
    pub threshold_usd: Decimal,
}

/// Reply to a successful unwatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwatchResponse {
    /// Subscriber.
    pub subscriber_id: SubscriberId,
    /// Feed no longer watched.
    pub feed_id: FeedId,
    /// Whether the feed's upstream connection was released.
    pub worker_stopped: bool,
}

/// Reply to a subscriber removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovedResponse {
    /// Subscriber.
    pub subscriber_id: SubscriberId,
    /// Feeds that were unwatched.
    pub feeds: Vec<FeedId>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SubscriberQuery {
    chat_id: SubscriberId,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the HTTP server.
pub struct AppState {
    version: String,
    started_at: Instant,
    watch: Arc<WatchService>,
    manager: Arc<StreamManager>,
    directory: Arc<dyn SubscriberDirectory>,
}

impl AppState {
    /// Create new server state.
    #[must_use]
    pub fn new(
        version: String,
        watch: Arc<WatchService>,
        manager: Arc<StreamManager>,
        directory: Arc<dyn SubscriberDirectory>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            watch,
            manager,
            directory,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/get-live-trades/{slug}", get(watch_default_handler))
        .route("/get-live-trades/{slug}/{limit}", get(watch_handler))
        .route("/untrack/{slug}", get(unwatch_handler))
        .route("/subscribers/{chat_id}", delete(remove_subscriber_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// HTTP server for commands and health checks.
pub struct HttpServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn watch_default_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<SubscriberQuery>,
) -> Response {
    watch(&state, query.chat_id, &slug, None).await
}

async fn watch_handler(
    State(state): State<Arc<AppState>>,
    Path((slug, limit)): Path<(String, String)>,
    Query(query): Query<SubscriberQuery>,
) -> Response {
    let Ok(threshold) = Decimal::from_str(limit.trim()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("threshold must be a number, got {limit:?}"),
        );
    };
    watch(&state, query.chat_id, &slug, Some(threshold)).await
}

async fn watch(
    state: &AppState,
    subscriber_id: SubscriberId,
    slug: &str,
    threshold: Option<Decimal>,
) -> Response {
    match state.watch.watch(subscriber_id, slug, threshold).await {
        Ok(subscription) => (
            StatusCode::OK,
            Json(WatchResponse {
                subscriber_id: subscription.subscriber_id,
                feed_id: subscription.feed_id,
                threshold_usd: subscription.threshold_usd,
            }),
        )
            .into_response(),
        Err(e) => watch_error_response(&e),
    }
}

async fn unwatch_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<SubscriberQuery>,
) -> Response {
    match state.watch.unwatch(query.chat_id, &slug).await {
        Ok(UnwatchOutcome::Stopped { worker_stopped }) => (
            StatusCode::OK,
            Json(UnwatchResponse {
                subscriber_id: query.chat_id,
                feed_id: slug,
                worker_stopped,
            }),
        )
            .into_response(),
        Ok(UnwatchOutcome::NotFound) => error_response(
            StatusCode::NOT_FOUND,
            format!("subscriber {} is not tracking {slug}", query.chat_id),
        ),
        Err(e) => watch_error_response(&e),
    }
}

async fn remove_subscriber_handler(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<SubscriberId>,
) -> Response {
    match state.watch.remove_subscriber(chat_id).await {
        Ok(feeds) => (
            StatusCode::OK,
            Json(RemovedResponse {
                subscriber_id: chat_id,
                feeds,
            }),
        )
            .into_response(),
        Err(e) => watch_error_response(&e),
    }
}

fn watch_error_response(err: &WatchError) -> Response {
    let status = match err {
        WatchError::InvalidThreshold(_) => StatusCode::BAD_REQUEST,
        WatchError::Resolution {
            source: ResolveError::NotFound(_),
            ..
        } => StatusCode::NOT_FOUND,
        WatchError::Resolution { .. } => StatusCode::BAD_GATEWAY,
        WatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        WatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        tracing::warn!(error = %err, "Command failed");
    }
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

// =============================================================================
// Health Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.manager.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let ready = state.manager.is_ready();
    let workers = state.manager.snapshot();

    HealthResponse {
        status: determine_health_status(ready, &workers),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        ready,
        subscriptions: state.directory.total(),
        workers,
    }
}

fn determine_health_status(ready: bool, workers: &[WorkerSnapshot]) -> HealthStatus {
    if !ready {
        return HealthStatus::Unhealthy;
    }

    let all_open = workers
        .iter()
        .all(|w| matches!(w.state, WorkerState::Subscribed | WorkerState::Streaming));
    if all_open {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{
        FeedStreamer, FeedSubscription, MockFeedResolver, StreamFault, SubscriptionStore,
    };
    use crate::domain::streaming::{FeedMetadata, WorkerStatus};
    use crate::domain::subscription::FeedDirectory;
    use crate::infrastructure::persistence::InMemorySubscriptionStore;

    struct OpenStreamer;

    #[async_trait]
    impl FeedStreamer for OpenStreamer {
        async fn run(
            &self,
            _feed: FeedSubscription,
            cancel: CancellationToken,
            status: Arc<WorkerStatus>,
        ) -> Result<(), StreamFault> {
            status.set_state(WorkerState::Streaming);
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn app() -> (Router, Arc<StreamManager>) {
        let mut resolver = MockFeedResolver::new();
        resolver.expect_resolve().returning(|feed| match feed {
            "known-market" => Ok(FeedMetadata::default()),
            "flaky-market" => Err(ResolveError::Http("connection reset".to_string())),
            other => Err(ResolveError::NotFound(other.to_string())),
        });

        let store: Arc<dyn SubscriptionStore> = Arc::new(InMemorySubscriptionStore::new());
        let directory = Arc::new(FeedDirectory::new());
        let manager = Arc::new(StreamManager::new(
            Arc::new(resolver),
            Arc::new(OpenStreamer),
            Arc::clone(&directory) as Arc<dyn SubscriberDirectory>,
            Arc::clone(&store),
            CancellationToken::new(),
        ));
        let watch = Arc::new(WatchService::new(
            store,
            Arc::clone(&directory) as Arc<dyn SubscriberDirectory>,
            Arc::clone(&manager),
            Decimal::from(10_000),
        ));
        let state = Arc::new(AppState::new(
            "test".to_string(),
            watch,
            Arc::clone(&manager),
            directory,
        ));
        (router(state), manager)
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn watch_with_default_threshold() {
        let (app, manager) = app();

        let (status, body) = send(&app, "GET", "/get-live-trades/known-market?chat_id=7").await;
        assert_eq!(status, StatusCode::OK);
        let reply: WatchResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(reply.subscriber_id, 7);
        assert_eq!(reply.feed_id, "known-market");
        assert_eq!(reply.threshold_usd, Decimal::from(10_000));
        assert!(manager.has_worker("known-market"));
    }

    #[tokio::test]
    async fn watch_with_explicit_threshold() {
        let (app, _manager) = app();

        let (status, body) =
            send(&app, "GET", "/get-live-trades/known-market/2500.5?chat_id=7").await;
        assert_eq!(status, StatusCode::OK);
        let reply: WatchResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(reply.threshold_usd, Decimal::new(25005, 1));
    }

    #[tokio::test]
    async fn bad_thresholds_are_rejected() {
        let (app, manager) = app();

        let (status, _) = send(&app, "GET", "/get-live-trades/known-market/-5?chat_id=7").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "GET", "/get-live-trades/known-market/lots?chat_id=7").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(manager.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn missing_chat_id_is_rejected() {
        let (app, _manager) = app();

        let (status, _) = send(&app, "GET", "/get-live-trades/known-market").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn resolution_failures_map_to_status() {
        let (app, manager) = app();

        let (status, _) = send(&app, "GET", "/get-live-trades/no-such-market?chat_id=7").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/get-live-trades/flaky-market?chat_id=7").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(manager.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn untrack_stops_last_worker() {
        let (app, manager) = app();
        send(&app, "GET", "/get-live-trades/known-market?chat_id=7").await;

        let (status, body) = send(&app, "GET", "/untrack/known-market?chat_id=7").await;
        assert_eq!(status, StatusCode::OK);
        let reply: UnwatchResponse = serde_json::from_str(&body).unwrap();
        assert!(reply.worker_stopped);
        assert!(!manager.has_worker("known-market"));
    }

    #[tokio::test]
    async fn untrack_unknown_is_not_found() {
        let (app, _manager) = app();

        let (status, body) = send(&app, "GET", "/untrack/known-market?chat_id=7").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("not tracking"));
    }

    #[tokio::test]
    async fn delete_subscriber_removes_all_feeds() {
        let (app, manager) = app();
        send(&app, "GET", "/get-live-trades/known-market?chat_id=7").await;

        let (status, body) = send(&app, "DELETE", "/subscribers/7").await;
        assert_eq!(status, StatusCode::OK);
        let reply: RemovedResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(reply.feeds, vec!["known-market".to_string()]);
        assert!(manager.active_feeds().is_empty());
    }

    #[tokio::test]
    async fn readiness_follows_resync() {
        let (app, manager) = app();

        let (status, body) = send(&app, "GET", "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOT READY");

        manager.resync().await.unwrap();

        let (status, body) = send(&app, "GET", "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "READY");

        let (status, body) = send(&app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["ready"], true);
        assert_eq!(health["version"], "test");
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let (app, _manager) = app();
        let (status, body) = send(&app, "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_from_workers() {
        let streaming = WorkerStatus::new("a");
        streaming.set_state(WorkerState::Streaming);
        let connecting = WorkerStatus::new("b");

        assert_eq!(determine_health_status(false, &[]), HealthStatus::Unhealthy);
        assert_eq!(determine_health_status(true, &[]), HealthStatus::Healthy);
        assert_eq!(
            determine_health_status(true, &[streaming.snapshot()]),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(true, &[streaming.snapshot(), connecting.snapshot()]),
            HealthStatus::Degraded
        );
    }
}
