//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration loading.
pub mod config;

/// HTTP command surface, health checks and metrics.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Notification gateways and the alert dispatcher.
pub mod notify;

/// Subscription store adapters.
pub mod persistence;

/// Polymarket market channel and market lookup.
pub mod polymarket;

/// OpenTelemetry tracing integration.
pub mod telemetry;
