//! Domain Layer - Core subscription and streaming types.
//!
//! Pure types and in-process structures with no I/O.

/// Trade events, feed metadata and worker state.
pub mod streaming;

/// Subscriptions and the per-feed subscriber directory.
pub mod subscription;
