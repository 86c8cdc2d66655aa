//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - [`StreamManager`]: one upstream worker per watched feed
//! - [`WatchService`]: watch, unwatch and subscriber removal

pub mod stream_manager;
pub mod watch;

pub use stream_manager::{ManagerError, ResyncReport, StreamManager};
pub use watch::{UnwatchOutcome, WatchError, WatchService};
