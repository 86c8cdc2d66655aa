//! Persistence Adapters
//!
//! Implementations of the [`SubscriptionStore`](crate::application::ports::SubscriptionStore) port.

pub mod in_memory;
pub mod turso;

pub use in_memory::InMemorySubscriptionStore;
pub use turso::TursoSubscriptionStore;
