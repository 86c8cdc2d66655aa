//! In-memory subscription store for tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{StoreError, SubscriptionStore};
use crate::domain::subscription::{FeedId, SubscriberId, Subscription};

/// In-memory implementation of [`SubscriptionStore`].
///
/// Not durable. Suitable for testing and development only.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: RwLock<HashMap<(SubscriberId, FeedId), Subscription>>,
}

impl InMemorySubscriptionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with subscriptions (for restart tests).
    #[must_use]
    pub fn with_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let store = Self::new();
        {
            let mut map = store.subscriptions.write();
            for sub in subscriptions {
                map.insert((sub.subscriber_id, sub.feed_id.clone()), sub);
            }
        }
        store
    }

    /// Number of stored subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn upsert(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<Subscription>, StoreError> {
        let key = (subscription.subscriber_id, subscription.feed_id.clone());
        Ok(self.subscriptions.write().insert(key, subscription.clone()))
    }

    async fn delete(
        &self,
        subscriber_id: SubscriberId,
        feed_id: &str,
    ) -> Result<Subscription, StoreError> {
        self.subscriptions
            .write()
            .remove(&(subscriber_id, feed_id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                subscriber_id,
                feed_id: feed_id.to_string(),
            })
    }

    async fn delete_subscriber(
        &self,
        subscriber_id: SubscriberId,
    ) -> Result<Vec<Subscription>, StoreError> {
        let mut map = self.subscriptions.write();
        let keys: Vec<_> = map
            .keys()
            .filter(|(id, _)| *id == subscriber_id)
            .cloned()
            .collect();

        Ok(keys.iter().filter_map(|key| map.remove(key)).collect())
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.subscriptions.read().values().cloned().collect())
    }
}
