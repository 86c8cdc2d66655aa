//! Turso-backed subscription store.
//!
//! One row per `(subscriber_id, feed_id)`. Thresholds are stored as decimal
//! text so that no precision is lost across restarts.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use turso::{Builder, Connection, Database, Value};

use crate::application::ports::{StoreError, SubscriptionStore};
use crate::domain::subscription::{SubscriberId, Subscription};

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS subscriptions (
        subscriber_id INTEGER NOT NULL,
        feed_id TEXT NOT NULL,
        threshold_usd TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (subscriber_id, feed_id)
    )
";

/// Subscription store persisted in a local Turso database file.
///
/// All statements run on a single connection behind an async mutex, which
/// also makes the select-then-write in [`SubscriptionStore::upsert`] atomic
/// within the process.
pub struct TursoSubscriptionStore {
    _db: Database,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for TursoSubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TursoSubscriptionStore").finish_non_exhaustive()
    }
}

impl TursoSubscriptionStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the file cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Persistence(e.to_string()))?;
        }

        let db = Builder::new_local(&path.to_string_lossy())
            .build()
            .await
            .map_err(persistence)?;
        let conn = db.connect().map_err(persistence)?;
        conn.execute(CREATE_TABLE, ()).await.map_err(persistence)?;

        tracing::info!(path = %path.display(), "Subscription store opened");

        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    async fn find(
        conn: &Connection,
        subscriber_id: SubscriberId,
        feed_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut rows = conn
            .query(
                "SELECT subscriber_id, feed_id, threshold_usd FROM subscriptions \
                 WHERE subscriber_id = ?1 AND feed_id = ?2",
                vec![
                    Value::Integer(subscriber_id),
                    Value::Text(feed_id.to_string()),
                ],
            )
            .await
            .map_err(persistence)?;

        match rows.next().await.map_err(persistence)? {
            Some(row) => Ok(Some(row_to_subscription(&row)?)),
            None => Ok(None),
        }
    }

    async fn select_all(
        conn: &Connection,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let mut rows = conn.query(sql, params).await.map_err(persistence)?;
        let mut subscriptions = Vec::new();

        while let Some(row) = rows.next().await.map_err(persistence)? {
            subscriptions.push(row_to_subscription(&row)?);
        }

        Ok(subscriptions)
    }
}

#[async_trait]
impl SubscriptionStore for TursoSubscriptionStore {
    async fn upsert(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<Subscription>, StoreError> {
        let conn = self.conn.lock().await;
        let previous =
            Self::find(&conn, subscription.subscriber_id, &subscription.feed_id).await?;

        let threshold = Value::Text(subscription.threshold_usd.to_string());
        let updated_at = Value::Text(Utc::now().to_rfc3339());
        let subscriber_id = Value::Integer(subscription.subscriber_id);
        let feed_id = Value::Text(subscription.feed_id.clone());

        if previous.is_some() {
            conn.execute(
                "UPDATE subscriptions SET threshold_usd = ?1, updated_at = ?2 \
                 WHERE subscriber_id = ?3 AND feed_id = ?4",
                vec![threshold, updated_at, subscriber_id, feed_id],
            )
            .await
            .map_err(persistence)?;
        } else {
            conn.execute(
                "INSERT INTO subscriptions (subscriber_id, feed_id, threshold_usd, updated_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                vec![subscriber_id, feed_id, threshold, updated_at],
            )
            .await
            .map_err(persistence)?;
        }

        tracing::debug!(
            subscriber_id = subscription.subscriber_id,
            feed_id = %subscription.feed_id,
            threshold = %subscription.threshold_usd,
            "Subscription saved"
        );
        Ok(previous)
    }

    async fn delete(
        &self,
        subscriber_id: SubscriberId,
        feed_id: &str,
    ) -> Result<Subscription, StoreError> {
        let conn = self.conn.lock().await;
        let existing = Self::find(&conn, subscriber_id, feed_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                subscriber_id,
                feed_id: feed_id.to_string(),
            })?;

        conn.execute(
            "DELETE FROM subscriptions WHERE subscriber_id = ?1 AND feed_id = ?2",
            vec![
                Value::Integer(subscriber_id),
                Value::Text(feed_id.to_string()),
            ],
        )
        .await
        .map_err(persistence)?;

        Ok(existing)
    }

    async fn delete_subscriber(
        &self,
        subscriber_id: SubscriberId,
    ) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.conn.lock().await;
        let existing = Self::select_all(
            &conn,
            "SELECT subscriber_id, feed_id, threshold_usd FROM subscriptions \
             WHERE subscriber_id = ?1",
            vec![Value::Integer(subscriber_id)],
        )
        .await?;

        if !existing.is_empty() {
            conn.execute(
                "DELETE FROM subscriptions WHERE subscriber_id = ?1",
                vec![Value::Integer(subscriber_id)],
            )
            .await
            .map_err(persistence)?;
        }

        Ok(existing)
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.conn.lock().await;
        Self::select_all(
            &conn,
            "SELECT subscriber_id, feed_id, threshold_usd FROM subscriptions",
            Vec::new(),
        )
        .await
    }
}

fn row_to_subscription(row: &turso::Row) -> Result<Subscription, StoreError> {
    let subscriber_id = match row.get_value(0).map_err(persistence)? {
        Value::Integer(id) => id,
        other => return Err(corrupt("subscriber_id", &other)),
    };
    let feed_id = match row.get_value(1).map_err(persistence)? {
        Value::Text(feed) => feed,
        other => return Err(corrupt("feed_id", &other)),
    };
    let threshold_usd = match row.get_value(2).map_err(persistence)? {
        Value::Text(text) => Decimal::from_str(&text)
            .map_err(|e| StoreError::Persistence(format!("bad threshold {text:?}: {e}")))?,
        other => return Err(corrupt("threshold_usd", &other)),
    };

    Ok(Subscription {
        subscriber_id,
        feed_id,
        threshold_usd,
    })
}

fn corrupt(column: &str, value: &Value) -> StoreError {
    StoreError::Persistence(format!("unexpected value in {column}: {value:?}"))
}

fn persistence(err: turso::Error) -> StoreError {
    StoreError::Persistence(err.to_string())
}
