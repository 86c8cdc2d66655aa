//! Alert Dispatcher
//!
//! Decouples feed workers from the notification gateway. Workers enqueue
//! alerts without awaiting; a fixed pool of delivery tasks drains the queue.
//! When the queue is full the alert is dropped and counted, so a slow
//! gateway never stalls an upstream read loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::NotificationGateway;
use crate::domain::subscription::SubscriberId;
use crate::infrastructure::metrics::{self, DeliveryOutcome};

/// One alert waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Recipient.
    pub subscriber_id: SubscriberId,
    /// Rendered alert text.
    pub text: String,
}

/// Delivery pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Number of concurrent delivery tasks.
    pub workers: usize,
    /// Alerts buffered before new ones are dropped.
    pub queue_capacity: usize,
    /// Upper bound on a single gateway call.
    pub delivery_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

/// Cheap, cloneable handle used by feed workers to enqueue alerts.
#[derive(Debug, Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Alert>,
}

impl AlertDispatcher {
    /// Start the delivery pool.
    ///
    /// The pool stops when `cancel` fires or every [`AlertDispatcher`] clone
    /// has been dropped and the queue is empty.
    #[must_use]
    pub fn spawn(
        gateway: Arc<dyn NotificationGateway>,
        config: DispatcherConfig,
        cancel: CancellationToken,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let tasks = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(delivery_loop(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&gateway),
                    config.delivery_timeout,
                    cancel.clone(),
                ))
            })
            .collect();

        (Self { tx }, DispatcherHandle { tasks })
    }

    /// Enqueue an alert without waiting.
    ///
    /// Returns `false` when the alert was dropped.
    pub fn dispatch(&self, subscriber_id: SubscriberId, text: impl Into<String>) -> bool {
        let alert = Alert {
            subscriber_id,
            text: text.into(),
        };

        match self.tx.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                tracing::warn!(
                    subscriber_id = alert.subscriber_id,
                    "Alert queue full, dropping alert"
                );
                metrics::record_alert_dropped("queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                tracing::debug!(
                    subscriber_id = alert.subscriber_id,
                    "Alert queue closed, dropping alert"
                );
                metrics::record_alert_dropped("closed");
                false
            }
        }
    }
}

/// Join handle for the delivery pool.
#[derive(Debug)]
pub struct DispatcherHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Wait for every delivery task to exit.
    pub async fn join(self) {
        for result in futures_util::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
    }
}

async fn delivery_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Alert>>>,
    gateway: Arc<dyn NotificationGateway>,
    delivery_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = cancel.cancelled() => None,
                alert = rx.recv() => alert,
            }
        };

        let Some(alert) = next else {
            tracing::debug!(worker, "Delivery task stopping");
            return;
        };

        deliver(gateway.as_ref(), &alert, delivery_timeout).await;
    }
}

async fn deliver(gateway: &dyn NotificationGateway, alert: &Alert, limit: Duration) {
    let started = Instant::now();

    let outcome = match tokio::time::timeout(limit, gateway.deliver(alert.subscriber_id, &alert.text)).await {
        Ok(Ok(())) => DeliveryOutcome::Delivered,
        Ok(Err(e)) => {
            tracing::warn!(subscriber_id = alert.subscriber_id, error = %e, "Alert delivery failed");
            DeliveryOutcome::Failed
        }
        Err(_) => {
            tracing::warn!(
                subscriber_id = alert.subscriber_id,
                timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "Alert delivery timed out"
            );
            DeliveryOutcome::TimedOut
        }
    };

    metrics::record_delivery(outcome, started.elapsed());
}
