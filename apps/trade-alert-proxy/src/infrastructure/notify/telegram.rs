//! Telegram Bot API gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::application::ports::{GatewayError, NotificationGateway};
use crate::domain::subscription::SubscriberId;

/// Default Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: SubscriberId,
    text: &'a str,
}

/// Delivers alerts as chat messages through `sendMessage`.
///
/// Subscriber identifiers are Telegram chat ids.
pub struct TelegramGateway {
    client: reqwest::Client,
    send_url: String,
}

impl std::fmt::Debug for TelegramGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramGateway")
            .field("send_url", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl TelegramGateway {
    /// Create a gateway for `bot_token`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn new(bot_token: &str, timeout: Duration) -> Result<Self, GatewayError> {
        Self::with_base_url(DEFAULT_TELEGRAM_API_URL, bot_token, timeout)
    }

    /// Create a gateway against a custom API base (used by tests).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn with_base_url(
        base_url: &str,
        bot_token: &str,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            send_url: format!(
                "{}/bot{bot_token}/sendMessage",
                base_url.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl NotificationGateway for TelegramGateway {
    async fn deliver(&self, subscriber_id: SubscriberId, text: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(&self.send_url)
            .json(&SendMessage {
                chat_id: subscriber_id,
                text,
            })
            .send()
            .await
            // reqwest errors embed the URL, which carries the bot token
            .map_err(|e| GatewayError::Transport(e.without_url().to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected { status, body });
        }

        Ok(())
    }
}

/// Gateway that only logs alerts. Used when no bot token is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingGateway;

#[async_trait]
impl NotificationGateway for LoggingGateway {
    async fn deliver(&self, subscriber_id: SubscriberId, text: &str) -> Result<(), GatewayError> {
        tracing::info!(subscriber_id, alert = text, "Alert");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn posts_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(json!({"chat_id": 42, "text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let gateway =
            TelegramGateway::with_base_url(&server.uri(), "123:abc", Duration::from_secs(2))
                .unwrap();

        gateway.deliver(42, "hello").await.unwrap();
    }

    #[tokio::test]
    async fn rejection_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bot was blocked"))
            .mount(&server)
            .await;

        let gateway =
            TelegramGateway::with_base_url(&server.uri(), "t", Duration::from_secs(2)).unwrap();

        let err = gateway.deliver(1, "x").await.unwrap_err();

        assert_eq!(
            err,
            GatewayError::Rejected {
                status: 403,
                body: "bot was blocked".to_string()
            }
        );
    }

    #[test]
    fn debug_hides_token() {
        let gateway = TelegramGateway::new("secret-token", Duration::from_secs(1)).unwrap();
        assert!(!format!("{gateway:?}").contains("secret-token"));
    }

    #[tokio::test]
    async fn logging_gateway_always_succeeds() {
        assert!(LoggingGateway.deliver(1, "x").await.is_ok());
    }
}
