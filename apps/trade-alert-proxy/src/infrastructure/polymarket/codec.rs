//! Market Channel Codec
//!
//! Decodes inbound text frames into trade messages. A frame is either a
//! single event object or an array of them; anything that is not a
//! `last_trade_price` event is skipped.

use serde_json::Value;

use super::messages::{LAST_TRADE_PRICE, LastTradePriceMessage, PONG};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame was not valid JSON.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame was JSON but neither an object nor an array.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the market channel.
#[derive(Debug, Default, Clone)]
pub struct MarketCodec;

impl MarketCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into the trade messages it carries.
    ///
    /// Keep-alive replies decode to an empty list. Array elements that are not
    /// trade events, or trade events with malformed fields, are skipped with a
    /// warning so that one bad element does not drop the rest of the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON or is a JSON scalar.
    pub fn decode(&self, text: &str) -> Result<Vec<LastTradePriceMessage>, CodecError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == PONG {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<Value>(trimmed)? {
            Value::Array(items) => Ok(items.into_iter().filter_map(Self::decode_event).collect()),
            value @ Value::Object(_) => Ok(Self::decode_event(value).into_iter().collect()),
            _ => Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}",
                preview(trimmed)
            ))),
        }
    }

    fn decode_event(value: Value) -> Option<LastTradePriceMessage> {
        if value.get("event_type").and_then(Value::as_str) != Some(LAST_TRADE_PRICE) {
            return None;
        }

        match serde_json::from_value::<LastTradePriceMessage>(value) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed trade event");
                None
            }
        }
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(idx, _)| idx);
    &text[..end]
}
