//! Notification Adapters
//!
//! - [`AlertDispatcher`]: bounded queue plus delivery pool in front of a gateway
//! - [`TelegramGateway`]: Telegram Bot API `sendMessage`
//! - [`LoggingGateway`]: writes alerts to the log

pub mod dispatcher;
pub mod telegram;

pub use dispatcher::{Alert, AlertDispatcher, DispatcherConfig, DispatcherHandle};
pub use telegram::{LoggingGateway, TelegramGateway};
