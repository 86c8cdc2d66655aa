//! Configuration Module
//!
//! Configuration loading for the trade alert proxy.

mod settings;

pub use settings::{
    AlertProxyConfig, BotToken, ConfigError, DeliverySettings, ServerSettings, UpstreamSettings,
};
