//! Durable bus configuration.

use serde::Deserialize;

/// Topology and delivery settings for [`DurableEventBus`](super::DurableEventBus).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurableBusConfig {
    /// Durable topic exchange events are published to.
    pub exchange: String,
    /// Durable topic exchange rejected messages are routed to.
    pub dead_letter_exchange: String,
    /// Unacknowledged deliveries allowed per consumer.
    pub prefetch: u16,
    /// Wait for broker confirms before a publish resolves.
    pub publisher_confirms: bool,
    /// Reconnection tuning.
    pub reconnect: ReconnectConfig,
}

/// Reconnection and publish-buffer tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect after unexpected loss. When off, loss closes the bus.
    pub enabled: bool,
    /// Delay before the first attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Give up after this many failed attempts; `0` retries forever.
    pub max_attempts: u32,
    /// Publishes held while reconnecting before new ones are refused.
    pub buffer_capacity: usize,
}

impl Default for DurableBusConfig {
    fn default() -> Self {
        Self {
            exchange: "events".to_string(),
            dead_letter_exchange: "dlx".to_string(),
            prefetch: 10,
            publisher_confirms: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 0,
            buffer_capacity: 1000,
        }
    }
}
