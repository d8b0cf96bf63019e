//! AMQP connection configuration.

use serde::Deserialize;

/// Where and how to reach the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP URI, including vhost.
    pub url: String,
    /// Name shown for the connection in the broker's management UI.
    pub connection_name: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672/%2f".to_string(),
            connection_name: "courier".to_string(),
        }
    }
}
